//! Storage Facade: request surface only (spec §4.6 budget note: "the heavy
//! lifting is delegated to the external block store's CLI/daemons"). Shells
//! to `rbd` the same way the Network Controller shells to `ip`/`nft`.

use pvcd_sys::run_foreground;
use uuid::Uuid;

use crate::context::AgentContext;
use crate::error::ReconcileError;
use crate::store;

fn process_error(program: &str, err: impl ToString) -> ReconcileError {
    ReconcileError::Process {
        program: program.to_string(),
        exit_code: -1,
        stderr: err.to_string(),
    }
}

pub struct Lock {
    pub id: String,
    pub locker: String,
}

/// `rbd lock ls <volume>`, parsed into lock id/locker pairs. The real output
/// format has a header row and column-aligned fields; callers only need the
/// first two whitespace-separated columns of each body row.
pub fn list_locks(volume: &str) -> Result<Vec<Lock>, ReconcileError> {
    let out = run_foreground("rbd", &["lock", "ls", volume])
        .map_err(|err| process_error("rbd", err))?
        .into_result()
        .map_err(|err| process_error("rbd", err))?;

    Ok(out
        .stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let id = cols.next()?.to_string();
            let locker = cols.next()?.to_string();
            Some(Lock { id, locker })
        })
        .collect())
}

pub fn remove_lock(volume: &str, lock: &Lock) -> Result<(), ReconcileError> {
    run_foreground("rbd", &["lock", "rm", volume, &lock.id, &lock.locker])
        .map_err(|err| process_error("rbd", err))?
        .into_result()
        .map(|_| ())
        .map_err(|err| process_error("rbd", err))
}

/// Lists and removes every stale lock on every volume in a domain's
/// `rbdlist` (spec §4.2 "Stuck-lock recovery"). Callers are responsible for
/// the precondition under which this is safe to run (spec §5: "stale locks
/// are removed only after the previous owner is confirmed down or the
/// domain is confirmed not `start`") — this function performs the mechanics
/// only.
pub async fn flush_domain_locks(ctx: &AgentContext, uuid: &Uuid) -> Result<(), ReconcileError> {
    let key = store::domain_path(uuid, "rbdlist");
    let volumes = match ctx.store.read(&key).await? {
        Some(raw) => pvcd_types::decode_list("rbdlist", &raw)
            .map_err(|err| ReconcileError::Validation(err.to_string()))?,
        None => Vec::new(),
    };

    for volume in volumes {
        for lock in list_locks(&volume)? {
            remove_lock(&volume, &lock)?;
        }
    }
    Ok(())
}
