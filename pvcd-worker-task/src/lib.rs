use anyhow::{bail, Error};

/// Abstraction shared by every long-running reconciliation loop (VM start/stop
/// waits, migration receive loops, node flush waits, DHCP daemon watchers).
///
/// A worker task is anything that can be asked to abort early, either because
/// the specific operation was cancelled (the desired state changed again) or
/// because the whole agent is shutting down.
pub trait WorkerTaskContext: Send + Sync {
    /// True if this particular operation should stop early.
    fn abort_requested(&self) -> bool;

    /// Fails with a reasonable error message if the operation should abort.
    fn check_abort(&self) -> Result<(), Error> {
        if self.abort_requested() {
            bail!("aborted - desired state changed");
        }
        Ok(())
    }

    /// True if the whole agent process has been asked to shut down.
    fn shutdown_requested(&self) -> bool;

    /// Fails with a reasonable error message if the agent is shutting down.
    fn fail_on_shutdown(&self) -> Result<(), Error> {
        if self.shutdown_requested() {
            bail!("agent shutdown requested - aborting task");
        }
        Ok(())
    }
}

impl<T: WorkerTaskContext + ?Sized> WorkerTaskContext for std::sync::Arc<T> {
    fn abort_requested(&self) -> bool {
        <T as WorkerTaskContext>::abort_requested(self)
    }

    fn check_abort(&self) -> Result<(), Error> {
        <T as WorkerTaskContext>::check_abort(self)
    }

    fn shutdown_requested(&self) -> bool {
        <T as WorkerTaskContext>::shutdown_requested(self)
    }

    fn fail_on_shutdown(&self) -> Result<(), Error> {
        <T as WorkerTaskContext>::fail_on_shutdown(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Ctx {
        abort: AtomicBool,
        shutdown: AtomicBool,
    }

    impl WorkerTaskContext for Ctx {
        fn abort_requested(&self) -> bool {
            self.abort.load(Ordering::Relaxed)
        }

        fn shutdown_requested(&self) -> bool {
            self.shutdown.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn check_abort_fails_once_requested() {
        let ctx = Ctx {
            abort: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        };
        assert!(ctx.check_abort().is_ok());
        ctx.abort.store(true, Ordering::Relaxed);
        assert!(ctx.check_abort().is_err());
        assert!(ctx.fail_on_shutdown().is_ok());
    }
}
