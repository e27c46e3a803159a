//! Command Queue: a cluster-wide request/response channel under `/cmd/*`
//! (spec §4.5). A requester writes `<verb> <args>`; the authoritative handler
//! locks the key, performs the request, writes `success-...`/`failure-...`
//! back, then releases.

use std::time::Duration;

use crate::context::AgentContext;
use crate::error::ReconcileError;

/// How long the handler sleeps after writing the response so the requester
/// has a chance to observe it before the key is reused (spec §4.5).
const RESPONSE_SETTLE: Duration = Duration::from_millis(200);

pub struct Request {
    pub verb: String,
    pub args: String,
}

impl Request {
    pub fn parse(raw: &[u8]) -> Request {
        let text = String::from_utf8_lossy(raw);
        let mut parts = text.splitn(2, ' ');
        Request {
            verb: parts.next().unwrap_or_default().to_string(),
            args: parts.next().unwrap_or_default().to_string(),
        }
    }
}

/// A handler for one command-queue key. Must be idempotent: the ephemeral
/// lock is released automatically on a handler crash, and the request is
/// retried by whichever node's handler boots next (spec §4.5).
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &AgentContext, request: &Request) -> Result<String, ReconcileError>;
}

/// Drains one pending request at `path`, if any, running it under the
/// advisory lock so only one handler instance executes it at a time.
pub async fn process_once(
    ctx: &AgentContext,
    path: &str,
    handler: &dyn CommandHandler,
) -> Result<(), ReconcileError> {
    let lock_path = format!("{path}/.lock");
    if ctx.store.create(&lock_path, b"", true, false).await.is_err() {
        // Another handler already owns this request; an ephemeral lock left
        // by a crashed handler clears itself once its session times out.
        return Ok(());
    }
    let Some(raw) = ctx.store.read(path).await? else {
        return Ok(());
    };
    let text = String::from_utf8_lossy(&raw);
    if text.starts_with("success-") || text.starts_with("failure-") {
        return Ok(());
    }

    let request = Request::parse(&raw);
    let response = match handler.handle(ctx, &request).await {
        Ok(detail) => format!("success-{} {} {}", request.verb, request.args, detail),
        Err(err) => format!("failure-{} {} {}", request.verb, request.args, err),
    };
    ctx.store.write(path, response.as_bytes()).await?;
    tokio::time::sleep(RESPONSE_SETTLE).await;
    ctx.store.delete(&format!("{path}/.lock"), false).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvcd_coordinator::{CoordinationStore, FakeStore};
    use std::sync::Arc;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, _ctx: &AgentContext, request: &Request) -> Result<String, ReconcileError> {
            Ok(format!("ok:{}", request.args))
        }
    }

    #[tokio::test]
    async fn processes_pending_request_and_writes_response() {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::new());
        store.write("/cmd/domains", b"flush-locks abc-123").await.unwrap();
        let ctx = AgentContext::new(
            store.clone(),
            Arc::new(crate::config::NodeConfig::for_test("n1")),
            Arc::new(crate::context::SystemClock::default()),
        );

        process_once(&ctx, "/cmd/domains", &EchoHandler).await.unwrap();

        let raw = store.read("/cmd/domains").await.unwrap().unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("success-flush-locks abc-123 ok:abc-123"));
    }

    #[tokio::test]
    async fn ignores_an_already_answered_request() {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::new());
        store.write("/cmd/domains", b"success-flush-locks done").await.unwrap();
        let ctx = AgentContext::new(
            store.clone(),
            Arc::new(crate::config::NodeConfig::for_test("n1")),
            Arc::new(crate::context::SystemClock::default()),
        );

        process_once(&ctx, "/cmd/domains", &EchoHandler).await.unwrap();

        let raw = store.read("/cmd/domains").await.unwrap().unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), "success-flush-locks done");
    }
}
