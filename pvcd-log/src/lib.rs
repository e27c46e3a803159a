#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Structured logging for the node agent. A thin `tracing` setup: journald
//! when available (the normal systemd-supervised case), stderr otherwise.
//! Every controller receives its span through the explicit `AgentContext`
//! rather than reaching for a global logger.

use std::env;

use tracing_log::{AsLog, LogTracer};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

pub use tracing::{debug, debug_span, error, error_span, info, info_span, trace, warn, warn_span};
pub use tracing_subscriber::filter::LevelFilter as Level;

/// Initialize the global logger.
///
/// Reads `env_var_name` for a level override (e.g. `debug`, `info`),
/// otherwise uses `default_log_level`. Logs to journald if one is
/// reachable, falling back to stderr so the agent still produces
/// diagnosable output when run interactively or under a supervisor without
/// a journal (e.g. in tests or containers).
pub fn init_logger(env_var_name: &str, default_log_level: LevelFilter) -> Result<(), anyhow::Error> {
    let mut log_level = default_log_level;
    if let Ok(v) = env::var(env_var_name) {
        if let Ok(l) = v.parse::<LevelFilter>() {
            log_level = l;
        }
    }

    let journald = tracing_journald::layer().ok();
    let stderr = if journald.is_none() {
        Some(tracing_subscriber::fmt::layer().with_target(false))
    } else {
        None
    };

    let registry = tracing_subscriber::registry()
        .with(journald.with_filter(log_level))
        .with(stderr.with_filter(log_level));

    tracing::subscriber::set_global_default(registry)?;
    LogTracer::init_with_filter(log_level.as_log())?;
    Ok(())
}
