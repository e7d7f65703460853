//! Tracing setup for host applications.
//!
//! Libraries only emit; the embedding shell decides where logs go. This
//! helper wires the usual pair: a console layer filtered by `RUST_LOG`
//! (defaulting to info, debug for this crate), plus an optional
//! daily-rolling file layer.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging. Safe to call more than once; only the
/// first call installs a subscriber.
pub fn init(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mesa_offline=debug"));
    let console_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let appender = tracing_appender::rolling::daily(dir, "mesa-offline");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            let _ = registry.with(file_layer).try_init();
            // Dropping the guard flushes file logs; the engine runs until
            // process exit, so leak it intentionally.
            std::mem::forget(guard);
        }
        None => {
            let _ = registry.try_init();
        }
    }
}
