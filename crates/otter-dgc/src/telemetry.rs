//! Logging setup for hosts that have none.
//!
//! Events are written to stderr through a non-blocking writer: the
//! formatting happens on the calling thread, the write on a dedicated drain
//! thread, so a slow sink never stalls a tick.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, LevelFilter};

/// Env var holding the log filter, e.g. `otter_dgc=debug`
pub const ENV_LOG: &str = "OTTER_DGC_LOG";

/// Keeps the drain thread alive; pending lines are flushed on drop
#[must_use = "dropping the guard stops the log drain thread"]
pub struct LogGuard {
    worker: Option<WorkerGuard>,
}

impl LogGuard {
    /// Whether this call installed the subscriber
    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Install a global subscriber.
///
/// `default_directive` is used when [`ENV_LOG`] is unset or invalid. If a
/// global subscriber already exists, nothing is installed and the returned
/// guard is inactive.
pub fn init(default_directive: &str) -> LogGuard {
    let directive = default_directive
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let filter = EnvFilter::builder()
        .with_default_directive(directive)
        .with_env_var(ENV_LOG)
        .from_env_lossy();

    let (writer, worker) = tracing_appender::non_blocking(std::io::stderr());
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_names(true)
        .try_init();

    match installed {
        Ok(()) => LogGuard {
            worker: Some(worker),
        },
        Err(_) => LogGuard { worker: None },
    }
}
