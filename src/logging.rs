//! Logging initialisation for qemu-fleet.
//!
//! When the `QEMU_FLEET_LOG` environment variable is set to `1`, structured
//! logs are additionally written to `<log dir>/qemu-fleet.log`.
//! stderr output is always enabled and filtered by `RUST_LOG` (default `info`,
//! so every spawned command line is visible).
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::FleetPaths;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> LogGuard {
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let file_guard = if std::env::var("QEMU_FLEET_LOG").as_deref() == Ok("1") {
        let dir = FleetPaths::resolve()
            .map(|p| p.logs)
            .unwrap_or_else(|| std::env::temp_dir().join("qemu-fleet"));
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, "qemu-fleet.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter())
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(stderr_layer)
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
