//! Logging setup, tailored to this program.
//!
//! The daemon calls [`init_journald_or_stdout`] once at startup to
//! install a tracing subscriber. Everything else just uses the standard
//! `tracing` macros via [`prelude`].

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Initialize logging.
///
/// When stderr is connected to the systemd journal (JOURNAL_STREAM set),
/// log there natively; otherwise format to stdout, filtered by RUST_LOG
/// with a default level of INFO.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("JOURNAL_STREAM").is_some() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            eprintln!("failed to initialize journald logging, using stdout");
        }
    }

    use_stdout();
}

fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
