//! Command-line interface for the pipeline
//!
//! The binary lives in `main.rs`; handlers are in [`commands`] so they can be
//! exercised without going through argument parsing.

pub mod commands;
pub mod error;

/// Install the global tracing subscriber
///
/// `RUST_LOG` is respected; without it the level is `info`, or `debug`
/// when `verbose` is set. Repeated calls are ignored.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !verbose && !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Grace period for tunnels stopped from the signal handler
const SIGNAL_STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Stop running tunnels and exit on SIGINT or SIGTERM
///
/// Tunnel children lead their own process groups, so a terminal Ctrl-C
/// never reaches them, and exiting on a signal skips every destructor.
/// The handlers are registered before this returns; a background thread
/// waits for them.
#[cfg(unix)]
pub fn install_signal_handler() -> Result<(), error::CliError> {
    use tokio::signal::unix::{SignalKind, signal};

    let rt = signal_runtime()?;
    let (mut interrupt, mut terminate) = {
        let _guard = rt.enter();
        let interrupt = signal(SignalKind::interrupt()).map_err(signal_error)?;
        let terminate = signal(SignalKind::terminate()).map_err(signal_error)?;
        (interrupt, terminate)
    };

    std::thread::spawn(move || {
        let code = rt.block_on(async {
            tokio::select! {
                _ = interrupt.recv() => 130,
                _ = terminate.recv() => 143,
            }
        });
        exit_after_signal(code);
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handler() -> Result<(), error::CliError> {
    let rt = signal_runtime()?;
    std::thread::spawn(move || {
        let _ = rt.block_on(tokio::signal::ctrl_c());
        exit_after_signal(130);
    });
    Ok(())
}

fn signal_runtime() -> Result<tokio::runtime::Runtime, error::CliError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(signal_error)
}

fn signal_error(e: std::io::Error) -> error::CliError {
    error::CliError::IoError(format!("Failed to install signal handler: {}", e))
}

fn exit_after_signal(code: i32) -> ! {
    let stopped = crate::tunnel::stop_registered_groups(SIGNAL_STOP_GRACE);
    if stopped > 0 {
        tracing::warn!("Interrupted; stopped {} tunnel process group(s)", stopped);
    } else {
        tracing::warn!("Interrupted");
    }
    std::process::exit(code);
}
