//! Wires configuration, logging, and the multiplexer together into the
//! `run()` entry point the binary calls.
//!
//! Grounded on `proc_rrdp()`'s role in the source this core was
//! distilled from: the function the parent process's fork/exec (or,
//! here, the `rrdp-engine` binary's `main`) hands control to once the
//! control channel fd is known, never returning except on clean
//! shutdown or a fatal error.

use crate::config::Config;
use crate::error::FatalError;

/// Runs the engine to completion.
///
/// Returns `Ok(())` on a clean shutdown (the parent closed the control
/// channel) and `Err` on a fatal protocol violation or resource
/// failure; `main` is responsible for turning the latter into a
/// process exit code.
#[cfg(unix)]
pub fn run(config: Config) -> Result<(), FatalError> {
    use crate::multiplexer::Multiplexer;

    log::info!(
        "rrdp-engine starting: max_sessions={} read_buf_size={}",
        config.max_sessions,
        config.read_buf_size,
    );
    let result = Multiplexer::new(&config).run();
    match &result {
        Ok(()) => log::info!("control channel closed, exiting"),
        Err(e) => log::error!("fatal error: {}", e),
    }
    result
}

/// The engine's fd-passing control channel (`proto::fd`) and readiness
/// loop (`multiplexer`) are built directly on `nix`'s Unix socket and
/// `poll(2)` bindings; there is no portable equivalent to fall back to.
#[cfg(not(unix))]
pub fn run(_config: Config) -> Result<(), FatalError> {
    log::error!("rrdp-engine requires a unix platform (fd passing, poll)");
    Err(FatalError::ProtocolViolation)
}
