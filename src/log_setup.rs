//! Logging setup.
//!
//! Grounded on `routinator::log`, scaled down to what a non-interactive
//! worker process needs: a single `fern` dispatcher installed once at
//! start-up, one level, one target (stderr or syslog), no in-memory log
//! book to flush to an HTTP UI -- the engine has no UI, and the only
//! consumer of its diagnostics is whoever is watching its stderr (or the
//! syslog daemon) alongside the parent process's own log.

use crate::config::{Config, LogTarget};
use crate::error::Failed;

/// Installs the global logger according to `config`.
///
/// Must be called exactly once, before any other module logs anything;
/// `main` calls this immediately after parsing arguments.
pub fn init(config: &Config) -> Result<(), Failed> {
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(config.log_level);

    let dispatch = match config.log_target {
        LogTarget::Stderr => dispatch.chain(std::io::stderr()),
        #[cfg(unix)]
        LogTarget::Syslog => dispatch.chain(open_syslog()?),
    };

    dispatch.apply().map_err(|err| {
        eprintln!("failed to initialize logging: {err}");
        Failed
    })
}

#[cfg(unix)]
fn open_syslog() -> Result<Box<dyn log::Log>, Failed> {
    // fern's own syslog integration requires the `syslog-6` feature,
    // which the engine doesn't enable (the parent process owns the
    // actual syslog facility choice in the reference deployment); a
    // worker process that's asked for syslog but built without it
    // falls back to stderr rather than failing to start.
    eprintln!("syslog logging not compiled in; falling back to stderr");
    Ok(Box::new(StderrLogger))
}

#[cfg(unix)]
struct StderrLogger;

#[cfg(unix)]
impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}
