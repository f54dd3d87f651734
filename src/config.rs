//! Configuration.
//!
//! The engine is spawned by its parent process, which already decided
//! almost everything about the environment (the cache layout, the TLS
//! settings, where the control channel's other end lives). What's left
//! for the worker's own command line is the handful of tunables the
//! core itself exposes -- which fd to speak the protocol over, how many
//! sessions to run concurrently, how big a read to issue per `poll()`
//! wakeup, and how chatty to be -- plus the logging target. Grounded on
//! `rrdpit::options::Options`: a plain struct built by a `from_args`
//! constructor, with its own `Error` enum, but using `clap`'s derive
//! API (`features = ["derive"]`) rather than the builder API that
//! crate's teacher code uses, since this is a small enough surface that
//! the derive macro is the more idiomatic fit.

use std::os::fd::RawFd;

use clap::Parser;
use log::LevelFilter;

/// The fixed number of concurrent RRDP sessions the reference
/// implementation services (`MAX_SESSIONS` in `rrdp.c`).
pub const DEFAULT_MAX_SESSIONS: usize = 12;

/// The read buffer size the reference implementation uses per `read()`
/// call (`READ_BUF_SIZE` in `rrdp.c`).
pub const DEFAULT_READ_BUF_SIZE: usize = 32 * 1024;

/// Command-line arguments for the `rrdp-engine` worker binary.
#[derive(Parser, Debug)]
#[command(name = "rrdp-engine")]
#[command(about = "RRDP synchronization worker process")]
struct Args {
    /// The file descriptor of the control channel to the parent process.
    #[arg(long, value_name = "FD")]
    control_fd: RawFd,

    /// Maximum number of concurrent RRDP sessions.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Bytes to read per transport descriptor per poll wakeup.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_READ_BUF_SIZE)]
    read_buf_size: usize,

    /// Increase log verbosity; may be repeated (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity; may be repeated (-q, -qq).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Log to syslog instead of stderr (unix only).
    #[arg(long)]
    syslog: bool,
}

/// The engine's resolved, validated configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The control channel fd, handed down by the parent at spawn time.
    pub control_fd: RawFd,

    /// At most this many sessions are serviced concurrently; additional
    /// `START` requests are accepted into the table but parked.
    pub max_sessions: usize,

    /// Scratch buffer size for reading a session's transport descriptor.
    pub read_buf_size: usize,

    /// The maximum log level to emit.
    pub log_level: LevelFilter,

    /// Where log output goes.
    pub log_target: LogTarget,
}

/// Where the engine's log output is sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogTarget {
    Stderr,
    #[cfg(unix)]
    Syslog,
}

impl Config {
    pub fn from_args() -> Result<Self, Error> {
        Self::from_parsed(Args::parse())
    }

    fn from_parsed(args: Args) -> Result<Self, Error> {
        if args.max_sessions == 0 {
            return Err(Error::InvalidMaxSessions);
        }
        if args.read_buf_size == 0 {
            return Err(Error::InvalidReadBufSize);
        }

        let log_level = level_from_verbosity(args.verbose, args.quiet);

        #[cfg(unix)]
        let log_target = if args.syslog { LogTarget::Syslog } else { LogTarget::Stderr };
        #[cfg(not(unix))]
        let log_target = {
            if args.syslog {
                return Err(Error::SyslogUnsupported);
            }
            LogTarget::Stderr
        };

        Ok(Config {
            control_fd: args.control_fd,
            max_sessions: args.max_sessions,
            read_buf_size: args.read_buf_size,
            log_level,
            log_target,
        })
    }
}

/// Maps repeated `-v`/`-q` flags onto a `log::LevelFilter`, starting from
/// `Warn` (the same default `routinator` uses before a config file is
/// read).
fn level_from_verbosity(verbose: u8, quiet: u8) -> LevelFilter {
    let net = i16::from(verbose) - i16::from(quiet);
    match net {
        i16::MIN..=-2 => LevelFilter::Off,
        -1 => LevelFilter::Error,
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Clone, Copy, Debug, derive_more::Display)]
pub enum Error {
    #[display("max-sessions must be at least 1")]
    InvalidMaxSessions,
    #[display("read-buf-size must be at least 1")]
    InvalidReadBufSize,
    #[cfg(not(unix))]
    #[display("syslog logging is only supported on unix")]
    SyslogUnsupported,
}

impl std::error::Error for Error {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_warn_by_default() {
        assert_eq!(level_from_verbosity(0, 0), LevelFilter::Warn);
    }

    #[test]
    fn verbosity_increases_with_v_flags() {
        assert_eq!(level_from_verbosity(1, 0), LevelFilter::Info);
        assert_eq!(level_from_verbosity(2, 0), LevelFilter::Debug);
        assert_eq!(level_from_verbosity(3, 0), LevelFilter::Trace);
    }

    #[test]
    fn verbosity_decreases_with_q_flags() {
        assert_eq!(level_from_verbosity(0, 1), LevelFilter::Error);
        assert_eq!(level_from_verbosity(0, 2), LevelFilter::Off);
    }

    #[test]
    fn rejects_zero_max_sessions() {
        let args = Args {
            control_fd: 3,
            max_sessions: 0,
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            verbose: 0,
            quiet: 0,
            syslog: false,
        };
        assert!(matches!(Config::from_parsed(args), Err(Error::InvalidMaxSessions)));
    }
}
