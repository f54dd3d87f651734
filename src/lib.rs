extern crate base64;
extern crate bytes;
extern crate clap;
#[macro_use]
extern crate derive_more;
extern crate core;
extern crate fern;
extern crate hex;
extern crate log;
extern crate ring;
extern crate xml as xmlrs;

#[cfg(unix)]
extern crate nix;

pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod log_setup;
#[cfg(unix)]
pub mod multiplexer;
pub mod proto;
pub mod publish;
pub mod session;
pub mod xml;
