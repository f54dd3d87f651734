extern crate rrdp_engine;

use rrdp_engine::config::Config;
use rrdp_engine::{engine, log_setup};

fn main() {
    let config = match Config::from_args() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            ::std::process::exit(1);
        }
    };

    if log_setup::init(&config).is_err() {
        ::std::process::exit(1);
    }

    if let Err(e) = engine::run(config) {
        log::error!("{e}");
        ::std::process::exit(e.exit_code());
    }
}
