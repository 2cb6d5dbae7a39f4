use clap::Parser;
use log::error;

use smtp_filter_relay::cli::{Args, RelayConfig};

/// Parses arguments, binds the listening socket, and runs the preforked
/// worker pool to completion. The parent never starts a Tokio runtime of
/// its own; each worker builds one after `fork()`.
fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();
    let config = match RelayConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("argument error: {:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = smtp_filter_relay::run(config) {
        error!("fatal error: {:#}", e);
        std::process::exit(1);
    }
}
