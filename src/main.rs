//! ringcore: a single-threaded, io_uring-backed TCP echo server core.
//!
//! CLI argument parsing is hand-rolled rather than going through a
//! declarative CLI-args crate, since the required usage/error text is a
//! literal format a framework's auto-generated messages would not match.

mod callbacks;
mod config;
mod core;
mod error;
mod shutdown;

use std::process::ExitCode;

use config::Config;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <port>", args.first().map(String::as_str).unwrap_or("server"));
        return ExitCode::FAILURE;
    }

    let port: u16 = match args[1].parse::<u32>() {
        Ok(p) if p >= 1 && p <= 65535 => p as u16,
        _ => {
            eprintln!("Invalid port number");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    shutdown::install();

    let config = Config::new(port);

    #[cfg(target_os = "linux")]
    {
        let resources = match core::resource_manager::Resources::bring_up(&config) {
            Ok(r) => r,
            Err(_) => return ExitCode::FAILURE,
        };

        match core::event_loop::run(resources, config, callbacks::Callbacks::default()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error::handle_error(error::ErrorCode::ResourceInitFailed, &e.to_string());
                ExitCode::FAILURE
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        error::handle_error(
            error::ErrorCode::ResourceInitFailed,
            "ringcore requires Linux (io_uring)",
        );
        ExitCode::FAILURE
    }
}
