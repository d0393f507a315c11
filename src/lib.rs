pub mod app;
pub mod commands;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod events;
pub mod http_retry;
pub mod logger;
pub mod machine;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
mod utils;

use tracing::error;

pub use config::ClientConfig;
pub use error::{CallError, Result};
pub use machine::NegotiationMachine;

pub fn run() {
    logger::init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            eprintln!("peercall: {e}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("peercall: tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(app::serve(config)) {
        error!("{e:#}");
        eprintln!("peercall: {e:#}");
        std::process::exit(1);
    }
}
