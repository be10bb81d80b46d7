//! textwire-server: echo service for the textwire protocol
//!
//! Every command is answered with its own name and arguments, except:
//! - `PING` answers `PONG`
//! - the disconnect command (default `BYE`) answers and closes the session
//!
//! Runtime, listen address, payload limit and logging come from CLI arguments
//! or a TOML file.

use std::sync::Arc;
use textwire::config::Config;
use textwire::protocol::{DataExpectation, Response};
use textwire::runtime;
use textwire::server::CommandRegistry;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        disconnect_command = %config.disconnect_command,
        max_payload = config.max_payload,
        "Starting textwire server"
    );

    let registry = CommandRegistry::new()
        .disconnect_command(&config.disconnect_command)
        .max_payload(config.max_payload)
        .default_handler(|request| {
            let mut response =
                Response::builder(request.command()).args(request.arguments().iter().cloned());
            if let Some(payload) = request.payload() {
                response = response.payload(payload.clone());
            }
            Ok(response.build())
        })
        .command("PING", DataExpectation::Never, |_| Ok(Response::status_only("PONG")));

    runtime::run(config.runtime, config.listen, config.workers, Arc::new(registry))?;
    Ok(())
}
