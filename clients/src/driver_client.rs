use std::sync::Arc;

use anyhow::Result;
use lib_dispatch::configs::load_config;
use lib_dispatch::dispatch::{DriverCommand, DriverSession, FixedLocation, LocationSource};
use lib_dispatch::loggers::setup_logging;
use lib_dispatch::retrieve::RestDispatchApi;
use lib_dispatch::transport::WsConnector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod console;

const HELP: &str = "Commands: online | offline | accept <rideId> | reject <rideId> | arrived | otp <code> | end | reconnect | quit";

/// `Ok(None)` means quit.
fn parse_command(line: &str) -> Result<Option<DriverCommand>, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_lowercase();
    let arg = words.next();
    let ride_id = |arg: Option<&str>| {
        arg.and_then(|a| a.parse::<i64>().ok())
            .ok_or_else(|| format!("'{}' needs a ride id", verb))
    };

    let command = match verb.as_str() {
        "online" => DriverCommand::GoOnline,
        "offline" => DriverCommand::GoOffline,
        "accept" => DriverCommand::Accept(ride_id(arg)?),
        "reject" => DriverCommand::Reject(ride_id(arg)?),
        "arrived" => DriverCommand::Arrived,
        "otp" => match arg {
            Some(code) => DriverCommand::VerifyOtp(code.to_string()),
            None => return Err("'otp' needs the rider's code".to_string()),
        },
        "end" => DriverCommand::EndRide,
        "reconnect" => DriverCommand::Reconnect,
        "quit" | "exit" => return Ok(None),
        _ => return Err(HELP.to_string()),
    };
    Ok(Some(command))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = load_config();
    setup_logging(&config.log_dir(), "driver_client", config.log_level())?;

    let api = Arc::new(RestDispatchApi::connect(
        config.api_base_url.as_deref().unwrap_or("http://localhost:9090/"),
        config.token.clone(),
    )?);
    let location: Arc<dyn LocationSource> = match config.device_position() {
        Some(position) => Arc::new(FixedLocation(position)),
        None => {
            log::warn!("No device position configured; location updates are skipped");
            Arc::new(console::NoFix)
        }
    };

    let (session, ui) = DriverSession::new(
        WsConnector::new(),
        api,
        Arc::new(config.session_store()),
        location,
        config.settings(),
    );
    let renderer = console::spawn_renderer(ui);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        console::shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let input_shutdown = shutdown.clone();
    tokio::spawn(async move {
        println!("{}", HELP);
        let mut lines = console::stdin_lines();
        while let Some(line) = lines.recv().await {
            match parse_command(&line) {
                Ok(Some(command)) => {
                    if commands_tx.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    input_shutdown.cancel();
                    break;
                }
                Err(help) => println!("{}", help),
            }
        }
    });

    session.run(commands_rx, shutdown).await;
    let _ = renderer.await;

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_driver_commands() {
        assert_eq!(parse_command("online"), Ok(Some(DriverCommand::GoOnline)));
        assert_eq!(parse_command("Accept 42"), Ok(Some(DriverCommand::Accept(42))));
        assert_eq!(
            parse_command("otp 4821"),
            Ok(Some(DriverCommand::VerifyOtp("4821".into())))
        );
        assert_eq!(parse_command("quit"), Ok(None));
    }

    #[test]
    fn rejects_incomplete_commands() {
        assert!(parse_command("accept").is_err());
        assert!(parse_command("reject x").is_err());
        assert!(parse_command("otp").is_err());
        assert_eq!(parse_command("dance"), Err(HELP.to_string()));
    }
}
