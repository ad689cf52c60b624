use std::sync::Arc;

use anyhow::Result;
use lib_dispatch::configs::load_config;
use lib_dispatch::dispatch::{Position, RiderCommand, RiderSession};
use lib_dispatch::loggers::setup_logging;
use lib_dispatch::retrieve::RestDispatchApi;
use lib_dispatch::transport::WsConnector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod console;

const HELP: &str = "Commands: request <pickupLat> <pickupLng> <dropLat> <dropLng> | request <dropLat> <dropLng> | cancel | reconnect | quit";

/// `Ok(None)` means quit. A two-coordinate request starts from `here`.
fn parse_command(line: &str, here: Option<Position>) -> Result<Option<RiderCommand>, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_lowercase();

    let command = match verb.as_str() {
        "request" => {
            let coords = words
                .map(|w| w.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("bad coordinate: {}", e))?;
            match (coords.as_slice(), here) {
                ([plat, plng, dlat, dlng], _) => RiderCommand::RequestRide {
                    pickup: Position::new(*plat, *plng),
                    drop: Position::new(*dlat, *dlng),
                },
                ([dlat, dlng], Some(pickup)) => RiderCommand::RequestRide {
                    pickup,
                    drop: Position::new(*dlat, *dlng),
                },
                ([_, _], None) => {
                    return Err("no device position configured; give the pickup too".to_string());
                }
                _ => return Err(HELP.to_string()),
            }
        }
        "cancel" => RiderCommand::CancelRide,
        "reconnect" => RiderCommand::Reconnect,
        "quit" | "exit" => return Ok(None),
        _ => return Err(HELP.to_string()),
    };
    Ok(Some(command))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = load_config();
    setup_logging(&config.log_dir(), "rider_client", config.log_level())?;

    let api = Arc::new(RestDispatchApi::connect(
        config.api_base_url.as_deref().unwrap_or("http://localhost:9090/"),
        config.token.clone(),
    )?);
    let here = config.device_position();

    let (session, ui) = RiderSession::new(
        WsConnector::new(),
        api,
        Arc::new(config.session_store()),
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
            match parse_command(&line, here) {
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
