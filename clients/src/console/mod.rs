//! Plumbing shared by the console front-ends: stdin lines in, UI events out.

use std::io::{self, BufRead};
use std::thread;

use lib_dispatch::dispatch::{LocationSource, Position, RideOffer, UiEvent};
use lib_dispatch::transport::LifecycleEvent;
use tokio::signal;
use tokio::sync::mpsc;

/// A device without a fix. Telemetry ticks are skipped.
#[allow(dead_code)] // rider_client has no telemetry
pub struct NoFix;

impl LocationSource for NoFix {
    fn current(&self, _high_accuracy: bool) -> Option<Position> {
        None
    }
}

/// Forwards non-empty stdin lines until EOF. Reads on a plain thread, so a
/// pending read never holds up runtime shutdown.
pub fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || forward_lines(io::stdin().lock(), &tx));
    if let Err(e) = spawned {
        log::error!("stdin reader not started: {}", e);
    }
    rx
}

fn forward_lines<R: BufRead>(input: R, tx: &mpsc::UnboundedSender<String>) {
    for line in input.lines() {
        match line {
            Ok(line) => {
                let line = line.trim().to_string();
                if !line.is_empty() && tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::error!("stdin: {}", e);
                break;
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => log::info!("Ctrl-C received, initiating shutdown."),
            _ = term.recv() => log::info!("SIGTERM received, initiating shutdown."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
}

fn offer_line(offer: &RideOffer) -> String {
    format!(
        "New ride {} at ({:.5}, {:.5}). 'accept {0}' or 'reject {0}'",
        offer.ride_id, offer.pickup.lat, offer.pickup.lng
    )
}

pub fn render(event: &UiEvent) -> String {
    match event {
        UiEvent::Connection(LifecycleEvent::Opened) => "Connected".to_string(),
        UiEvent::Connection(LifecycleEvent::Closed) => "Disconnected".to_string(),
        UiEvent::Connection(LifecycleEvent::Error(e)) => format!("Connection error: {}", e),
        UiEvent::OnlineChanged(true) => "You are online".to_string(),
        UiEvent::OnlineChanged(false) => "You are offline".to_string(),
        UiEvent::OfferShown(offer) => offer_line(offer),
        UiEvent::OfferCleared => "No ride requests".to_string(),
        UiEvent::RideAccepted(ride) => format!(
            "Ride {} accepted. Head to ({:.5}, {:.5}), then 'arrived'",
            ride.ride_id, ride.pickup.lat, ride.pickup.lng
        ),
        UiEvent::RidePhaseChanged { ride_id, phase } => {
            format!("Ride {} is now {}", ride_id, phase.as_str())
        }
        UiEvent::RideCancelled { ride_id } => format!("Ride {} was cancelled", ride_id),
        UiEvent::RideRequested(request) => format!(
            "Ride {} requested (fare {}). Finding a driver...",
            request.ride_id,
            request
                .estimated_fare
                .map(|f| format!("{:.2}", f))
                .unwrap_or_else(|| "n/a".to_string())
        ),
        UiEvent::RideCardShown(card) => {
            let driver = card
                .driver
                .as_ref()
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "Driver {} assigned to ride {}. OTP {}",
                driver,
                card.ride_id,
                card.otp_code.as_deref().unwrap_or("-")
            )
        }
        UiEvent::AssignmentCancelled { ride_id, reason } => match reason {
            Some(reason) => format!("Ride {} cancelled: {}", ride_id, reason),
            None => format!("Ride {} cancelled", ride_id),
        },
        UiEvent::Notice(notice) => format!("! {}", notice),
    }
}

/// Prints UI events until the session drops its sender.
pub fn spawn_renderer(mut events: mpsc::UnboundedReceiver<UiEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render(&event));
        }
    })
}
