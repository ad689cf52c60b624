//! # Ride Lifecycle Tracker
//!
//! Rider side. After a ride is created two paths race to discover the
//! assignment: pushes on `/topic/ride/{id}` (handled on the session loop) and
//! a REST poll loop running in its own task. Both go through one
//! `AssignmentGuard`; whichever flips it first wins, cancels the poll loop and
//! is the only one that ever reaches the UI.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::model::{Cancellation, CreateRideResponse, RideCard, ride_topic};
use crate::retrieve::DispatchApi;

/// At-most-once latch for the CREATED -> ASSIGNED transition.
#[derive(Debug, Default)]
pub struct AssignmentGuard {
    resolved: AtomicBool,
}

impl AssignmentGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for exactly one caller, ever.
    pub fn try_resolve(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Assigned,
    Cancelled,
}

/// The rider's in-flight ride.
#[derive(Debug, Clone, PartialEq)]
pub struct RideRequest {
    pub ride_id: i64,
    pub status: RequestStatus,
    pub estimated_fare: Option<f64>,
    pub otp_code: Option<String>,
    pub card: Option<RideCard>,
}

impl From<CreateRideResponse> for RideRequest {
    fn from(created: CreateRideResponse) -> Self {
        Self {
            ride_id: created.ride_id,
            status: RequestStatus::Created,
            estimated_fare: created.estimated_fare,
            otp_code: created.otp_code,
            card: None,
        }
    }
}

/// Reported by the poll task back to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerSignal {
    /// The poll won the guard with this card.
    Resolved { ride_id: i64, card: RideCard },
    /// The polled card says the ride is cancelled.
    Cancelled { ride_id: i64 },
    /// The REST side rejected our token; polling stopped.
    Unauthorized { ride_id: i64 },
}

impl TrackerSignal {
    pub fn ride_id(&self) -> i64 {
        match self {
            TrackerSignal::Resolved { ride_id, .. }
            | TrackerSignal::Cancelled { ride_id }
            | TrackerSignal::Unauthorized { ride_id } => *ride_id,
        }
    }
}

/// What the session should surface after feeding the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum Tracked {
    Assigned(RideCard),
    Cancelled { reason: Option<String> },
    SessionExpired,
    Ignored,
}

/// Poll interval used when a caller asks for a zero interval.
pub const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct RideTracker {
    request: RideRequest,
    guard: Arc<AssignmentGuard>,
    poll: CancellationToken,
}

impl RideTracker {
    /// Starts the poll loop for `request`: first poll immediately, then every
    /// `interval`. Push handling is the caller's side of the race.
    pub fn start<A: DispatchApi>(
        request: RideRequest,
        api: Arc<A>,
        interval: Duration,
        signals: mpsc::UnboundedSender<TrackerSignal>,
    ) -> Self {
        let interval = if interval.is_zero() {
            log::warn!(
                "Zero poll interval for ride {}; using {:?}",
                request.ride_id,
                FALLBACK_POLL_INTERVAL
            );
            FALLBACK_POLL_INTERVAL
        } else {
            interval
        };
        let guard = Arc::new(AssignmentGuard::new());
        let poll = CancellationToken::new();
        tokio::spawn(poll_loop(
            request.ride_id,
            api,
            interval,
            guard.clone(),
            poll.clone(),
            signals,
        ));
        log::info!(
            "Tracking ride {} (polling every {:?})",
            request.ride_id,
            interval
        );
        Self {
            request,
            guard,
            poll,
        }
    }

    pub fn ride_id(&self) -> i64 {
        self.request.ride_id
    }

    pub fn topic(&self) -> String {
        ride_topic(self.request.ride_id)
    }

    pub fn request(&self) -> &RideRequest {
        &self.request
    }

    pub fn status(&self) -> RequestStatus {
        self.request.status
    }

    pub fn is_polling(&self) -> bool {
        !self.poll.is_cancelled()
    }

    /// A card pushed on the ride topic.
    pub fn on_push(&mut self, card: RideCard) -> Tracked {
        if card.ride_id != self.request.ride_id {
            log::warn!(
                "Card for ride {} on topic of ride {} ignored",
                card.ride_id,
                self.request.ride_id
            );
            return Tracked::Ignored;
        }
        if card.is_cancelled() {
            return self.cancelled_by_server(None);
        }
        if !card.is_assigned() {
            log::debug!("Ride {} status {:?}", card.ride_id, card.status);
            return Tracked::Ignored;
        }
        if !self.guard.try_resolve() {
            log::debug!("Late push for ride {} ignored", card.ride_id);
            return Tracked::Ignored;
        }
        self.poll.cancel();
        log::info!("Ride {} assigned via push", card.ride_id);
        self.assign(card)
    }

    /// A signal from the poll task.
    pub fn on_signal(&mut self, signal: TrackerSignal) -> Tracked {
        if signal.ride_id() != self.request.ride_id {
            return Tracked::Ignored;
        }
        match signal {
            TrackerSignal::Resolved { card, .. } => {
                if self.request.status != RequestStatus::Created {
                    return Tracked::Ignored;
                }
                log::info!("Ride {} assigned via poll", card.ride_id);
                self.assign(card)
            }
            TrackerSignal::Cancelled { .. } => self.cancelled_by_server(None),
            TrackerSignal::Unauthorized { .. } => {
                self.poll.cancel();
                Tracked::SessionExpired
            }
        }
    }

    /// A notice from the ride-cancelled queue. Notices for other rides are
    /// ignored; notices without a ride id apply to this one.
    pub fn on_cancellation(&mut self, cancellation: &Cancellation) -> Tracked {
        match cancellation {
            Cancellation::Ride(id) if *id != self.request.ride_id => Tracked::Ignored,
            Cancellation::Ride(_) => self.cancelled_by_server(None),
            Cancellation::Notice(text) => self.cancelled_by_server(Some(text.clone())),
        }
    }

    /// Rider walked away: stop both paths, tell nobody.
    pub fn abandon(&mut self) {
        self.poll.cancel();
        if self.request.status == RequestStatus::Created {
            self.guard.try_resolve();
        }
        self.request.status = RequestStatus::Cancelled;
        log::info!("Ride {} abandoned", self.request.ride_id);
    }

    fn assign(&mut self, card: RideCard) -> Tracked {
        self.request.status = RequestStatus::Assigned;
        if card.otp_code.is_some() {
            self.request.otp_code = card.otp_code.clone();
        }
        self.request.card = Some(card.clone());
        Tracked::Assigned(card)
    }

    fn cancelled_by_server(&mut self, reason: Option<String>) -> Tracked {
        if self.request.status == RequestStatus::Cancelled {
            return Tracked::Ignored;
        }
        self.poll.cancel();
        self.guard.try_resolve();
        self.request.status = RequestStatus::Cancelled;
        self.request.card = None;
        log::warn!("Ride {} cancelled by server", self.request.ride_id);
        Tracked::Cancelled { reason }
    }
}

impl Drop for RideTracker {
    fn drop(&mut self) {
        self.poll.cancel();
    }
}

async fn poll_loop<A: DispatchApi>(
    ride_id: i64,
    api: Arc<A>,
    interval: Duration,
    guard: Arc<AssignmentGuard>,
    token: CancellationToken,
    signals: mpsc::UnboundedSender<TrackerSignal>,
) {
    loop {
        let polled = tokio::select! {
            _ = token.cancelled() => break,
            polled = api.ride_card(ride_id) => polled,
        };
        match polled {
            Ok(card) if card.is_assigned() => {
                if guard.try_resolve() {
                    token.cancel();
                    let _ = signals.send(TrackerSignal::Resolved { ride_id, card });
                }
                break;
            }
            Ok(card) if card.is_cancelled() => {
                let _ = signals.send(TrackerSignal::Cancelled { ride_id });
                break;
            }
            Ok(card) => log::debug!("Poll ride {}: {:?}", ride_id, card.status),
            Err(e) if e.is_unauthorized() => {
                log::warn!("Poll for ride {} unauthorized; stopping", ride_id);
                let _ = signals.send(TrackerSignal::Unauthorized { ride_id });
                break;
            }
            Err(e) => log::warn!("Poll for ride {} failed: {}", ride_id, e),
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    log::debug!("Poll loop for ride {} finished", ride_id);
}
