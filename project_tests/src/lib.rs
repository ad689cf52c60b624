//! # Session Test Fixtures
//!
//! An in-memory `DispatchApi` and a few helpers shared by the end-to-end
//! tests in `tests/`. Sessions run against `LoopbackBroker`, so nothing here
//! needs a network.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lib_dispatch::ApiError;
use lib_dispatch::dispatch::{
    CreateRideRequest, CreateRideResponse, DriverStatus, Position, RideCard, RideStatus,
    SessionSettings, SessionStore, StaticSession, UiEvent,
};
use lib_dispatch::retrieve::DispatchApi;
use tokio::sync::mpsc;

/// How long a test waits for any one expected event.
pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct FakeState {
    next_ride_id: i64,
    cards: HashMap<i64, RideCard>,
    otp: String,
    fail_with: Option<u16>,
    created: Vec<CreateRideRequest>,
    statuses: Vec<(i64, DriverStatus)>,
    locations: Vec<(i64, Position)>,
    card_polls: usize,
    ended: Vec<i64>,
}

/// The dispatch backend, in memory.
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_ride_id: 100,
                otp: "4821".to_string(),
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Every later call fails with `status`, or succeeds again with `None`.
    pub fn fail_with(&self, status: Option<u16>) {
        self.lock().fail_with = status;
    }

    /// What `ride_card` answers for this ride from now on.
    pub fn set_card(&self, card: RideCard) {
        self.lock().cards.insert(card.ride_id, card);
    }

    pub fn created(&self) -> Vec<CreateRideRequest> {
        self.lock().created.clone()
    }

    pub fn statuses(&self) -> Vec<(i64, DriverStatus)> {
        self.lock().statuses.clone()
    }

    pub fn locations(&self) -> Vec<(i64, Position)> {
        self.lock().locations.clone()
    }

    pub fn card_polls(&self) -> usize {
        self.lock().card_polls
    }

    pub fn ended(&self) -> Vec<i64> {
        self.lock().ended.clone()
    }

    fn check(&self) -> Result<(), ApiError> {
        match self.lock().fail_with {
            Some(status) => Err(ApiError::from_status(status, Some("scripted".into()))),
            None => Ok(()),
        }
    }
}

impl DispatchApi for FakeApi {
    async fn create_ride(&self, request: &CreateRideRequest) -> Result<CreateRideResponse, ApiError> {
        self.check()?;
        let mut state = self.lock();
        state.next_ride_id += 1;
        let ride_id = state.next_ride_id;
        state.created.push(request.clone());
        state
            .cards
            .insert(ride_id, card(ride_id, RideStatus::Searching, false));
        Ok(CreateRideResponse {
            ride_id,
            estimated_fare: Some(212.5),
            otp_code: Some(state.otp.clone()),
        })
    }

    async fn ride_card(&self, ride_id: i64) -> Result<RideCard, ApiError> {
        self.check()?;
        let mut state = self.lock();
        state.card_polls += 1;
        state
            .cards
            .get(&ride_id)
            .cloned()
            .ok_or_else(|| ApiError::from_status(404, Some("no such ride".into())))
    }

    async fn verify_otp(&self, _ride_id: i64, otp: &str) -> Result<(), ApiError> {
        self.check()?;
        if self.lock().otp == otp {
            Ok(())
        } else {
            Err(ApiError::from_status(400, Some("Invalid OTP".into())))
        }
    }

    async fn update_online_status(&self, driver_id: i64, status: DriverStatus) -> Result<(), ApiError> {
        self.check()?;
        self.lock().statuses.push((driver_id, status));
        Ok(())
    }

    async fn update_driver_location(&self, driver_id: i64, position: Position) -> Result<(), ApiError> {
        self.check()?;
        self.lock().locations.push((driver_id, position));
        Ok(())
    }

    async fn driver_id_for_user(&self, user_id: i64) -> Result<i64, ApiError> {
        self.check()?;
        Ok(user_id + 1000)
    }

    async fn end_ride(&self, ride_id: i64) -> Result<(), ApiError> {
        self.check()?;
        self.lock().ended.push(ride_id);
        Ok(())
    }
}

/// A ride card as the server renders it.
pub fn card(ride_id: i64, status: RideStatus, with_driver: bool) -> RideCard {
    let mut value = serde_json::json!({
        "rideId": ride_id,
        "status": status,
        "estimatedFare": 212.5,
        "otpCode": "4821",
        "pickupLat": 28.6139,
        "pickupLng": 77.2090,
    });
    if with_driver {
        value["driver"] = serde_json::json!({"driverId": 1005, "name": "Ravi", "avgRating": 4.9});
        value["cab"] = serde_json::json!({"cabId": 3, "model": "Dzire", "cabType": "SEDAN"});
    }
    serde_json::from_value(value).unwrap()
}

pub fn signed_in(user_id: i64) -> Arc<dyn SessionStore> {
    Arc::new(StaticSession::new(Some("test-token".into()), Some(user_id), None))
}

pub fn signed_out() -> Arc<dyn SessionStore> {
    Arc::new(StaticSession::new(None, None, None))
}

/// Session timings shrunk so that tests finish in well under a second each.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        ws_endpoint: "ws://loopback:9090".to_string(),
        handshake_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(100),
        online_telemetry: Duration::from_millis(100),
        ride_telemetry: Duration::from_millis(50),
        offer_ttl: Duration::from_secs(30),
        expiry_sweep: Duration::from_millis(50),
    }
}

/// Waits for the first event matching `wanted`, skipping others. Panics
/// after `WAIT`.
pub async fn expect_event<F>(ui: &mut mpsc::UnboundedReceiver<UiEvent>, wanted: F) -> UiEvent
where
    F: Fn(&UiEvent) -> bool,
{
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = ui.recv().await {
            if wanted(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("UI stream closed before the expected event"),
        Err(_) => panic!("expected event did not arrive within {:?}", WAIT),
    }
}

/// Collects whatever arrives within `window`.
pub async fn events_within(
    ui: &mut mpsc::UnboundedReceiver<UiEvent>,
    window: Duration,
) -> Vec<UiEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, ui.recv()).await {
        events.push(event);
    }
    events
}
