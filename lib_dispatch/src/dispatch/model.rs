//! # Dispatch Wire Model
//!
//! JSON payloads exchanged with the dispatch server over STOMP and REST, plus
//! the small value types the state machines pass around. Field names follow
//! the server's camelCase wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound driver queue carrying new ride offers.
pub const RIDE_REQUEST_QUEUE: &str = "/user/queue/ride-request";
/// Inbound queue carrying ride cancellations (JSON `{rideId}` or free text).
pub const RIDE_CANCELLED_QUEUE: &str = "/user/queue/ride-cancelled";
/// Outbound destination for the driver's accept/reject decision.
pub const RIDE_RESPONSE_DESTINATION: &str = "/app/driver/ride/response";
/// Outbound destination for ride location pings.
pub const RIDE_LOCATION_DESTINATION: &str = "/app/ride/location";

/// Per-ride status topic the rider listens on.
pub fn ride_topic(ride_id: i64) -> String {
    format!("/topic/ride/{}", ride_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// `{rideId, pickupLat, pickupLng}` on the ride-request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideOfferPayload {
    pub ride_id: i64,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
}

/// JSON form of a cancellation notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideCancelledPayload {
    pub ride_id: i64,
}

/// A cancellation notice as received: either for one ride, or a free-text
/// message that applies to whatever the client is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    Ride(i64),
    Notice(String),
}

impl Cancellation {
    /// Reads a ride-cancelled body. Anything that is not `{rideId}` JSON is
    /// kept as free text.
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<RideCancelledPayload>(body) {
            Ok(p) => Cancellation::Ride(p.ride_id),
            Err(_) => Cancellation::Notice(body.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Searching,
    Assigned,
    Arrived,
    Started,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CabType {
    Mini,
    Sedan,
    Suv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSummary {
    pub driver_id: i64,
    pub name: String,
    #[serde(default)]
    pub avg_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CabSummary {
    pub cab_id: i64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub registration_no: Option<String>,
    #[serde(default)]
    pub cab_type: Option<CabType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eta {
    pub distance_km: f64,
    pub eta_minutes: i64,
}

/// Full ride card, pushed on `/topic/ride/{id}` and returned by `getRideCard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideCard {
    pub ride_id: i64,
    pub status: RideStatus,
    #[serde(default)]
    pub estimated_fare: Option<f64>,
    #[serde(default)]
    pub final_fare: Option<f64>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub pickup_lat: Option<f64>,
    #[serde(default)]
    pub pickup_lng: Option<f64>,
    #[serde(default)]
    pub drop_lat: Option<f64>,
    #[serde(default)]
    pub drop_lng: Option<f64>,
    #[serde(default)]
    pub otp_code: Option<String>,
    #[serde(default)]
    pub driver: Option<DriverSummary>,
    #[serde(default)]
    pub cab: Option<CabSummary>,
    #[serde(default)]
    pub eta: Option<Eta>,
}

impl RideCard {
    /// A driver has been matched: status ASSIGNED with a driver attached.
    pub fn is_assigned(&self) -> bool {
        self.status == RideStatus::Assigned && self.driver.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RideStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Accepted,
    Rejected,
}

/// `{rideId, status, driverId}` published on the response destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideResponse {
    pub ride_id: i64,
    pub status: Decision,
    pub driver_id: i64,
}

/// `{rideId, lat, lng}` (or `{driverId, lat, lng}`) location ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPing {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ride_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub driver_id: Option<i64>,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideRequest {
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub drop_lat: f64,
    pub drop_lng: f64,
}

impl CreateRideRequest {
    pub fn new(pickup: Position, drop: Position) -> Self {
        Self {
            pickup_lat: pickup.lat,
            pickup_lng: pickup.lng,
            drop_lat: drop.lat,
            drop_lng: drop.lng,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideResponse {
    pub ride_id: i64,
    #[serde(default)]
    pub estimated_fare: Option<f64>,
    #[serde(default)]
    pub otp_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    pub ride_id: i64,
    pub otp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriverStatus {
    Online,
    Offline,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Online => "ONLINE",
            DriverStatus::Offline => "OFFLINE",
        }
    }
}

/// Who a location sample is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Ride(i64),
    Driver(i64),
}

/// One position fix, tagged with its subject. Published and discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSample {
    pub subject: Subject,
    pub position: Position,
    pub taken_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn ping(&self) -> LocationPing {
        let (ride_id, driver_id) = match self.subject {
            Subject::Ride(id) => (Some(id), None),
            Subject::Driver(id) => (None, Some(id)),
        };
        LocationPing {
            ride_id,
            driver_id,
            lat: self.position.lat,
            lng: self.position.lng,
        }
    }
}
