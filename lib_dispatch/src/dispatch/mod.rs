//! # Dispatch Module
//!
//! Ride dispatch state on top of the transport: what a driver is offered and
//! is driving, what a rider is waiting for, and where the car is.
//!
//! ## Contained Modules:
//! - **`model`**: wire payloads, REST bodies and destinations.
//! - **`offers`**: the driver's FIFO offer queue with one SHOWN offer.
//! - **`active_ride`**: the accepted ride and its phase machine.
//! - **`telemetry`**: periodic location sampling into a sink.
//! - **`tracker`**: rider-side assignment race between push and poll.
//! - **`session`**: the context both roles share and the UI event stream.
//! - **`driver`** / **`rider`**: the two session loops.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod active_ride;
pub mod driver;
pub mod model;
pub mod offers;
pub mod rider;
pub mod session;
pub mod telemetry;
pub mod tracker;

// --- Public API Re-exports ---
pub use active_ride::{ActiveRide, RidePhase};
pub use driver::{DriverCommand, DriverRoute, DriverSession};
pub use model::*;
pub use offers::{Decided, OfferQueue, OfferState, QueueChange, RideOffer};
pub use rider::{RiderCommand, RiderRoute, RiderSession};
pub use session::{
    Notice, SessionContext, SessionSettings, SessionStore, StaticSession, UiEvent, UiSink,
};
pub use telemetry::{
    FixedLocation, LocationSink, LocationSource, RestLocationSink, StompLocationSink,
    TelemetryPublisher,
};
pub use tracker::{
    AssignmentGuard, RequestStatus, RideRequest, RideTracker, Tracked, TrackerSignal,
};
