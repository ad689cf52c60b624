//! The ride a driver has accepted, and its phase transitions.

use crate::dispatch::model::Position;
use crate::errors::StateConflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RidePhase {
    Accepted,
    Arrived,
    InProgress,
    Completed,
}

impl RidePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RidePhase::Accepted => "ACCEPTED",
            RidePhase::Arrived => "ARRIVED",
            RidePhase::InProgress => "IN_PROGRESS",
            RidePhase::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRide {
    pub ride_id: i64,
    pub driver_id: i64,
    pub pickup: Position,
    pub phase: RidePhase,
}

impl ActiveRide {
    pub fn new(ride_id: i64, driver_id: i64, pickup: Position) -> Self {
        Self {
            ride_id,
            driver_id,
            pickup,
            phase: RidePhase::Accepted,
        }
    }

    /// Driver reached the pickup point.
    pub fn arrive(&mut self) -> Result<RidePhase, StateConflict> {
        self.advance("mark arrived", &[RidePhase::Accepted], RidePhase::Arrived)
    }

    /// Rider's OTP checked out; the trip starts. Arrival is implied when the
    /// driver skipped it.
    pub fn start(&mut self) -> Result<RidePhase, StateConflict> {
        self.advance(
            "start",
            &[RidePhase::Accepted, RidePhase::Arrived],
            RidePhase::InProgress,
        )
    }

    pub fn complete(&mut self) -> Result<RidePhase, StateConflict> {
        self.advance("end", &[RidePhase::InProgress], RidePhase::Completed)
    }

    /// OTP entry is only meaningful before the trip starts.
    pub fn awaiting_otp(&self) -> bool {
        matches!(self.phase, RidePhase::Accepted | RidePhase::Arrived)
    }

    fn advance(
        &mut self,
        action: &'static str,
        from: &[RidePhase],
        to: RidePhase,
    ) -> Result<RidePhase, StateConflict> {
        if !from.contains(&self.phase) {
            return Err(StateConflict::InvalidPhase {
                action,
                phase: self.phase.as_str(),
            });
        }
        log::info!(
            "Ride {} {} -> {}",
            self.ride_id,
            self.phase.as_str(),
            to.as_str()
        );
        self.phase = to;
        Ok(to)
    }
}
