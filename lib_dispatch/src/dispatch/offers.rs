//! # Ride Offer Queue
//!
//! Driver-side offer state machine. Offers are kept in arrival order and only
//! the head can be SHOWN; there is never more than one SHOWN offer. Deciding
//! on the SHOWN offer publishes the response, removes it and promotes the next
//! PENDING one. Accepting creates the `ActiveRide`, which suspends intake:
//! new offers are refused and nothing is promoted until the ride ends or is
//! cancelled by the server.
//!
//! Server cancellations remove offers silently, whatever their state. A
//! publish failure on accept/reject is retried once and then reported in the
//! returned `Decision`; local state is never rolled back.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::dispatch::active_ride::ActiveRide;
use crate::dispatch::model::{
    Cancellation, Decision, Position, RIDE_RESPONSE_DESTINATION, RideOfferPayload, RideResponse,
};
use crate::errors::{PublishError, StateConflict};
use crate::transport::Outbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    Pending,
    Shown,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RideOffer {
    pub ride_id: i64,
    pub pickup: Position,
    pub received_at: DateTime<Utc>,
    pub state: OfferState,
}

impl RideOffer {
    pub fn new(payload: &RideOfferPayload, received_at: DateTime<Utc>) -> Self {
        Self {
            ride_id: payload.ride_id,
            pickup: Position::new(payload.pickup_lat, payload.pickup_lng),
            received_at,
            state: OfferState::Pending,
        }
    }
}

/// Effect of one queue operation on what the driver sees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueChange {
    /// Offers that left the queue, in their terminal state.
    pub removed: Vec<RideOffer>,
    /// Offer promoted to SHOWN by this operation.
    pub shown: Option<RideOffer>,
    /// An offer was on screen before and nothing is now.
    pub cleared: bool,
    /// Active ride dropped by this operation (server cancellation or release).
    pub ended: Option<ActiveRide>,
}

/// Result of accept/reject on the SHOWN offer.
#[derive(Debug, Clone, PartialEq)]
pub struct Decided {
    pub offer: RideOffer,
    /// Outcome of publishing the response, after the single retry.
    pub delivery: Result<(), PublishError>,
    pub change: QueueChange,
}

#[derive(Debug, Default)]
pub struct OfferQueue {
    offers: VecDeque<RideOffer>,
    active: Option<ActiveRide>,
}

impl OfferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The offer currently on screen.
    pub fn shown(&self) -> Option<&RideOffer> {
        self.offers.front().filter(|o| o.state == OfferState::Shown)
    }

    pub fn active(&self) -> Option<&ActiveRide> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveRide> {
        self.active.as_mut()
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    /// Ride ids in queue order.
    pub fn ride_ids(&self) -> Vec<i64> {
        self.offers.iter().map(|o| o.ride_id).collect()
    }

    /// Appends a new offer, promoting it right away when nothing is shown.
    pub fn enqueue(&mut self, offer: RideOffer) -> Result<QueueChange, StateConflict> {
        if let Some(active) = &self.active {
            return Err(StateConflict::DriverBusy {
                ride_id: offer.ride_id,
                active: active.ride_id,
            });
        }
        if self.offers.iter().any(|o| o.ride_id == offer.ride_id) {
            return Err(StateConflict::Duplicate {
                ride_id: offer.ride_id,
            });
        }

        log::info!("Offer {} queued ({} ahead)", offer.ride_id, self.offers.len());
        self.offers.push_back(offer);
        let shown = if self.shown().is_none() {
            self.promote()
        } else {
            None
        };
        Ok(QueueChange {
            shown,
            ..QueueChange::default()
        })
    }

    /// Accepts the SHOWN offer and makes it the active ride.
    pub fn accept(
        &mut self,
        ride_id: i64,
        driver_id: i64,
        outbound: &dyn Outbound,
    ) -> Result<Decided, StateConflict> {
        let mut offer = self.take_shown(ride_id)?;
        offer.state = OfferState::Accepted;
        self.active = Some(ActiveRide::new(ride_id, driver_id, offer.pickup));

        let delivery = publish_response(outbound, ride_id, Decision::Accepted, driver_id);
        Ok(Decided {
            offer,
            delivery,
            change: QueueChange {
                cleared: true,
                ..QueueChange::default()
            },
        })
    }

    /// Rejects the SHOWN offer and promotes the next one.
    pub fn reject(
        &mut self,
        ride_id: i64,
        driver_id: i64,
        outbound: &dyn Outbound,
    ) -> Result<Decided, StateConflict> {
        let mut offer = self.take_shown(ride_id)?;
        offer.state = OfferState::Rejected;

        let delivery = publish_response(outbound, ride_id, Decision::Rejected, driver_id);
        let shown = self.promote();
        Ok(Decided {
            offer,
            delivery,
            change: QueueChange {
                cleared: shown.is_none(),
                shown,
                ..QueueChange::default()
            },
        })
    }

    /// Applies a server cancellation. Never publishes anything.
    ///
    /// A notice for one ride removes that offer wherever it sits and, if it
    /// is the active ride, drops the ride and resumes intake. A free-text
    /// notice clears every queued offer but leaves an active ride alone.
    pub fn cancel(&mut self, cancellation: &Cancellation) -> QueueChange {
        let had_shown = self.shown().is_some();
        let mut change = QueueChange::default();

        match cancellation {
            Cancellation::Ride(ride_id) => {
                if let Some(idx) = self.offers.iter().position(|o| o.ride_id == *ride_id) {
                    if let Some(mut offer) = self.offers.remove(idx) {
                        offer.state = OfferState::Cancelled;
                        change.removed.push(offer);
                    }
                }
                if self.active.as_ref().map(|a| a.ride_id) == Some(*ride_id) {
                    change.ended = self.active.take();
                    log::warn!("Active ride {} cancelled by server", ride_id);
                }
            }
            Cancellation::Notice(text) => {
                log::warn!("Cancellation notice without ride id: {}", text);
                change.removed = self
                    .offers
                    .drain(..)
                    .map(|mut o| {
                        o.state = OfferState::Cancelled;
                        o
                    })
                    .collect();
            }
        }

        self.settle(had_shown, change)
    }

    /// Drops offers older than `ttl` at `now`.
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> QueueChange {
        let had_shown = self.shown().is_some();
        let mut change = QueueChange::default();
        let mut kept = VecDeque::with_capacity(self.offers.len());
        for mut offer in self.offers.drain(..) {
            if now - offer.received_at >= ttl {
                log::info!("Offer {} expired", offer.ride_id);
                offer.state = OfferState::Expired;
                change.removed.push(offer);
            } else {
                kept.push_back(offer);
            }
        }
        self.offers = kept;
        self.settle(had_shown, change)
    }

    /// Ends the active ride (completed) and resumes intake.
    pub fn release_active(&mut self) -> QueueChange {
        let change = QueueChange {
            ended: self.active.take(),
            ..QueueChange::default()
        };
        self.settle(false, change)
    }

    /// Drops every queued offer. The active ride is untouched.
    pub fn clear(&mut self) -> QueueChange {
        let had_shown = self.shown().is_some();
        let change = QueueChange {
            removed: self
                .offers
                .drain(..)
                .map(|mut o| {
                    o.state = OfferState::Cancelled;
                    o
                })
                .collect(),
            ..QueueChange::default()
        };
        self.settle(had_shown, change)
    }

    fn take_shown(&mut self, ride_id: i64) -> Result<RideOffer, StateConflict> {
        match self.shown() {
            Some(o) if o.ride_id == ride_id => {}
            _ => return Err(StateConflict::NotShown { ride_id }),
        }
        self.offers
            .pop_front()
            .ok_or(StateConflict::NotShown { ride_id })
    }

    // Re-establishes "head is SHOWN unless busy" after a removal.
    fn settle(&mut self, had_shown: bool, mut change: QueueChange) -> QueueChange {
        if self.shown().is_none() {
            change.shown = self.promote();
        }
        change.cleared = had_shown && self.shown().is_none();
        change
    }

    fn promote(&mut self) -> Option<RideOffer> {
        if self.active.is_some() {
            return None;
        }
        let head = self.offers.front_mut()?;
        if head.state != OfferState::Pending {
            return None;
        }
        head.state = OfferState::Shown;
        log::info!("Offer {} shown", head.ride_id);
        Some(head.clone())
    }
}

fn publish_response(
    outbound: &dyn Outbound,
    ride_id: i64,
    status: Decision,
    driver_id: i64,
) -> Result<(), PublishError> {
    let body = serde_json::to_string(&RideResponse {
        ride_id,
        status,
        driver_id,
    })
    .map_err(|e| PublishError::Encode(e.to_string()))?;

    match outbound.publish(RIDE_RESPONSE_DESTINATION, &body) {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!("Ride response for {} failed ({}), retrying once", ride_id, first);
            outbound
                .publish(RIDE_RESPONSE_DESTINATION, &body)
                .inspect_err(|e| log::error!("Ride response for {} not delivered: {}", ride_id, e))
        }
    }
}
