//! # Location Telemetry
//!
//! Periodic position sampling pushed to a sink. One publisher owns at most
//! one sampling task; `start` always replaces the running task, so the
//! driver never ends up with two timers. A tick without a fix is skipped and
//! a failed delivery is logged; neither stops the loop. Stopping also abandons
//! a delivery that is still in flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::dispatch::model::{LocationSample, Position, RIDE_LOCATION_DESTINATION, Subject};
use crate::errors::{PublishError, TelemetryError};
use crate::retrieve::DispatchApi;
use crate::transport::{Outbound, Publisher};

/// Where positions come from (GPS, a simulator, a fixed point).
pub trait LocationSource: Send + Sync + 'static {
    /// Latest fix, or `None` when there is none yet.
    fn current(&self, high_accuracy: bool) -> Option<Position>;
}

/// A source that always reports the same position.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Position);

impl LocationSource for FixedLocation {
    fn current(&self, _high_accuracy: bool) -> Option<Position> {
        Some(self.0)
    }
}

/// Where samples go.
pub trait LocationSink: Send + Sync + 'static {
    fn deliver(
        &self,
        sample: LocationSample,
    ) -> impl Future<Output = Result<(), TelemetryError>> + Send;
}

/// Ride pings over the STOMP link: `{rideId, lat, lng}` on `/app/ride/location`.
#[derive(Clone)]
pub struct StompLocationSink {
    publisher: Publisher,
}

impl StompLocationSink {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

impl LocationSink for StompLocationSink {
    async fn deliver(&self, sample: LocationSample) -> Result<(), TelemetryError> {
        let body = serde_json::to_string(&sample.ping())
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        self.publisher.publish(RIDE_LOCATION_DESTINATION, &body)?;
        Ok(())
    }
}

/// Online-driver position over REST (`api/drivers-location/{driverId}`).
pub struct RestLocationSink<A: DispatchApi> {
    api: Arc<A>,
}

impl<A: DispatchApi> RestLocationSink<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self { api }
    }
}

impl<A: DispatchApi> LocationSink for RestLocationSink<A> {
    async fn deliver(&self, sample: LocationSample) -> Result<(), TelemetryError> {
        match sample.subject {
            Subject::Driver(driver_id) => {
                self.api
                    .update_driver_location(driver_id, sample.position)
                    .await?;
                Ok(())
            }
            Subject::Ride(ride_id) => Err(TelemetryError::UnsupportedSubject(format!(
                "ride {}",
                ride_id
            ))),
        }
    }
}

/// Period used when a caller asks for a zero interval.
pub const FALLBACK_PERIOD: Duration = Duration::from_secs(1);

struct Running {
    token: CancellationToken,
    period: Duration,
    subject: Subject,
}

/// Owner of the single sampling task.
#[derive(Default)]
pub struct TelemetryPublisher {
    running: Option<Running>,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts sampling every `period`, first sample immediately. A running
    /// task is stopped first. The returned token stops this task only.
    pub fn start<S, K>(
        &mut self,
        subject: Subject,
        period: Duration,
        high_accuracy: bool,
        source: Arc<S>,
        sink: K,
    ) -> CancellationToken
    where
        S: LocationSource + ?Sized,
        K: LocationSink,
    {
        self.stop();

        let period = if period.is_zero() {
            log::warn!(
                "Zero telemetry interval for {:?}; using {:?}",
                subject,
                FALLBACK_PERIOD
            );
            FALLBACK_PERIOD
        } else {
            period
        };
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(position) = source.current(high_accuracy) else {
                    log::debug!("No location fix; skipping tick");
                    continue;
                };
                let sample = LocationSample { subject, position, taken_at: Utc::now() };
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    delivered = sink.deliver(sample) => {
                        if let Err(e) = delivered {
                            log::warn!("Location sample for {:?} dropped: {}", subject, e);
                        }
                    }
                }
            }
            log::debug!("Telemetry for {:?} stopped", subject);
        });

        log::info!(
            "Telemetry for {:?} every {:?} (high accuracy: {})",
            subject,
            period,
            high_accuracy
        );
        self.running = Some(Running {
            token: token.clone(),
            period,
            subject,
        });
        token
    }

    /// Stops the running task, if any.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn period(&self) -> Option<Duration> {
        self.running.as_ref().map(|r| r.period)
    }

    pub fn subject(&self) -> Option<Subject> {
        self.running.as_ref().map(|r| r.subject)
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}
