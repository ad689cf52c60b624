//! # Driver Session
//!
//! Online/offline toggling, the offer queue, the active ride and location
//! telemetry for one signed-in driver. Commands, transport events and the
//! offer-expiry sweep are all handled on the single `run` loop.
//!
//! Telemetry has two modes: while online without a started ride, positions
//! go to the REST location endpoint; once the rider's OTP is verified they go
//! over STOMP as ride pings at high accuracy.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::active_ride::RidePhase;
use crate::dispatch::model::{
    Cancellation, DriverStatus, RIDE_CANCELLED_QUEUE, RIDE_REQUEST_QUEUE, RideOfferPayload,
    Subject,
};
use crate::dispatch::offers::{OfferQueue, QueueChange, RideOffer};
use crate::dispatch::session::{
    Notice, SessionContext, SessionSettings, SessionStore, UiEvent, UiSink, decode_body,
};
use crate::dispatch::telemetry::{
    LocationSource, RestLocationSink, StompLocationSink, TelemetryPublisher,
};
use crate::errors::{ApiError, StateConflict};
use crate::retrieve::DispatchApi;
use crate::transport::{Connector, Frame, LifecycleEvent, TransportEvent};

/// Actions a driver front-end can take.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    GoOnline,
    GoOffline,
    Accept(i64),
    Reject(i64),
    Arrived,
    VerifyOtp(String),
    EndRide,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRoute {
    RideRequest,
    RideCancelled,
}

pub struct DriverSession<C: Connector, A: DispatchApi> {
    ctx: SessionContext<C, A, DriverRoute>,
    queue: OfferQueue,
    telemetry: TelemetryPublisher,
    location: Arc<dyn LocationSource>,
    driver_id: Option<i64>,
    online: bool,
}

impl<C: Connector, A: DispatchApi> DriverSession<C, A> {
    pub fn new(
        connector: C,
        api: Arc<A>,
        store: Arc<dyn SessionStore>,
        location: Arc<dyn LocationSource>,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (ui, ui_rx) = UiSink::channel();
        let session = Self {
            ctx: SessionContext::new(connector, api, store, settings, ui),
            queue: OfferQueue::new(),
            telemetry: TelemetryPublisher::new(),
            location,
            driver_id: None,
            online: false,
        };
        (session, ui_rx)
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn queue(&self) -> &OfferQueue {
        &self.queue
    }

    pub fn telemetry(&self) -> &TelemetryPublisher {
        &self.telemetry
    }

    pub fn context(&self) -> &SessionContext<C, A, DriverRoute> {
        &self.ctx
    }

    /// Runs the session until `shutdown` fires or the command channel closes,
    /// then goes offline and closes the link.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        shutdown: CancellationToken,
    ) {
        let Some(mut transport) = self.ctx.transport.take() else {
            log::error!("Driver session already ran");
            return;
        };
        let mut sweep = tokio::time::interval(self.ctx.settings.expiry_sweep);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = transport.recv() => self.handle_transport(event),
                _ = sweep.tick() => self.expire_offers(),
            }
        }

        self.shutdown().await;
    }

    pub async fn handle_command(&mut self, command: DriverCommand) {
        log::debug!("Driver command {:?}", command);
        match command {
            DriverCommand::GoOnline => self.go_online().await,
            DriverCommand::GoOffline => self.go_offline().await,
            DriverCommand::Accept(ride_id) => self.accept(ride_id),
            DriverCommand::Reject(ride_id) => self.reject(ride_id),
            DriverCommand::Arrived => self.arrived(),
            DriverCommand::VerifyOtp(code) => self.verify_otp(&code).await,
            DriverCommand::EndRide => self.end_ride().await,
            DriverCommand::Reconnect => {
                if let Some(token) = self.ctx.require_token() {
                    self.ctx.ensure_connected(&token).await;
                }
            }
        }
    }

    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Lifecycle(lifecycle) => {
                let opened = lifecycle == LifecycleEvent::Opened;
                self.ctx.on_lifecycle(lifecycle);
                if opened {
                    self.refresh_ride_telemetry();
                }
            }
            TransportEvent::Frame(frame) => match self.ctx.registry.route(&frame) {
                Some(DriverRoute::RideRequest) => self.on_offer(&frame),
                Some(DriverRoute::RideCancelled) => self.on_cancelled(&frame),
                None => {}
            },
        }
    }

    async fn go_online(&mut self) {
        if self.online {
            log::debug!("Already online");
            return;
        }
        let Some(token) = self.ctx.require_token() else {
            return;
        };
        let driver_id = match self.resolve_driver_id().await {
            Ok(id) => id,
            Err(e) => {
                self.ctx.api_notice(&e, Notice::OnlineStatusFailed);
                return;
            }
        };
        if let Err(e) = self
            .ctx
            .api
            .update_online_status(driver_id, DriverStatus::Online)
            .await
        {
            self.ctx.api_notice(&e, Notice::OnlineStatusFailed);
            return;
        }

        self.online = true;
        log::info!("Driver {} online", driver_id);
        self.ctx.ui.emit(UiEvent::OnlineChanged(true));

        self.ctx.ensure_connected(&token).await;
        self.ctx
            .registry
            .subscribe(RIDE_REQUEST_QUEUE, DriverRoute::RideRequest);
        self.ctx
            .registry
            .subscribe(RIDE_CANCELLED_QUEUE, DriverRoute::RideCancelled);

        if !self.ride_started() {
            self.start_online_telemetry(driver_id);
        }
    }

    async fn go_offline(&mut self) {
        if !self.online {
            return;
        }
        if let Some(active) = self.queue.active() {
            log::warn!(
                "{}",
                StateConflict::InvalidPhase {
                    action: "go offline",
                    phase: active.phase.as_str(),
                }
            );
            return;
        }
        if let Some(driver_id) = self.driver_id {
            if let Err(e) = self
                .ctx
                .api
                .update_online_status(driver_id, DriverStatus::Offline)
                .await
            {
                self.ctx.api_notice(&e, Notice::OnlineStatusFailed);
            }
        }

        self.telemetry.stop();
        self.ctx.registry.clear_all();
        let change = self.queue.clear();
        self.show(change);
        self.online = false;
        log::info!("Driver offline");
        self.ctx.ui.emit(UiEvent::OnlineChanged(false));
    }

    fn accept(&mut self, ride_id: i64) {
        let Some(driver_id) = self.driver_id else {
            log::warn!("Accept({}) before the driver id is known", ride_id);
            return;
        };
        let publisher = self.ctx.connection.publisher();
        match self.queue.accept(ride_id, driver_id, &publisher) {
            Ok(decided) => {
                if decided.delivery.is_err() {
                    self.ctx.ui.notice(Notice::ResponseNotDelivered { ride_id });
                }
                self.show(decided.change);
                if let Some(active) = self.queue.active() {
                    self.ctx.ui.emit(UiEvent::RideAccepted(active.clone()));
                }
            }
            Err(conflict) => log::warn!("Accept ignored: {}", conflict),
        }
    }

    fn reject(&mut self, ride_id: i64) {
        let Some(driver_id) = self.driver_id else {
            log::warn!("Reject({}) before the driver id is known", ride_id);
            return;
        };
        let publisher = self.ctx.connection.publisher();
        match self.queue.reject(ride_id, driver_id, &publisher) {
            Ok(decided) => {
                if decided.delivery.is_err() {
                    self.ctx.ui.notice(Notice::ResponseNotDelivered { ride_id });
                }
                self.show(decided.change);
            }
            Err(conflict) => log::warn!("Reject ignored: {}", conflict),
        }
    }

    fn arrived(&mut self) {
        let Some(active) = self.queue.active_mut() else {
            log::warn!("Arrived ignored: {}", StateConflict::NoActiveRide);
            return;
        };
        match active.arrive() {
            Ok(phase) => {
                let ride_id = active.ride_id;
                self.ctx
                    .ui
                    .emit(UiEvent::RidePhaseChanged { ride_id, phase });
            }
            Err(conflict) => log::warn!("Arrived ignored: {}", conflict),
        }
    }

    async fn verify_otp(&mut self, otp: &str) {
        let ride_id = match self.queue.active() {
            Some(active) if active.awaiting_otp() => active.ride_id,
            Some(active) => {
                log::warn!(
                    "OTP ignored: {}",
                    StateConflict::InvalidPhase {
                        action: "verify OTP",
                        phase: active.phase.as_str(),
                    }
                );
                return;
            }
            None => {
                log::warn!("OTP ignored: {}", StateConflict::NoActiveRide);
                return;
            }
        };

        if self.ctx.store.token().is_none() {
            self.ctx.ui.notice(Notice::SessionExpired);
            return;
        }
        if let Err(e) = self.ctx.api.verify_otp(ride_id, otp.trim()).await {
            self.ctx.api_notice(&e, |_| Notice::OtpInvalid);
            return;
        }

        let Some(active) = self.queue.active_mut() else {
            return;
        };
        match active.start() {
            Ok(phase) => {
                self.ctx
                    .ui
                    .emit(UiEvent::RidePhaseChanged { ride_id, phase });
                self.refresh_ride_telemetry();
            }
            Err(conflict) => log::warn!("Start ignored: {}", conflict),
        }
    }

    async fn end_ride(&mut self) {
        let ride_id = match self.queue.active() {
            Some(active) if active.phase == RidePhase::InProgress => active.ride_id,
            Some(active) => {
                log::warn!(
                    "End ignored: {}",
                    StateConflict::InvalidPhase {
                        action: "end",
                        phase: active.phase.as_str(),
                    }
                );
                return;
            }
            None => {
                log::warn!("End ignored: {}", StateConflict::NoActiveRide);
                return;
            }
        };

        if let Err(e) = self.ctx.api.end_ride(ride_id).await {
            self.ctx.api_notice(&e, Notice::RideEndFailed);
            return;
        }

        if let Some(active) = self.queue.active_mut() {
            if let Ok(phase) = active.complete() {
                self.ctx
                    .ui
                    .emit(UiEvent::RidePhaseChanged { ride_id, phase });
            }
        }
        let change = self.queue.release_active();
        self.back_to_online_mode();
        self.show(change);
    }

    fn on_offer(&mut self, frame: &Frame) {
        let payload: RideOfferPayload = match decode_body(frame) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Dropping ride request: {}", e);
                return;
            }
        };
        match self.queue.enqueue(RideOffer::new(&payload, Utc::now())) {
            Ok(change) => self.show(change),
            Err(conflict) => log::info!("Offer not queued: {}", conflict),
        }
    }

    fn on_cancelled(&mut self, frame: &Frame) {
        let cancellation = Cancellation::parse(&frame.body);
        let change = self.queue.cancel(&cancellation);
        if let Some(ended) = &change.ended {
            self.ctx.ui.emit(UiEvent::RideCancelled {
                ride_id: ended.ride_id,
            });
            self.back_to_online_mode();
        }
        self.show(change);
    }

    fn expire_offers(&mut self) {
        let Ok(ttl) = chrono::Duration::from_std(self.ctx.settings.offer_ttl) else {
            return;
        };
        let change = self.queue.expire(Utc::now(), ttl);
        if !change.removed.is_empty() {
            self.show(change);
        }
    }

    fn show(&self, change: QueueChange) {
        if let Some(offer) = change.shown {
            self.ctx.ui.emit(UiEvent::OfferShown(offer));
        } else if change.cleared {
            self.ctx.ui.emit(UiEvent::OfferCleared);
        }
    }

    async fn resolve_driver_id(&mut self) -> Result<i64, ApiError> {
        if let Some(id) = self.driver_id.or_else(|| self.ctx.store.driver_id()) {
            self.driver_id = Some(id);
            return Ok(id);
        }
        let user_id = self
            .ctx
            .store
            .user_id()
            .ok_or(ApiError::Unauthorized { status: 401 })?;
        let id = self.ctx.api.driver_id_for_user(user_id).await?;
        log::info!("Resolved driver {} for user {}", id, user_id);
        self.ctx.store.set_driver_id(id);
        self.driver_id = Some(id);
        Ok(id)
    }

    fn ride_started(&self) -> bool {
        self.queue
            .active()
            .map(|a| a.phase == RidePhase::InProgress)
            .unwrap_or(false)
    }

    fn start_online_telemetry(&mut self, driver_id: i64) {
        self.telemetry.start(
            Subject::Driver(driver_id),
            self.ctx.settings.online_telemetry,
            false,
            self.location.clone(),
            RestLocationSink::new(self.ctx.api.clone()),
        );
    }

    // Ride pings are bound to the current link, so they restart whenever a
    // new link comes up.
    fn refresh_ride_telemetry(&mut self) {
        let Some(active) = self.queue.active() else {
            return;
        };
        if active.phase != RidePhase::InProgress {
            return;
        }
        let ride_id = active.ride_id;
        self.telemetry.start(
            Subject::Ride(ride_id),
            self.ctx.settings.ride_telemetry,
            true,
            self.location.clone(),
            StompLocationSink::new(self.ctx.connection.publisher()),
        );
    }

    fn back_to_online_mode(&mut self) {
        self.telemetry.stop();
        if let (true, Some(driver_id)) = (self.online, self.driver_id) {
            self.start_online_telemetry(driver_id);
        }
    }

    async fn shutdown(&mut self) {
        self.telemetry.stop();
        if let (true, Some(driver_id)) = (self.online, self.driver_id) {
            if let Err(e) = self
                .ctx
                .api
                .update_online_status(driver_id, DriverStatus::Offline)
                .await
            {
                log::warn!("Could not report offline on shutdown: {}", e);
            }
        }
        self.online = false;
        self.ctx.teardown();
        log::info!("Driver session closed");
    }
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::model::{Position, RIDE_LOCATION_DESTINATION, RIDE_RESPONSE_DESTINATION};
    use crate::dispatch::session::StaticSession;
    use crate::dispatch::telemetry::FixedLocation;
    use crate::dispatch::tracker::tests::ScriptedCards;
    use crate::transport::LoopbackBroker;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        broker: LoopbackBroker,
        session: DriverSession<LoopbackBroker, ScriptedCards>,
        ui: mpsc::UnboundedReceiver<UiEvent>,
        transport: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(token: Option<&str>) -> Harness {
        let broker = LoopbackBroker::new();
        let store = Arc::new(StaticSession::new(token.map(str::to_string), Some(5), None));
        let settings = SessionSettings {
            online_telemetry: Duration::from_secs(60),
            ride_telemetry: Duration::from_millis(50),
            ..SessionSettings::default()
        };
        let (mut session, ui) = DriverSession::new(
            broker.clone(),
            Arc::new(ScriptedCards::new(vec![])),
            store,
            Arc::new(FixedLocation(Position::new(28.6, 77.2))),
            settings,
        );
        let transport = session.ctx.transport.take().unwrap();
        Harness {
            broker,
            session,
            ui,
            transport,
        }
    }

    impl Harness {
        async fn pump(&mut self) {
            let event = tokio::time::timeout(WAIT, self.transport.recv())
                .await
                .unwrap()
                .unwrap();
            self.session.handle_transport(event);
        }

        fn drain_ui(&mut self) -> Vec<UiEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.ui.try_recv() {
                events.push(event);
            }
            events
        }

        async fn online(&mut self) {
            self.session.handle_command(DriverCommand::GoOnline).await;
            self.pump().await;
            assert!(
                self.broker
                    .wait_until(WAIT, |b| b.subscribers(RIDE_REQUEST_QUEUE) == 1
                        && b.subscribers(RIDE_CANCELLED_QUEUE) == 1)
                    .await
            );
        }

        async fn offer(&mut self, ride_id: i64) {
            let body = format!(r#"{{"rideId":{},"pickupLat":28.6,"pickupLng":77.2}}"#, ride_id);
            assert_eq!(self.broker.deliver(RIDE_REQUEST_QUEUE, &body), 1);
            self.pump().await;
        }

        async fn accepted(&mut self, ride_id: i64) {
            self.offer(ride_id).await;
            self.session.handle_command(DriverCommand::Accept(ride_id)).await;
        }
    }

    #[tokio::test]
    async fn going_online_without_token_only_notices() {
        let mut h = harness(None);
        h.session.handle_command(DriverCommand::GoOnline).await;

        assert_eq!(h.drain_ui(), vec![UiEvent::Notice(Notice::SessionExpired)]);
        assert!(!h.session.is_online());
        assert_eq!(h.broker.sockets_opened(), 0);
    }

    #[tokio::test]
    async fn going_online_resolves_driver_and_starts_rest_telemetry() {
        let mut h = harness(Some("tok"));
        h.online().await;

        assert!(h.session.is_online());
        assert_eq!(h.session.ctx.store.driver_id(), Some(5));
        assert_eq!(h.session.telemetry().subject(), Some(Subject::Driver(5)));
        let events = h.drain_ui();
        assert!(events.contains(&UiEvent::OnlineChanged(true)));
        assert!(events.contains(&UiEvent::Connection(LifecycleEvent::Opened)));

        h.session.handle_command(DriverCommand::GoOnline).await;
        assert_eq!(h.broker.sockets_opened(), 1);
    }

    #[tokio::test]
    async fn accept_publishes_and_holds_the_queue() {
        let mut h = harness(Some("tok"));
        h.online().await;
        h.offer(7).await;
        h.offer(8).await;
        h.drain_ui();

        h.session.handle_command(DriverCommand::Accept(7)).await;
        assert!(
            h.broker
                .wait_until(WAIT, |b| b.sent_to(RIDE_RESPONSE_DESTINATION).len() == 1)
                .await
        );
        let sent = h.broker.sent_to(RIDE_RESPONSE_DESTINATION);
        assert!(sent[0].contains(r#""rideId":7"#) && sent[0].contains("ACCEPTED"));

        let events = h.drain_ui();
        assert_eq!(events[0], UiEvent::OfferCleared);
        assert!(matches!(&events[1], UiEvent::RideAccepted(r) if r.ride_id == 7));
        assert!(h.session.queue().shown().is_none());
        assert_eq!(h.session.queue().len(), 1);
    }

    #[tokio::test]
    async fn ride_runs_from_otp_to_completion() {
        let mut h = harness(Some("tok"));
        h.online().await;
        h.offer(7).await;
        h.offer(8).await;
        h.session.handle_command(DriverCommand::Accept(7)).await;
        h.drain_ui();

        h.session.handle_command(DriverCommand::Arrived).await;
        h.session
            .handle_command(DriverCommand::VerifyOtp(" 4821 ".into()))
            .await;
        assert_eq!(h.session.telemetry().subject(), Some(Subject::Ride(7)));
        assert!(
            h.broker
                .wait_until(WAIT, |b| b.sent_to(RIDE_LOCATION_DESTINATION).len() >= 2)
                .await
        );
        assert!(h.broker.sent_to(RIDE_LOCATION_DESTINATION)[0].contains(r#""rideId":7"#));

        h.session.handle_command(DriverCommand::EndRide).await;
        assert_eq!(h.session.telemetry().subject(), Some(Subject::Driver(5)));
        assert!(h.session.queue().active().is_none());

        let events = h.drain_ui();
        let phases: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UiEvent::RidePhaseChanged { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![RidePhase::Arrived, RidePhase::InProgress, RidePhase::Completed]
        );
        assert!(matches!(events.last(), Some(UiEvent::OfferShown(o)) if o.ride_id == 8));
    }

    #[tokio::test]
    async fn end_before_otp_is_ignored() {
        let mut h = harness(Some("tok"));
        h.online().await;
        h.accepted(7).await;
        h.drain_ui();

        h.session.handle_command(DriverCommand::EndRide).await;
        h.session.handle_command(DriverCommand::GoOffline).await;

        assert!(h.drain_ui().is_empty());
        assert!(h.session.is_online());
        assert_eq!(
            h.session.queue().active().map(|a| a.phase),
            Some(RidePhase::Accepted)
        );
    }

    #[tokio::test]
    async fn server_cancel_of_active_ride_resumes_intake() {
        let mut h = harness(Some("tok"));
        h.online().await;
        h.offer(7).await;
        h.offer(8).await;
        h.session.handle_command(DriverCommand::Accept(7)).await;
        h.drain_ui();

        assert_eq!(h.broker.deliver(RIDE_CANCELLED_QUEUE, r#"{"rideId":7}"#), 1);
        h.pump().await;

        let events = h.drain_ui();
        assert_eq!(events[0], UiEvent::RideCancelled { ride_id: 7 });
        assert!(matches!(&events[1], UiEvent::OfferShown(o) if o.ride_id == 8));
        assert!(h.session.queue().active().is_none());
    }

    #[tokio::test]
    async fn going_offline_drops_offers_and_subscriptions() {
        let mut h = harness(Some("tok"));
        h.online().await;
        h.offer(7).await;
        h.drain_ui();

        h.session.handle_command(DriverCommand::GoOffline).await;

        assert_eq!(
            h.drain_ui(),
            vec![UiEvent::OfferCleared, UiEvent::OnlineChanged(false)]
        );
        assert!(h.session.queue().is_empty());
        assert!(!h.session.telemetry().is_running());
        assert!(
            h.broker
                .wait_until(WAIT, |b| b.subscribers(RIDE_REQUEST_QUEUE) == 0)
                .await
        );
        assert_eq!(h.broker.open_clients(), 1);
    }

    #[tokio::test]
    async fn reconnect_after_loss_resubscribes() {
        let mut h = harness(Some("tok"));
        h.online().await;
        h.drain_ui();

        h.broker.drop_connections();
        h.pump().await;
        let events = h.drain_ui();
        assert!(matches!(events[0], UiEvent::Notice(Notice::ConnectionLost(_))));
        assert_eq!(events[1], UiEvent::Connection(LifecycleEvent::Closed));

        h.session.handle_command(DriverCommand::Reconnect).await;
        h.pump().await;
        assert_eq!(h.broker.sockets_opened(), 2);
        assert!(
            h.broker
                .wait_until(WAIT, |b| b.subscribers(RIDE_REQUEST_QUEUE) == 1)
                .await
        );
    }
}
