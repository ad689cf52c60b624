//! # Rider Session
//!
//! Requests a ride and waits for a driver. The tracker's poll task reports
//! back over a channel so that pushes and polls are both applied on the
//! session loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::model::{
    Cancellation, CreateRideRequest, Position, RIDE_CANCELLED_QUEUE, RideCard,
};
use crate::dispatch::session::{
    Notice, SessionContext, SessionSettings, SessionStore, UiEvent, UiSink, decode_body,
};
use crate::dispatch::tracker::{RideRequest, RideTracker, Tracked, TrackerSignal};
use crate::retrieve::DispatchApi;
use crate::transport::{Connector, Frame, TransportEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum RiderCommand {
    RequestRide { pickup: Position, drop: Position },
    /// Walk away from the current request. Local only.
    CancelRide,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiderRoute {
    RideCard,
    RideCancelled,
}

pub struct RiderSession<C: Connector, A: DispatchApi> {
    ctx: SessionContext<C, A, RiderRoute>,
    tracker: Option<RideTracker>,
    signals_tx: mpsc::UnboundedSender<TrackerSignal>,
    signals_rx: Option<mpsc::UnboundedReceiver<TrackerSignal>>,
}

impl<C: Connector, A: DispatchApi> RiderSession<C, A> {
    pub fn new(
        connector: C,
        api: Arc<A>,
        store: Arc<dyn SessionStore>,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (ui, ui_rx) = UiSink::channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let session = Self {
            ctx: SessionContext::new(connector, api, store, settings, ui),
            tracker: None,
            signals_tx,
            signals_rx: Some(signals_rx),
        };
        (session, ui_rx)
    }

    pub fn tracker(&self) -> Option<&RideTracker> {
        self.tracker.as_ref()
    }

    pub fn context(&self) -> &SessionContext<C, A, RiderRoute> {
        &self.ctx
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RiderCommand>,
        shutdown: CancellationToken,
    ) {
        let (Some(mut transport), Some(mut signals)) =
            (self.ctx.transport.take(), self.signals_rx.take())
        else {
            log::error!("Rider session already ran");
            return;
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = transport.recv() => self.handle_transport(event),
                Some(signal) = signals.recv() => self.handle_signal(signal),
            }
        }

        if let Some(mut tracker) = self.tracker.take() {
            tracker.abandon();
        }
        self.ctx.teardown();
        log::info!("Rider session closed");
    }

    pub async fn handle_command(&mut self, command: RiderCommand) {
        log::debug!("Rider command {:?}", command);
        match command {
            RiderCommand::RequestRide { pickup, drop } => self.request_ride(pickup, drop).await,
            RiderCommand::CancelRide => self.abandon(),
            RiderCommand::Reconnect => {
                if let Some(token) = self.ctx.require_token() {
                    self.ctx.ensure_connected(&token).await;
                }
            }
        }
    }

    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Lifecycle(lifecycle) => self.ctx.on_lifecycle(lifecycle),
            TransportEvent::Frame(frame) => match self.ctx.registry.route(&frame) {
                Some(RiderRoute::RideCard) => self.on_card(&frame),
                Some(RiderRoute::RideCancelled) => {
                    let cancellation = Cancellation::parse(&frame.body);
                    if let Some(tracker) = self.tracker.as_mut() {
                        let tracked = tracker.on_cancellation(&cancellation);
                        self.apply(tracked);
                    }
                }
                None => {}
            },
        }
    }

    pub fn handle_signal(&mut self, signal: TrackerSignal) {
        let Some(tracker) = self.tracker.as_mut() else {
            log::debug!("Signal for ride {} with nothing tracked", signal.ride_id());
            return;
        };
        let tracked = tracker.on_signal(signal);
        self.apply(tracked);
    }

    async fn request_ride(&mut self, pickup: Position, drop: Position) {
        let Some(token) = self.ctx.require_token() else {
            return;
        };
        self.abandon();

        let created = match self
            .ctx
            .api
            .create_ride(&CreateRideRequest::new(pickup, drop))
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.ctx.api_notice(&e, Notice::RideCreationFailed);
                return;
            }
        };
        let request = RideRequest::from(created);
        log::info!("Ride {} created", request.ride_id);
        self.ctx.ui.emit(UiEvent::RideRequested(request.clone()));

        self.ctx.ensure_connected(&token).await;
        let tracker = RideTracker::start(
            request,
            self.ctx.api.clone(),
            self.ctx.settings.poll_interval,
            self.signals_tx.clone(),
        );
        self.ctx
            .registry
            .subscribe(&tracker.topic(), RiderRoute::RideCard);
        self.ctx
            .registry
            .subscribe(RIDE_CANCELLED_QUEUE, RiderRoute::RideCancelled);
        self.tracker = Some(tracker);
    }

    fn on_card(&mut self, frame: &Frame) {
        let card: RideCard = match decode_body(frame) {
            Ok(card) => card,
            Err(e) => {
                log::warn!("Dropping ride card: {}", e);
                return;
            }
        };
        if let Some(tracker) = self.tracker.as_mut() {
            let tracked = tracker.on_push(card);
            self.apply(tracked);
        }
    }

    fn apply(&mut self, tracked: Tracked) {
        let Some(tracker) = self.tracker.as_ref() else {
            return;
        };
        let ride_id = tracker.ride_id();
        let topic = tracker.topic();
        match tracked {
            Tracked::Assigned(card) => {
                self.ctx.registry.unsubscribe(&topic);
                self.ctx.ui.emit(UiEvent::RideCardShown(card));
            }
            Tracked::Cancelled { reason } => {
                self.ctx.registry.unsubscribe(&topic);
                self.ctx
                    .ui
                    .emit(UiEvent::AssignmentCancelled { ride_id, reason });
            }
            Tracked::SessionExpired => self.ctx.ui.notice(Notice::SessionExpired),
            Tracked::Ignored => {}
        }
    }

    fn abandon(&mut self) {
        if let Some(mut tracker) = self.tracker.take() {
            tracker.abandon();
            self.ctx.registry.unsubscribe(&tracker.topic());
        }
    }
}
