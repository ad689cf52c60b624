//! End-to-end driver sessions: the real session loop against the loopback
//! broker and the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use lib_dispatch::dispatch::{
    DriverCommand, DriverSession, DriverStatus, FixedLocation, Notice, Position,
    RIDE_CANCELLED_QUEUE, RIDE_LOCATION_DESTINATION, RIDE_REQUEST_QUEUE,
    RIDE_RESPONSE_DESTINATION, RidePhase, SessionSettings, SessionStore, UiEvent,
};
use lib_dispatch::transport::LoopbackBroker;
use project_tests::{FakeApi, WAIT, expect_event, events_within, fast_settings, signed_in, signed_out};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Driver {
    broker: LoopbackBroker,
    api: Arc<FakeApi>,
    commands: mpsc::UnboundedSender<DriverCommand>,
    ui: mpsc::UnboundedReceiver<UiEvent>,
    shutdown: CancellationToken,
}

fn driver(
    store: Arc<dyn SessionStore>,
    settings: SessionSettings,
) -> (
    Driver,
    DriverSession<LoopbackBroker, FakeApi>,
    mpsc::UnboundedReceiver<DriverCommand>,
) {
    let broker = LoopbackBroker::new();
    let api = Arc::new(FakeApi::new());
    let (session, ui) = DriverSession::new(
        broker.clone(),
        api.clone(),
        store,
        Arc::new(FixedLocation(Position::new(28.6139, 77.2090))),
        settings,
    );
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let handle = Driver {
        broker,
        api,
        commands,
        ui,
        shutdown: CancellationToken::new(),
    };
    (handle, session, commands_rx)
}

fn offer_body(ride_id: i64) -> String {
    format!(r#"{{"rideId":{},"pickupLat":28.61,"pickupLng":77.21}}"#, ride_id)
}

impl Driver {
    fn send(&self, command: DriverCommand) {
        self.commands.send(command).unwrap();
    }

    async fn go_online(&mut self) {
        self.send(DriverCommand::GoOnline);
        expect_event(&mut self.ui, |e| *e == UiEvent::OnlineChanged(true)).await;
        assert!(
            self.broker
                .wait_until(WAIT, |b| b.subscribers(RIDE_REQUEST_QUEUE) == 1
                    && b.subscribers(RIDE_CANCELLED_QUEUE) == 1)
                .await
        );
    }

    // Offers travel through the reader task; give the session loop a moment
    // to queue them before the next command races in.
    async fn offer(&mut self, ride_id: i64) {
        assert_eq!(self.broker.deliver(RIDE_REQUEST_QUEUE, &offer_body(ride_id)), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn phase(&mut self, wanted: RidePhase) {
        expect_event(&mut self.ui, |e| {
            matches!(e, UiEvent::RidePhaseChanged { phase, .. } if *phase == wanted)
        })
        .await;
    }
}

#[tokio::test]
async fn a_full_shift() {
    let (mut d, session, commands) = driver(signed_in(5), fast_settings());
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.go_online().await;
        assert!(
            d.broker
                .wait_until(WAIT, |_| !d.api.locations().is_empty())
                .await
        );
        assert_eq!(d.api.locations()[0].0, 1005);

        d.offer(11).await;
        d.offer(12).await;
        let shown = expect_event(&mut d.ui, |e| matches!(e, UiEvent::OfferShown(_))).await;
        assert!(matches!(shown, UiEvent::OfferShown(o) if o.ride_id == 11));

        d.send(DriverCommand::Accept(11));
        expect_event(&mut d.ui, |e| matches!(e, UiEvent::RideAccepted(r) if r.ride_id == 11)).await;
        assert!(
            d.broker
                .wait_until(WAIT, |b| b.sent_to(RIDE_RESPONSE_DESTINATION).len() == 1)
                .await
        );
        let response: serde_json::Value =
            serde_json::from_str(&d.broker.sent_to(RIDE_RESPONSE_DESTINATION)[0]).unwrap();
        assert_eq!(
            response,
            serde_json::json!({"rideId": 11, "status": "ACCEPTED", "driverId": 1005})
        );

        d.send(DriverCommand::Arrived);
        d.phase(RidePhase::Arrived).await;
        d.send(DriverCommand::VerifyOtp("4821".into()));
        d.phase(RidePhase::InProgress).await;
        assert!(
            d.broker
                .wait_until(WAIT, |b| b.sent_to(RIDE_LOCATION_DESTINATION).len() >= 3)
                .await
        );
        let ping: serde_json::Value =
            serde_json::from_str(&d.broker.sent_to(RIDE_LOCATION_DESTINATION)[0]).unwrap();
        assert_eq!(ping["rideId"], 11);

        d.send(DriverCommand::EndRide);
        d.phase(RidePhase::Completed).await;
        let next = expect_event(&mut d.ui, |e| matches!(e, UiEvent::OfferShown(_))).await;
        assert!(matches!(next, UiEvent::OfferShown(o) if o.ride_id == 12));
        assert_eq!(d.api.ended(), vec![11]);

        d.send(DriverCommand::Reject(12));
        expect_event(&mut d.ui, |e| *e == UiEvent::OfferCleared).await;
        d.send(DriverCommand::GoOffline);
        expect_event(&mut d.ui, |e| *e == UiEvent::OnlineChanged(false)).await;

        assert_eq!(
            d.api.statuses(),
            vec![(1005, DriverStatus::Online), (1005, DriverStatus::Offline)]
        );
        assert_eq!(d.broker.sockets_opened(), 1);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn unanswered_offers_expire() {
    let settings = SessionSettings {
        offer_ttl: Duration::from_millis(200),
        ..fast_settings()
    };
    let (mut d, session, commands) = driver(signed_in(5), settings);
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.go_online().await;
        d.offer(21).await;
        expect_event(&mut d.ui, |e| matches!(e, UiEvent::OfferShown(o) if o.ride_id == 21)).await;
        expect_event(&mut d.ui, |e| *e == UiEvent::OfferCleared).await;

        d.send(DriverCommand::Accept(21));
        let after = events_within(&mut d.ui, Duration::from_millis(200)).await;
        assert!(!after.iter().any(|e| matches!(e, UiEvent::RideAccepted(_))));
        assert!(d.broker.sent_to(RIDE_RESPONSE_DESTINATION).is_empty());
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn wrong_otp_keeps_the_rider_waiting() {
    let (mut d, session, commands) = driver(signed_in(5), fast_settings());
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.go_online().await;
        d.offer(31).await;
        d.send(DriverCommand::Accept(31));
        expect_event(&mut d.ui, |e| matches!(e, UiEvent::RideAccepted(_))).await;

        d.send(DriverCommand::VerifyOtp("0000".into()));
        expect_event(&mut d.ui, |e| *e == UiEvent::Notice(Notice::OtpInvalid)).await;

        d.send(DriverCommand::EndRide);
        let after = events_within(&mut d.ui, Duration::from_millis(150)).await;
        assert!(!after.iter().any(|e| matches!(e, UiEvent::RidePhaseChanged { .. })));
        assert!(d.api.ended().is_empty());
        assert!(d.broker.sent_to(RIDE_LOCATION_DESTINATION).is_empty());
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn server_cancel_ends_the_ride_and_resumes_intake() {
    let (mut d, session, commands) = driver(signed_in(5), fast_settings());
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.go_online().await;
        d.offer(41).await;
        d.offer(42).await;
        d.send(DriverCommand::Accept(41));
        expect_event(&mut d.ui, |e| matches!(e, UiEvent::RideAccepted(_))).await;

        assert_eq!(d.broker.deliver(RIDE_CANCELLED_QUEUE, r#"{"rideId":41}"#), 1);
        expect_event(&mut d.ui, |e| *e == UiEvent::RideCancelled { ride_id: 41 }).await;
        let next = expect_event(&mut d.ui, |e| matches!(e, UiEvent::OfferShown(_))).await;
        assert!(matches!(next, UiEvent::OfferShown(o) if o.ride_id == 42));

        // Cancellations never publish a response.
        assert_eq!(d.broker.sent_to(RIDE_RESPONSE_DESTINATION).len(), 1);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn expired_session_blocks_going_online() {
    let (mut d, session, commands) = driver(signed_out(), fast_settings());
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.send(DriverCommand::GoOnline);
        expect_event(&mut d.ui, |e| *e == UiEvent::Notice(Notice::SessionExpired)).await;
        assert_eq!(d.broker.sockets_opened(), 0);
        assert!(d.api.statuses().is_empty());
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn rejected_token_on_status_change_is_a_session_notice() {
    let (mut d, session, commands) = driver(signed_in(5), fast_settings());
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.api.fail_with(Some(401));
        d.send(DriverCommand::GoOnline);
        expect_event(&mut d.ui, |e| *e == UiEvent::Notice(Notice::SessionExpired)).await;
        assert_eq!(d.broker.sockets_opened(), 0);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn shutdown_reports_offline_and_closes_the_link() {
    let (mut d, session, commands) = driver(signed_in(5), fast_settings());
    let shutdown = d.shutdown.clone();
    let run = session.run(commands, d.shutdown.clone());

    let script = async {
        d.go_online().await;
        shutdown.cancel();
    };

    tokio::join!(run, script);

    assert_eq!(d.api.statuses().last(), Some(&(1005, DriverStatus::Offline)));
    assert!(d.broker.wait_until(WAIT, |b| b.open_clients() == 0).await);
}
