//! End-to-end rider sessions: the assignment race between pushes on the ride
//! topic and the REST poll loop.

use std::sync::Arc;
use std::time::Duration;

use lib_dispatch::dispatch::{
    Notice, Position, RIDE_CANCELLED_QUEUE, RequestStatus, RideStatus, RiderCommand,
    RiderSession, SessionStore, UiEvent, ride_topic,
};
use lib_dispatch::transport::{LifecycleEvent, LoopbackBroker};
use project_tests::{FakeApi, WAIT, card, events_within, expect_event, fast_settings, signed_in};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Rider {
    broker: LoopbackBroker,
    api: Arc<FakeApi>,
    commands: mpsc::UnboundedSender<RiderCommand>,
    ui: mpsc::UnboundedReceiver<UiEvent>,
    shutdown: CancellationToken,
}

fn rider(
    store: Arc<dyn SessionStore>,
) -> (
    Rider,
    RiderSession<LoopbackBroker, FakeApi>,
    mpsc::UnboundedReceiver<RiderCommand>,
) {
    let broker = LoopbackBroker::new();
    let api = Arc::new(FakeApi::new());
    let (session, ui) = RiderSession::new(broker.clone(), api.clone(), store, fast_settings());
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let handle = Rider {
        broker,
        api,
        commands,
        ui,
        shutdown: CancellationToken::new(),
    };
    (handle, session, commands_rx)
}

impl Rider {
    /// Requests a ride and returns its id once the session is tracking it.
    async fn request(&mut self) -> i64 {
        self.commands
            .send(RiderCommand::RequestRide {
                pickup: Position::new(28.6139, 77.2090),
                drop: Position::new(28.5355, 77.3910),
            })
            .unwrap();
        let requested = expect_event(&mut self.ui, |e| matches!(e, UiEvent::RideRequested(_))).await;
        let UiEvent::RideRequested(request) = requested else {
            unreachable!()
        };
        assert_eq!(request.status, RequestStatus::Created);
        request.ride_id
    }

    async fn subscribed(&self, ride_id: i64) {
        let topic = ride_topic(ride_id);
        assert!(
            self.broker
                .wait_until(WAIT, |b| b.subscribers(&topic) == 1
                    && b.subscribers(RIDE_CANCELLED_QUEUE) == 1)
                .await
        );
    }
}

fn card_json(ride_id: i64, status: RideStatus, with_driver: bool) -> String {
    serde_json::to_string(&card(ride_id, status, with_driver)).unwrap()
}

#[tokio::test]
async fn push_wins_and_the_poll_stops() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.subscribed(ride_id).await;
        assert_eq!(r.api.created().len(), 1);

        let topic = ride_topic(ride_id);
        assert_eq!(
            r.broker.deliver(&topic, &card_json(ride_id, RideStatus::Assigned, true)),
            1
        );
        let shown = expect_event(&mut r.ui, |e| matches!(e, UiEvent::RideCardShown(_))).await;
        assert!(matches!(shown, UiEvent::RideCardShown(c) if c.driver.is_some()));

        // The backend catches up; nobody is asking any more.
        r.api.set_card(card(ride_id, RideStatus::Assigned, true));
        let polls = r.api.card_polls();
        let later = events_within(&mut r.ui, Duration::from_millis(350)).await;
        assert!(!later.iter().any(|e| matches!(e, UiEvent::RideCardShown(_))));
        assert_eq!(r.api.card_polls(), polls);
        assert!(r.broker.wait_until(WAIT, |b| b.subscribers(&topic) == 0).await);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn poll_wins_when_pushes_go_missing() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.subscribed(ride_id).await;

        r.api.set_card(card(ride_id, RideStatus::Assigned, true));
        expect_event(&mut r.ui, |e| matches!(e, UiEvent::RideCardShown(c) if c.ride_id == ride_id))
            .await;

        let topic = ride_topic(ride_id);
        assert!(r.broker.wait_until(WAIT, |b| b.subscribers(&topic) == 0).await);
        assert_eq!(
            r.broker.deliver(&topic, &card_json(ride_id, RideStatus::Assigned, true)),
            0
        );
        let later = events_within(&mut r.ui, Duration::from_millis(300)).await;
        assert!(!later.iter().any(|e| matches!(e, UiEvent::RideCardShown(_))));
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn assignment_without_driver_is_not_final() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.subscribed(ride_id).await;

        r.broker
            .deliver(&ride_topic(ride_id), &card_json(ride_id, RideStatus::Assigned, false));
        let early = events_within(&mut r.ui, Duration::from_millis(150)).await;
        assert!(!early.iter().any(|e| matches!(e, UiEvent::RideCardShown(_))));

        r.broker
            .deliver(&ride_topic(ride_id), &card_json(ride_id, RideStatus::Assigned, true));
        expect_event(&mut r.ui, |e| matches!(e, UiEvent::RideCardShown(_))).await;
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn server_cancellation_reaches_the_rider_once() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.subscribed(ride_id).await;

        let body = format!(r#"{{"rideId":{}}}"#, ride_id);
        r.broker.deliver(RIDE_CANCELLED_QUEUE, &body);
        let cancelled = expect_event(&mut r.ui, |e| {
            matches!(e, UiEvent::AssignmentCancelled { .. })
        })
        .await;
        assert_eq!(
            cancelled,
            UiEvent::AssignmentCancelled {
                ride_id,
                reason: None
            }
        );

        r.broker.deliver(RIDE_CANCELLED_QUEUE, &body);
        r.api.set_card(card(ride_id, RideStatus::Assigned, true));
        let polls = r.api.card_polls();
        let later = events_within(&mut r.ui, Duration::from_millis(300)).await;
        assert!(later.is_empty(), "unexpected events {:?}", later);
        assert_eq!(r.api.card_polls(), polls);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn free_text_cancellation_carries_its_reason() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.subscribed(ride_id).await;

        r.broker
            .deliver(RIDE_CANCELLED_QUEUE, "No drivers available near you");
        let cancelled = expect_event(&mut r.ui, |e| {
            matches!(e, UiEvent::AssignmentCancelled { .. })
        })
        .await;
        assert_eq!(
            cancelled,
            UiEvent::AssignmentCancelled {
                ride_id,
                reason: Some("No drivers available near you".into())
            }
        );
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn cancelled_card_from_the_poll_ends_tracking() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.api.set_card(card(ride_id, RideStatus::Cancelled, false));
        let cancelled = expect_event(&mut r.ui, |e| {
            matches!(e, UiEvent::AssignmentCancelled { .. })
        })
        .await;
        assert!(matches!(cancelled, UiEvent::AssignmentCancelled { ride_id: id, .. } if id == ride_id));
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn polling_alone_carries_the_ride_when_the_link_is_down() {
    let (mut r, session, commands) = rider(signed_in(3));
    r.broker.refuse_connections(Some("dispatch down"));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        expect_event(&mut r.ui, |e| {
            matches!(e, UiEvent::Connection(LifecycleEvent::Error(_)))
        })
        .await;

        r.api.set_card(card(ride_id, RideStatus::Assigned, true));
        expect_event(&mut r.ui, |e| matches!(e, UiEvent::RideCardShown(_))).await;
        assert_eq!(r.broker.sockets_opened(), 0);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn walking_away_is_silent() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        let ride_id = r.request().await;
        r.subscribed(ride_id).await;

        r.commands.send(RiderCommand::CancelRide).unwrap();
        let topic = ride_topic(ride_id);
        assert!(r.broker.wait_until(WAIT, |b| b.subscribers(&topic) == 0).await);

        r.api.set_card(card(ride_id, RideStatus::Assigned, true));
        let polls = r.api.card_polls();
        let later = events_within(&mut r.ui, Duration::from_millis(300)).await;
        assert!(later.is_empty(), "unexpected events {:?}", later);
        assert_eq!(r.api.card_polls(), polls);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}

#[tokio::test]
async fn failed_creation_is_a_single_notice() {
    let (mut r, session, commands) = rider(signed_in(3));
    let shutdown = r.shutdown.clone();
    let run = session.run(commands, r.shutdown.clone());

    let script = async {
        r.api.fail_with(Some(503));
        r.commands
            .send(RiderCommand::RequestRide {
                pickup: Position::new(1.0, 1.0),
                drop: Position::new(2.0, 2.0),
            })
            .unwrap();
        let notice = expect_event(&mut r.ui, |e| matches!(e, UiEvent::Notice(_))).await;
        assert!(matches!(notice, UiEvent::Notice(Notice::RideCreationFailed(_))));

        let later = events_within(&mut r.ui, Duration::from_millis(200)).await;
        assert!(later.is_empty());
        assert_eq!(r.broker.sockets_opened(), 0);
        shutdown.cancel();
    };

    tokio::join!(run, script);
}
