//! E2E tests for offline capture and replay
//!
//! Drives real sync agents against a real controller through an in-process
//! link that behaves like a connection session: a hub subscription, a
//! snapshot on connect, and a receipt per submission. Covers replay after a
//! reconnect, discarding laps an operator reset made obsolete, and a lap
//! that was in flight while the session reset.

use chrono::Utc;
use lapsync::controller::ResetKind;
use lapsync::hub::{Delivery, Subscription};
use lapsync::protocol::{ClientMessage, ReceiptStatus, ServerMessage};
use lapsync::sync::{new_client_record_id, AgentState, Effect, Notice};
use lapsync::{ControllerHandle, EngineConfig, MemoryStore, SyncAgent};
use std::collections::{HashSet, VecDeque};

/// One client's agent wired to the controller without a socket
struct Link {
    controller: ControllerHandle,
    agent: SyncAgent,
    attempt: u64,
    subscription: Option<Subscription>,
    inbox: VecDeque<ServerMessage>,
    notices: Vec<Notice>,
}

impl Link {
    fn new(controller: &ControllerHandle) -> Self {
        Self {
            controller: controller.clone(),
            agent: SyncAgent::new(),
            attempt: 0,
            subscription: None,
            inbox: VecDeque::new(),
            notices: Vec::new(),
        }
    }

    /// Subscribe first, then queue the snapshot, like the server does
    async fn connect(&mut self) {
        self.attempt = self.agent.begin_connect();
        self.subscription = Some(self.controller.subscribe());
        self.agent.on_connected(self.attempt);
        let view = self.controller.snapshot();
        self.inbox.push_back(ServerMessage::from(view.as_ref()));
        self.settle().await;
    }

    fn disconnect(&mut self) {
        self.subscription = None;
        self.inbox.clear();
        let effects = self.agent.on_transport_lost(self.attempt);
        self.collect(effects);
    }

    /// Capture a lap and carry out whatever the agent does with it
    async fn lap(&mut self, elapsed_ms: u64) -> String {
        let id = new_client_record_id();
        let effects = self.agent.record(id.clone(), elapsed_ms, Utc::now());
        self.apply(effects).await;
        self.settle().await;
        id
    }

    async fn request_reset(&mut self) {
        let effect = self.agent.request_reset().expect("reset needs a connection");
        self.apply(vec![effect]).await;
        self.settle().await;
    }

    /// Feed queued replies and hub events to the agent until both run dry
    async fn settle(&mut self) {
        loop {
            if let Some(subscription) = self.subscription.as_mut() {
                while let Some(delivery) = subscription.try_next() {
                    match delivery {
                        Delivery::Event(event) => {
                            self.inbox.push_back(ServerMessage::from(event.as_ref()))
                        }
                        other => panic!("Unexpected delivery {:?}", other),
                    }
                }
            }
            let Some(message) = self.inbox.pop_front() else {
                break;
            };
            let effects = self.agent.on_server_message(self.attempt, message);
            self.apply(effects).await;
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => self.serve(message).await,
                Effect::Notify(notice) => self.notices.push(notice),
            }
        }
    }

    fn collect(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            if let Effect::Notify(notice) = effect {
                self.notices.push(notice);
            }
        }
    }

    async fn serve(&mut self, message: ClientMessage) {
        if self.subscription.is_none() {
            return;
        }
        match message {
            ClientMessage::SubmitRecord {
                client_record_id,
                elapsed_ms,
                captured_at,
                session_id,
            } => {
                let outcome = self
                    .controller
                    .submit(elapsed_ms, client_record_id.clone(), session_id, Some(captured_at))
                    .await
                    .unwrap();
                self.inbox.push_back(ServerMessage::Receipt {
                    client_record_id,
                    status: ReceiptStatus::from(&outcome),
                });
            }
            ClientMessage::RequestSnapshot => {
                let view = self.controller.snapshot();
                self.inbox.push_back(ServerMessage::from(view.as_ref()));
            }
            ClientMessage::RequestReset => {
                self.controller.reset(ResetKind::Explicit).await.unwrap();
            }
        }
    }

    fn discarded(&self) -> usize {
        self.notices
            .iter()
            .map(|n| match n {
                Notice::ReplayDiscarded(records) => records.len(),
                _ => 0,
            })
            .sum()
    }
}

fn spawn_controller() -> ControllerHandle {
    ControllerHandle::spawn(Box::new(MemoryStore::new()), EngineConfig::default()).unwrap()
}

/// Laps recorded offline are replayed on reconnect; one that was committed
/// but never acknowledged is not duplicated
#[tokio::test]
async fn test_offline_laps_replayed_without_duplicates() {
    let controller = spawn_controller();
    let mut link = Link::new(&controller);
    link.connect().await;
    assert!(link.agent.is_synced());

    link.lap(1_000).await;
    assert!(link.agent.pending().is_empty());

    // Committed on the server, but the link drops before the receipt
    let unacked = new_client_record_id();
    let effects = link.agent.record(unacked.clone(), 2_000, Utc::now());
    for effect in effects {
        if let Effect::Send(ClientMessage::SubmitRecord {
            client_record_id,
            elapsed_ms,
            captured_at,
            session_id,
        }) = effect
        {
            controller
                .submit(elapsed_ms, client_record_id, session_id, Some(captured_at))
                .await
                .unwrap();
        }
    }
    link.disconnect();
    assert_eq!(link.agent.state(), AgentState::Offline);
    assert!(link.agent.pending().contains(&unacked));

    link.lap(3_000).await;
    link.lap(4_000).await;
    assert_eq!(link.agent.pending().len(), 3);
    assert_eq!(controller.snapshot().len(), 2);

    link.connect().await;
    assert!(link.agent.is_synced());
    assert!(link.agent.pending().is_empty());

    let view = controller.snapshot();
    let elapsed: Vec<u64> = view.records.iter().map(|r| r.elapsed_ms).collect();
    assert_eq!(elapsed, vec![1_000, 2_000, 3_000, 4_000]);
    let ids: HashSet<&str> = view
        .records
        .iter()
        .map(|r| r.client_record_id.as_str())
        .collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(link.agent.records(), view.records.as_slice());
    assert_eq!(link.discarded(), 0);
}

/// Laps recorded offline in an epoch another client reset are dropped
/// with a notice instead of leaking into the new session
#[tokio::test]
async fn test_offline_laps_discarded_after_remote_reset() {
    let controller = spawn_controller();
    let mut offline = Link::new(&controller);
    let mut operator = Link::new(&controller);
    offline.connect().await;
    operator.connect().await;
    let old = controller.snapshot().session_id.clone();

    offline.lap(1_000).await;
    offline.disconnect();
    offline.lap(2_000).await;
    offline.lap(3_000).await;
    assert_eq!(offline.agent.pending().len(), 2);

    operator.request_reset().await;
    let new = controller.snapshot().session_id.clone();
    assert_ne!(new, old);
    assert_eq!(operator.agent.session_id(), Some(&new));
    assert!(operator.agent.records().is_empty());

    offline.connect().await;
    assert_eq!(offline.agent.session_id(), Some(&new));
    assert!(offline.agent.pending().is_empty());
    assert!(offline.agent.records().is_empty());
    assert_eq!(offline.discarded(), 2);
    assert!(controller.snapshot().is_empty());
}

/// A lap submitted just before a reset lands nowhere: it is rejected and
/// the new session starts empty on every client
#[tokio::test]
async fn test_lap_in_flight_across_reset_not_carried_over() {
    let controller = spawn_controller();
    let mut runner = Link::new(&controller);
    let mut operator = Link::new(&controller);
    runner.connect().await;
    operator.connect().await;

    let id = new_client_record_id();
    let effects = runner.agent.record(id.clone(), 5_000, Utc::now());
    let in_flight: Vec<Effect> = effects
        .into_iter()
        .filter(|e| matches!(e, Effect::Send(_)))
        .collect();
    assert_eq!(in_flight.len(), 1);

    operator.request_reset().await;
    runner.apply(in_flight).await;
    runner.settle().await;

    assert!(controller.snapshot().is_empty());
    assert!(runner.agent.pending().is_empty());
    assert!(!runner.agent.pending().contains(&id));
    assert!(runner.agent.records().is_empty());
    assert_eq!(runner.agent.session_id(), operator.agent.session_id());
    assert!(!runner.notices.iter().any(|n| matches!(
        n,
        Notice::ServerError(_) | Notice::SubmissionFailed { .. }
    )));
}

/// Laps captured before the first connection join whatever session the
/// client first sees
#[tokio::test]
async fn test_laps_before_first_connect_join_current_session() {
    let controller = spawn_controller();
    controller.reset(ResetKind::Explicit).await.unwrap();

    let mut link = Link::new(&controller);
    link.lap(1_500).await;
    link.lap(2_500).await;
    assert_eq!(link.agent.pending().len(), 2);

    link.connect().await;
    let view = controller.snapshot();
    assert_eq!(view.len(), 2);
    assert!(view.records.iter().all(|r| r.session_id == view.session_id));
    assert!(link.agent.pending().is_empty());
    assert_eq!(link.discarded(), 0);
}
