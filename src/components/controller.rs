//! Session Controller
//!
//! Owns the single session slot of the process. `start` spawns a background
//! task that drives one `MeasurementSession` to completion, hands a completed
//! reading to the `MeasurementStore` and then frees the slot, keeping the
//! terminal snapshot around for `status` queries.
//!
//! Events are fanned out over a broadcast channel; subscribers only see events
//! emitted after they subscribed.
use crate::api::events::EventSink;
use crate::api::storage::MeasurementStore;
use crate::api::transport::ScaleTransport;
use crate::components::session::{MeasurementSession, StopHandle, StopSignal};
use crate::core::config::{SessionConfig, UserProfile};
use crate::core::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::errors::{ControlError, FailureKind, PersistenceError};
use crate::core::events::{EventLevel, SessionEvent};
use crate::math::body::BodyComposition;
use crate::model::record::MeasurementRecord;
use crate::model::session::{SessionOutcome, SessionSnapshot, SessionState};
use btleplug::api::BDAddr;
use futures::stream::{self, Stream};
use futures::FutureExt;
use log::{error, info, warn};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Live sequence of session events.
pub type EventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

struct ActiveSession {
    stop: StopHandle,
    snapshot: SessionSnapshot,
}

#[derive(Default)]
struct SessionSlot {
    active: Option<ActiveSession>,
    last: Option<SessionSnapshot>,
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

fn lock(slot: &Mutex<SessionSlot>) -> MutexGuard<'_, SessionSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn aborted(id: Uuid) -> SessionSnapshot {
    let mut snapshot = SessionSnapshot::started(id, None);
    snapshot.finish(&SessionOutcome::Failed(FailureKind::Aborted));
    snapshot
}

/// Mirrors events into the active snapshot, then broadcasts them.
struct ControllerSink {
    slot: SharedSlot,
    events: broadcast::Sender<SessionEvent>,
}

impl EventSink for ControllerSink {
    fn emit(&self, event: SessionEvent) {
        let mut slot = lock(&self.slot);
        if let Some(active) = slot.active.as_mut() {
            if let Some(state) = event.state {
                active.snapshot.state = state;
            }
            active.snapshot.last_event = Some(event.clone());
        }
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn device_found(&self, address: BDAddr) {
        if let Some(active) = lock(&self.slot).active.as_mut() {
            active.snapshot.target_address = Some(address.to_string());
        }
    }

    fn outcome(&self, outcome: &SessionOutcome) {
        if let Some(active) = lock(&self.slot).active.as_mut() {
            active.snapshot.finish(outcome);
        }
    }
}

/// Frees the session slot when the driving task ends, also when it unwinds
/// or is aborted.
struct SlotRelease {
    slot: SharedSlot,
    events: broadcast::Sender<SessionEvent>,
    id: Uuid,
    released: bool,
}

impl SlotRelease {
    fn release(mut self, outcome: &SessionOutcome, composition: Option<BodyComposition>) -> SessionSnapshot {
        self.released = true;
        let mut slot = lock(&self.slot);
        let mut snapshot = slot
            .active
            .take()
            .map(|active| active.snapshot)
            .unwrap_or_else(|| SessionSnapshot::started(self.id, None));
        snapshot.finish(outcome);
        snapshot.composition = composition;
        slot.last = Some(snapshot.clone());
        snapshot
    }
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut slot = lock(&self.slot);
        let Some(active) = slot.active.take() else {
            return;
        };
        let mut snapshot = active.snapshot;
        let event = (if snapshot.state.is_terminal() {
            SessionEvent::new(
                EventLevel::Error,
                format!("session task ended abnormally after reaching {}", snapshot.state),
            )
        } else {
            snapshot.finish(&SessionOutcome::Failed(FailureKind::Aborted));
            SessionEvent::transition(SessionState::Failed, FailureKind::Aborted.to_string())
        })
        .with_session(self.id);
        error!("Session {}: {}", self.id, event.message);
        snapshot.last_event = Some(event.clone());
        slot.last = Some(snapshot);
        drop(slot);
        let _ = self.events.send(event);
    }
}

/// Handle on a started session.
pub struct SessionTicket {
    id: Uuid,
    slot: SharedSlot,
    task: JoinHandle<SessionSnapshot>,
}

impl SessionTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the session to reach a terminal state and be released.
    pub async fn finished(self) -> SessionSnapshot {
        match self.task.await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Session task {} ended abnormally: {}", self.id, e);
                lock(&self.slot)
                    .last
                    .clone()
                    .filter(|last| last.session_id == Some(self.id))
                    .unwrap_or_else(|| aborted(self.id))
            }
        }
    }
}

pub struct SessionController<T: ScaleTransport, S: MeasurementStore> {
    transport: Arc<T>,
    store: Arc<S>,
    profile: Option<UserProfile>,
    slot: SharedSlot,
    events: broadcast::Sender<SessionEvent>,
}

impl<T: ScaleTransport, S: MeasurementStore> SessionController<T, S> {
    pub fn new(transport: T, store: S, profile: Option<UserProfile>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport: Arc::new(transport),
            store: Arc::new(store),
            profile,
            slot: Arc::new(Mutex::new(SessionSlot::default())),
            events,
        }
    }

    /// Starts a session. Without an `address` the first scale advertising the
    /// body composition service is used. Fails if a session is still running.
    pub fn start(&self, address: Option<&str>, config: SessionConfig) -> Result<SessionTicket, ControlError> {
        let target = address
            .map(|a| BDAddr::from_str(a.trim()).map_err(|_| ControlError::InvalidAddress(a.to_string())))
            .transpose()?;
        let id = Uuid::new_v4();
        let (stop, signal) = StopSignal::new();
        {
            let mut slot = lock(&self.slot);
            if slot.active.is_some() {
                return Err(ControlError::AlreadyRunning);
            }
            slot.active = Some(ActiveSession {
                stop,
                snapshot: SessionSnapshot::started(id, target.map(|a| a.to_string())),
            });
        }
        match target {
            Some(address) => info!("Starting measurement session {} for {}.", id, address),
            None => info!("Starting measurement session {}, scale address unknown.", id),
        }

        let transport = self.transport.clone();
        let store = self.store.clone();
        let profile = self.profile;
        let sink = ControllerSink {
            slot: self.slot.clone(),
            events: self.events.clone(),
        };
        let release = SlotRelease {
            slot: self.slot.clone(),
            events: self.events.clone(),
            id,
            released: false,
        };
        let task = tokio::spawn(async move {
            let outcome = MeasurementSession::new(id, transport.as_ref(), target, config, &sink)
                .run(signal)
                .await;

            let mut composition = None;
            if let SessionOutcome::Completed(reading) = &outcome {
                let record = MeasurementRecord::new(*reading, profile.as_ref());
                composition = record.composition;
                let saved = AssertUnwindSafe(persist(store.as_ref(), record))
                    .catch_unwind()
                    .await;
                let event = match saved {
                    Ok(Ok(record_id)) => {
                        info!("Saved measurement {}.", record_id);
                        SessionEvent::new(EventLevel::Info, format!("measurement {} saved", record_id))
                    }
                    Ok(Err(e)) => {
                        error!("Failed to save measurement: {}", e);
                        SessionEvent::new(EventLevel::Error, format!("failed to save measurement: {}", e))
                    }
                    Err(_) => {
                        error!("Measurement store panicked while saving.");
                        SessionEvent::new(EventLevel::Error, "failed to save measurement: store panicked")
                    }
                };
                sink.emit(event.with_session(id));
            }

            let snapshot = release.release(&outcome, composition);
            info!("Session {} finished: {}.", id, snapshot.state);
            snapshot
        });

        Ok(SessionTicket {
            id,
            slot: self.slot.clone(),
            task,
        })
    }

    /// Requests cancellation of the running session. Returns immediately.
    pub fn stop(&self) -> Result<(), ControlError> {
        let slot = lock(&self.slot);
        match slot.active.as_ref() {
            Some(active) if !active.snapshot.state.is_terminal() => {
                info!("Stop requested for session {:?}.", active.snapshot.session_id);
                active.stop.stop();
                Ok(())
            }
            _ => Err(ControlError::NotRunning),
        }
    }

    /// The active session, else the last finished one, else an idle snapshot.
    pub fn status(&self) -> SessionSnapshot {
        let slot = lock(&self.slot);
        slot.active
            .as_ref()
            .map(|active| active.snapshot.clone())
            .or_else(|| slot.last.clone())
            .unwrap_or_else(SessionSnapshot::idle)
    }

    pub fn is_running(&self) -> bool {
        let slot = lock(&self.slot);
        slot.active
            .as_ref()
            .is_some_and(|active| !active.snapshot.state.is_terminal())
    }

    pub fn subscribe(&self) -> EventStream {
        let rx = self.events.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event subscriber lagging, skipped {} events.", skipped)
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }))
    }

    pub async fn recent_measurements(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<MeasurementRecord>, PersistenceError> {
        self.store.recent(limit).await
    }
}

async fn persist<S: MeasurementStore>(store: &S, record: MeasurementRecord) -> Result<Uuid, PersistenceError> {
    let id = record.id;
    store.save(record).await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::simulated::{SimulatedScale, SimulatedTransport, TransportCall};
    use crate::components::storage::MemoryStore;
    use crate::core::config::Gender;
    use crate::model::reading::encode_frame;
    use async_trait::async_trait;
    use futures::StreamExt;
    use mockall::mock;
    use std::time::Duration;

    mock! {
        Store {}
        #[async_trait]
        impl MeasurementStore for Store {
            async fn save(&self, record: MeasurementRecord) -> Result<(), PersistenceError>;
            async fn recent(&self, limit: Option<usize>) -> Result<Vec<MeasurementRecord>, PersistenceError>;
        }
    }

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn scale() -> SimulatedScale {
        SimulatedScale::new(BDAddr::from_str(ADDRESS).unwrap())
    }

    fn weighing() -> SimulatedScale {
        let ms = Duration::from_millis;
        scale().with_frames(vec![
            (ms(300), encode_frame(35.0, None, false)),
            (ms(300), encode_frame(70.2, None, false)),
            (ms(300), encode_frame(72.4, Some(500), true)),
        ])
    }

    fn drain(stream: &mut EventStream) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(Some(event)) = stream.next().now_or_never() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_session_is_saved_once() {
        let mut store = MockStore::new();
        store
            .expect_save()
            .withf(|record| record.reading.weight_kg() == 72.4 && record.reading.is_stabilized())
            .times(1)
            .returning(|_| Ok(()));
        let controller = SessionController::new(SimulatedTransport::new(weighing()), store, None);
        let mut events = controller.subscribe();

        let ticket = controller.start(Some(ADDRESS), SessionConfig::default()).unwrap();
        let snapshot = ticket.finished().await;

        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.result.map(|r| r.weight_kg()), Some(72.4));
        assert!(snapshot.finished_at.is_some());

        let events = drain(&mut events);
        let states: Vec<SessionState> = events.iter().filter_map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Scanning,
                SessionState::Connecting,
                SessionState::Subscribed,
                SessionState::Collecting,
                SessionState::Collecting,
                SessionState::Completed,
            ]
        );
        assert!(events.iter().all(|e| e.session_id == Some(snapshot.session_id.unwrap())));
        let completed = events
            .iter()
            .position(|e| e.state == Some(SessionState::Completed))
            .unwrap();
        let saved = events
            .iter()
            .position(|e| e.message.ends_with("saved"))
            .unwrap();
        assert!(completed < saved);
        assert_eq!(controller.status(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_scale_is_not_saved() {
        let mut store = MockStore::new();
        store.expect_save().times(0);
        let controller =
            SessionController::new(SimulatedTransport::new(scale().silent()), store, None);
        let mut events = controller.subscribe();

        let snapshot = controller
            .start(Some(ADDRESS), SessionConfig::default())
            .unwrap()
            .finished()
            .await;

        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.failure, Some(FailureKind::ScanTimeout));
        let states: Vec<SessionState> = drain(&mut events).iter().filter_map(|e| e.state).collect();
        assert_eq!(states, vec![SessionState::Scanning, SessionState::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_rejected() {
        let controller = SessionController::new(
            SimulatedTransport::new(scale().silent()),
            MemoryStore::new(),
            None,
        );
        let ticket = controller.start(Some(ADDRESS), SessionConfig::default()).unwrap();
        tokio::task::yield_now().await;
        assert!(controller.status().is_running());
        assert_eq!(
            controller
                .start(Some("11:22:33:44:55:66"), SessionConfig::default())
                .err(),
            Some(ControlError::AlreadyRunning)
        );

        ticket.finished().await;
        assert!(controller.start(Some(ADDRESS), SessionConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_stop_while_idle() {
        let controller = SessionController::new(
            SimulatedTransport::new(scale()),
            MemoryStore::new(),
            None,
        );
        assert_eq!(controller.stop(), Err(ControlError::NotRunning));
        assert_eq!(controller.status(), SessionSnapshot::idle());
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let controller = SessionController::new(
            SimulatedTransport::new(scale()),
            MemoryStore::new(),
            None,
        );
        assert_eq!(
            controller.start(Some("not-a-mac"), SessionConfig::default()).err(),
            Some(ControlError::InvalidAddress("not-a-mac".into()))
        );
        assert_eq!(controller.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_collecting_cancels_without_saving() {
        let mut store = MockStore::new();
        store.expect_save().times(0);
        let transport = SimulatedTransport::new(
            scale().with_frames(vec![(Duration::from_millis(100), encode_frame(60.0, None, false))]),
        );
        let controller = SessionController::new(transport.clone(), store, None);
        let mut events = controller.subscribe();

        let ticket = controller.start(Some(ADDRESS), SessionConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.status().state, SessionState::Collecting);
        controller.stop().unwrap();
        let snapshot = ticket.finished().await;

        assert_eq!(snapshot.state, SessionState::Cancelled);
        assert!(snapshot.result.is_none());
        assert!(transport.calls().contains(&TransportCall::Disconnect));
        assert!(drain(&mut events)
            .iter()
            .any(|e| e.message.starts_with("disconnecting")));
        assert_eq!(controller.stop(), Err(ControlError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_keeps_completed_state() {
        let mut store = MockStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(PersistenceError::Task("disk full".into())));
        let controller = SessionController::new(SimulatedTransport::new(weighing()), store, None);
        let mut events = controller.subscribe();

        let snapshot = controller
            .start(Some(ADDRESS), SessionConfig::default())
            .unwrap()
            .finished()
            .await;

        assert_eq!(snapshot.state, SessionState::Completed);
        let failure = drain(&mut events)
            .into_iter()
            .find(|e| e.message.starts_with("failed to save"))
            .unwrap();
        assert_eq!(failure.level, EventLevel::Error);
        assert!(failure.state.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_adds_composition() {
        let profile = UserProfile::new(30, 180.0, Gender::Male).unwrap();
        let controller = SessionController::new(
            SimulatedTransport::new(weighing()),
            MemoryStore::new(),
            Some(profile),
        );
        let snapshot = controller
            .start(Some(ADDRESS), SessionConfig::default())
            .unwrap()
            .finished()
            .await;

        assert!(snapshot.composition.is_some());
        let stored = controller.recent_measurements(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].composition, snapshot.composition);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_sees_only_future_events() {
        let controller = SessionController::new(
            SimulatedTransport::new(scale().silent()),
            MemoryStore::new(),
            None,
        );
        controller
            .start(Some(ADDRESS), SessionConfig::default())
            .unwrap()
            .finished()
            .await;

        let mut late = controller.subscribe();
        assert!(drain(&mut late).is_empty());

        let ticket = controller.start(Some(ADDRESS), SessionConfig::default()).unwrap();
        let second = ticket.id();
        ticket.finished().await;
        let events = drain(&mut late);
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.session_id == Some(second)));
    }

    struct PanickingStore;

    #[async_trait]
    impl MeasurementStore for PanickingStore {
        async fn save(&self, _record: MeasurementRecord) -> Result<(), PersistenceError> {
            panic!("store backend crashed")
        }

        async fn recent(&self, _limit: Option<usize>) -> Result<Vec<MeasurementRecord>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_store_does_not_wedge_slot() {
        let controller =
            SessionController::new(SimulatedTransport::new(weighing()), PanickingStore, None);
        let mut events = controller.subscribe();

        let snapshot = controller
            .start(Some(ADDRESS), SessionConfig::default())
            .unwrap()
            .finished()
            .await;

        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.result.map(|r| r.weight_kg()), Some(72.4));
        let failure = drain(&mut events)
            .into_iter()
            .find(|e| e.message.starts_with("failed to save"))
            .unwrap();
        assert_eq!(failure.level, EventLevel::Error);
        assert!(controller
            .start(Some(ADDRESS), SessionConfig::default())
            .is_ok());
    }

    #[test]
    fn test_abandoned_session_frees_slot() {
        let slot: SharedSlot = Arc::default();
        let (events, mut rx) = broadcast::channel(4);
        let id = Uuid::new_v4();
        let (stop, _signal) = StopSignal::new();
        lock(&slot).active = Some(ActiveSession {
            stop,
            snapshot: SessionSnapshot::started(id, Some(ADDRESS.into())),
        });

        drop(SlotRelease {
            slot: slot.clone(),
            events,
            id,
            released: false,
        });

        let slot = lock(&slot);
        assert!(slot.active.is_none());
        let last = slot.last.clone().unwrap();
        assert_eq!(last.state, SessionState::Failed);
        assert_eq!(last.failure, Some(FailureKind::Aborted));
        assert!(last.finished_at.is_some());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, Some(SessionState::Failed));
        assert_eq!(event.session_id, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_carries_result_during_teardown() {
        let transport =
            SimulatedTransport::new(weighing().slow_to_disconnect(Duration::from_secs(3)));
        let controller = SessionController::new(transport, MemoryStore::new(), None);
        let ticket = controller.start(Some(ADDRESS), SessionConfig::default()).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = controller.status();
        assert_eq!(status.state, SessionState::Completed);
        assert_eq!(status.result.map(|r| r.weight_kg()), Some(72.4));
        assert!(status.finished_at.is_some());
        assert!(!controller.is_running());
        assert_eq!(
            controller
                .start(Some(ADDRESS), SessionConfig::default())
                .err(),
            Some(ControlError::AlreadyRunning)
        );

        let snapshot = ticket.finished().await;
        assert_eq!(snapshot.finished_at, status.finished_at);
        assert_eq!(snapshot.result, status.result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_carries_failure_during_teardown() {
        let transport = SimulatedTransport::new(
            scale()
                .with_frames(vec![(Duration::from_millis(100), encode_frame(60.0, None, false))])
                .closing_after_frames()
                .slow_to_disconnect(Duration::from_secs(3)),
        );
        let controller = SessionController::new(transport, MemoryStore::new(), None);
        let ticket = controller.start(Some(ADDRESS), SessionConfig::default()).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = controller.status();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.failure, Some(FailureKind::ConnectionLost));

        assert_eq!(ticket.finished().await.failure, Some(FailureKind::ConnectionLost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_address_discovers_scale() {
        let controller =
            SessionController::new(SimulatedTransport::new(weighing()), MemoryStore::new(), None);
        let ticket = controller.start(None, SessionConfig::default()).unwrap();
        assert_eq!(controller.status().target_address, None);

        let snapshot = ticket.finished().await;
        assert_eq!(snapshot.state, SessionState::Completed);
        assert_eq!(snapshot.target_address.as_deref(), Some(ADDRESS));
    }
}
