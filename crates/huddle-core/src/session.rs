use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::classifier::classify;
use crate::config::{ControllerConfig, SessionConfig};
use crate::devices::{Device, DeviceKind, DeviceManager, DevicePlatform};
use crate::errors::{ClassifiedError, ConfigError, ErrorKind, RecoveryAction};
use crate::events::{EventEmitter, HuddleEvent, HuddleEventListener};
use crate::health::{ConnectionHealthMonitor, ConnectionQualitySample, HealthVerdict};
use crate::roster::{Attendee, ParticipantRoster, RosterChange, RosterDelta};
use crate::transport::{OpenedSession, RawError, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Reconnecting,
    Leaving,
    Left,
    Failed,
}

impl SessionState {
    /// `Left` and `Failed` accept no further state-changing operation.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Left | SessionState::Failed)
    }

    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Reconnecting)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Joining)
                | (Idle, Leaving)
                | (Joining, Active)
                | (Joining, Failed)
                | (Joining, Leaving)
                | (Active, Reconnecting)
                | (Active, Leaving)
                | (Active, Failed)
                | (Reconnecting, Active)
                | (Reconnecting, Leaving)
                | (Reconnecting, Failed)
                | (Leaving, Left)
        )
    }
}

/// One conferencing engagement, from a successful join to leave or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub local_attendee_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: SessionState,
    session: Option<Session>,
    roster: ParticipantRoster,
    health: ConnectionHealthMonitor,
    /// Bumped whenever a session attempt starts or ends; stale async work
    /// compares against it and discards its result.
    generation: u64,
    /// Bumped whenever a reconnection episode starts or ends.
    reconnect_epoch: u64,
    event_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Shared<T: Transport, P: DevicePlatform> {
    transport: T,
    devices: DeviceManager<P>,
    config: ControllerConfig,
    emitter: EventEmitter,
    inner: Mutex<Inner>,
}

/// Drives one session through its lifecycle.
///
/// A controller starts `Idle` and serves exactly one session: once it reaches
/// `Left` or `Failed`, every state-changing call returns `InvalidState` and a
/// new controller must be constructed for the next session.
///
/// Listeners are invoked synchronously while controller state is locked and
/// must not call back into the controller from `on_event`.
pub struct SessionController<T: Transport, P: DevicePlatform> {
    shared: Arc<Shared<T, P>>,
}

impl<T: Transport, P: DevicePlatform> SessionController<T, P> {
    pub fn new(transport: T, platform: P, config: ControllerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Inner {
            state: SessionState::Idle,
            session: None,
            roster: ParticipantRoster::new(),
            health: ConnectionHealthMonitor::new(config.health.clone()),
            generation: 0,
            reconnect_epoch: 0,
            event_task: None,
            reconnect_task: None,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                devices: DeviceManager::new(platform),
                config,
                emitter: EventEmitter::new(),
                inner: Mutex::new(inner),
            }),
        })
    }

    /// Register a listener for session events.
    pub fn add_listener(&self, listener: Arc<dyn HuddleEventListener>) {
        self.shared.emitter.add_listener(listener);
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn devices(&self) -> &DeviceManager<P> {
        &self.shared.devices
    }

    /// Join a session. Only valid from `Idle`.
    ///
    /// Resolves once the session is `Active`, or with the error that moved it
    /// to `Failed`. If `leave()` runs first, the join resolves with
    /// `InvalidState` and its outcome is discarded.
    pub async fn join(&self, config: SessionConfig) -> Result<Session, ClassifiedError> {
        self.shared.join(config).await
    }

    /// Leave the session. Always ends in `Left` unless already terminal.
    ///
    /// A second call while a leave is still closing the transport returns
    /// `Ok` at once; the first call completes the move to `Left`.
    pub async fn leave(&self) -> Result<(), ClassifiedError> {
        self.shared.leave().await
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    pub async fn session(&self) -> Option<Session> {
        self.shared.inner.lock().await.session.clone()
    }

    /// Attendees in join order, local participant included.
    pub async fn roster_snapshot(&self) -> Vec<Attendee> {
        self.shared.inner.lock().await.roster.snapshot()
    }

    pub fn list_devices(&self, kind: DeviceKind) -> Result<Vec<Device>, ClassifiedError> {
        self.shared.devices.list_devices(kind)
    }

    /// Select a device; hot-swaps the live stream when the session is active.
    ///
    /// Video tiles are left bound across a camera swap.
    pub async fn select_device(&self, kind: DeviceKind, device_id: &str) -> Result<Device, ClassifiedError> {
        let state = self.state().await;
        tracing::debug!("select {kind} '{device_id}' while {state:?}");
        self.shared.devices.select_device(kind, device_id)
    }

    pub async fn request_permission(&self, kind: DeviceKind) -> Result<(), ClassifiedError> {
        self.shared.devices.request_permission(kind).await
    }

    /// Entry point for platform device-change notifications.
    ///
    /// Surfaces the new device sets to the application; never re-selects.
    pub async fn notify_device_change(&self) {
        let report = self.shared.devices.refresh();
        for (kind, devices) in report.changed {
            self.shared.emitter.emit(HuddleEvent::DeviceSetChanged { kind, devices });
        }
        for kind in report.lost {
            self.shared
                .emitter
                .emit(HuddleEvent::DeviceUnavailable(ClassifiedError::device_unavailable(format!(
                    "selected {kind} device was disconnected"
                ))));
        }
    }
}

impl<T: Transport, P: DevicePlatform> Drop for SessionController<T, P> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            inner.generation += 1;
            if let Some(task) = inner.event_task.take() {
                task.abort();
            }
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
        }
    }
}

impl<T: Transport, P: DevicePlatform> Shared<T, P> {
    async fn join(self: &Arc<Self>, config: SessionConfig) -> Result<Session, ClassifiedError> {
        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Idle {
                return Err(ClassifiedError::invalid_state(format!(
                    "join requires an idle controller, state is {:?}",
                    inner.state
                )));
            }
            inner.generation += 1;
            self.transition(&mut inner, SessionState::Joining);
            inner.generation
        };

        let max_attempts = self.config.max_join_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.try_open(generation, &config).await {
                Ok(opened) => return self.finish_join(generation, &config, opened).await,
                Err(err) => err,
            };
            if !self.is_joining(generation).await {
                return Err(cancelled_join());
            }
            if !err.recoverable || attempt >= max_attempts {
                tracing::warn!("join failed after {attempt} attempt(s): {err}");
                return Err(self.fail_join(generation, err).await);
            }
            let delay = self.config.join_backoff.delay_for(attempt);
            tracing::info!("join attempt {attempt} failed ({err}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            if !self.is_joining(generation).await {
                return Err(cancelled_join());
            }
        }
    }

    async fn try_open(&self, generation: u64, config: &SessionConfig) -> Result<OpenedSession, ClassifiedError> {
        let chosen = self.devices.prepare(config).await?;
        // A permission prompt can outlive a leave(); neither devices nor the
        // transport are touched on behalf of a cancelled join.
        if !self.is_joining(generation).await {
            return Err(cancelled_join());
        }
        self.devices.bind_all(chosen)?;
        match self.transport.open_session(config).await {
            Ok(opened) => Ok(opened),
            Err(raw) => {
                self.devices.release_all();
                Err(classify(&raw))
            }
        }
    }

    async fn is_joining(&self, generation: u64) -> bool {
        let inner = self.inner.lock().await;
        inner.generation == generation && inner.state == SessionState::Joining
    }

    async fn finish_join(
        self: &Arc<Self>,
        generation: u64,
        config: &SessionConfig,
        opened: OpenedSession,
    ) -> Result<Session, ClassifiedError> {
        let OpenedSession {
            session_id,
            local_attendee_id,
            events,
        } = opened;

        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != SessionState::Joining {
            drop(inner);
            tracing::info!("discarding session {session_id} opened after leave");
            self.devices.release_all();
            self.close_quietly(Some(session_id)).await;
            return Err(cancelled_join());
        }

        let session = Session {
            id: session_id.clone(),
            state: SessionState::Active,
            local_attendee_id: local_attendee_id.clone(),
            started_at: Utc::now(),
            ended_at: None,
        };
        inner.session = Some(session.clone());
        inner.health.reset();
        self.transition(&mut inner, SessionState::Active);
        tracing::info!(session_id = %session_id, local_attendee_id = %local_attendee_id, "session started");
        self.emitter.emit(HuddleEvent::SessionStarted {
            session_id,
            local_attendee_id: local_attendee_id.clone(),
        });

        let display_name = config.display_name.as_deref().unwrap_or(&local_attendee_id);
        let has_camera = config.video_enabled && self.devices.selected(DeviceKind::VideoInput).is_some();
        let changes = inner.roster.set_local(&local_attendee_id, display_name, has_camera);
        self.emit_roster_changes(&inner, changes);

        let task = tokio::spawn(self.clone().event_loop(generation, events));
        inner.event_task = Some(task);
        Ok(session)
    }

    async fn fail_join(&self, generation: u64, err: ClassifiedError) -> ClassifiedError {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != SessionState::Joining {
            return cancelled_join();
        }
        // No transport session exists yet, so nothing to close.
        let _ = self.fail_locked(&mut inner, err.clone());
        err
    }

    async fn leave(&self) -> Result<(), ClassifiedError> {
        let session_id = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Leaving {
                tracing::debug!("leave already in progress");
                return Ok(());
            }
            if inner.state.is_terminal() {
                return Err(ClassifiedError::invalid_state(format!(
                    "leave is not valid in state {:?}",
                    inner.state
                )));
            }
            inner.generation += 1;
            self.cancel_reconnect(&mut inner);
            if let Some(task) = inner.event_task.take() {
                task.abort();
            }
            self.transition(&mut inner, SessionState::Leaving);
            inner.session.as_ref().map(|s| s.id.clone())
        };

        self.devices.release_all();
        self.close_quietly(session_id).await;

        let mut inner = self.inner.lock().await;
        self.end_session(&mut inner, SessionState::Left);
        Ok(())
    }

    async fn event_loop(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            let to_close = {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation {
                    break;
                }
                // Detach our own handle so a failure below cannot abort us
                // before the transport session is closed.
                let own = inner.event_task.take();
                let to_close = self.handle_event(&mut inner, event);
                if inner.generation == generation {
                    inner.event_task = own;
                }
                to_close
            };
            if to_close.is_some() {
                self.close_quietly(to_close).await;
                return;
            }
        }

        let to_close = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || !inner.state.is_live() {
                return;
            }
            inner.event_task.take();
            self.fail_locked(
                &mut inner,
                ClassifiedError::network_unrecoverable("transport event stream closed"),
            )
        };
        self.close_quietly(to_close).await;
    }

    /// Returns the id of a session that must be closed after a fatal event.
    fn handle_event(self: &Arc<Self>, inner: &mut Inner, event: TransportEvent) -> Option<String> {
        match event {
            TransportEvent::RosterDelta(delta) => {
                self.on_roster_update(inner, &delta);
                None
            }
            TransportEvent::ActiveSpeaker(attendee_id) => {
                let changes = inner.roster.set_active_speaker(attendee_id.as_deref());
                self.emit_roster_changes(inner, changes);
                None
            }
            TransportEvent::QualitySample(sample) => self.on_connection_quality(inner, sample),
            TransportEvent::Error(raw) => self.on_transport_error(inner, &raw),
        }
    }

    fn on_roster_update(&self, inner: &mut Inner, delta: &RosterDelta) {
        let changes = inner.roster.apply_delta(delta);
        self.emit_roster_changes(inner, changes);
    }

    fn on_connection_quality(
        self: &Arc<Self>,
        inner: &mut Inner,
        sample: ConnectionQualitySample,
    ) -> Option<String> {
        if !inner.state.is_live() {
            return None;
        }
        match (inner.state, inner.health.observe(sample)) {
            (_, HealthVerdict::Unrecoverable) => {
                return self.fail_locked(
                    inner,
                    ClassifiedError::network_unrecoverable("connection quality did not recover"),
                );
            }
            (SessionState::Active, HealthVerdict::Degraded) => {
                tracing::warn!(
                    avg_loss = inner.health.average_packet_loss(),
                    "connection degraded, reconnecting"
                );
                self.start_reconnect(inner);
            }
            (SessionState::Reconnecting, HealthVerdict::Healthy) => {
                tracing::info!("connection quality restored");
                self.finish_reconnect(inner);
            }
            _ => {}
        }
        None
    }

    fn on_transport_error(self: &Arc<Self>, inner: &mut Inner, raw: &RawError) -> Option<String> {
        let err = classify(raw);
        if !inner.state.is_live() {
            tracing::debug!("ignoring transport error in state {:?}: {err}", inner.state);
            return None;
        }
        if !err.recoverable {
            return self.fail_locked(inner, err);
        }

        if err.kind == ErrorKind::DeviceUnavailable {
            tracing::warn!("device error from transport: {err}");
            self.emitter.emit(HuddleEvent::DeviceUnavailable(err));
            if inner.state == SessionState::Active && !self.devices.has_capture_device() {
                tracing::warn!("no capture device left, treating as degraded network");
                self.start_reconnect(inner);
            }
        } else if err.recommended_action == RecoveryAction::Retry && inner.state == SessionState::Active {
            tracing::warn!("recoverable transport error: {err}");
            self.start_reconnect(inner);
        }
        None
    }

    fn start_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        let Some(session_id) = inner.session.as_ref().map(|s| s.id.clone()) else {
            return;
        };
        self.cancel_reconnect(inner);
        let epoch = inner.reconnect_epoch;
        self.transition(inner, SessionState::Reconnecting);
        let task = tokio::spawn(
            self.clone()
                .reconnect_loop(inner.generation, epoch, session_id),
        );
        inner.reconnect_task = Some(task);
    }

    fn finish_reconnect(&self, inner: &mut Inner) {
        self.cancel_reconnect(inner);
        inner.health.reset();
        self.transition(inner, SessionState::Active);
        self.emitter.emit(HuddleEvent::SessionReconnected);
    }

    fn cancel_reconnect(&self, inner: &mut Inner) {
        inner.reconnect_epoch += 1;
        if let Some(task) = inner.reconnect_task.take() {
            task.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>, generation: u64, epoch: u64, session_id: String) {
        let backoff = &self.config.reconnect_backoff;
        let is_current = |inner: &Inner| {
            inner.generation == generation
                && inner.reconnect_epoch == epoch
                && inner.state == SessionState::Reconnecting
        };

        for attempt in 1..=backoff.max_attempts {
            {
                let inner = self.inner.lock().await;
                if !is_current(&inner) {
                    return;
                }
                self.emitter.emit(HuddleEvent::SessionReconnecting { attempt });
            }

            let delay = backoff.delay_for(attempt);
            tracing::info!(session_id = %session_id, "reconnection attempt {attempt} in {delay:?}");
            tokio::time::sleep(delay).await;
            if !is_current(&*self.inner.lock().await) {
                return;
            }

            let result = self.transport.reconnect(&session_id).await;

            let to_close = {
                let mut inner = self.inner.lock().await;
                if !is_current(&inner) {
                    return;
                }
                match result {
                    Ok(()) => {
                        inner.reconnect_task.take();
                        tracing::info!(session_id = %session_id, "reconnected after {attempt} attempt(s)");
                        self.finish_reconnect(&mut inner);
                        return;
                    }
                    Err(raw) => {
                        let err = classify(&raw);
                        if err.recoverable {
                            tracing::warn!("reconnection attempt {attempt} failed: {err}");
                            continue;
                        }
                        inner.reconnect_task.take();
                        self.fail_locked(&mut inner, err)
                    }
                }
            };
            self.close_quietly(to_close).await;
            return;
        }

        let to_close = {
            let mut inner = self.inner.lock().await;
            if !is_current(&inner) {
                return;
            }
            inner.reconnect_task.take();
            self.fail_locked(
                &mut inner,
                ClassifiedError::network_unrecoverable(format!(
                    "gave up after {} reconnection attempts",
                    backoff.max_attempts
                )),
            )
        };
        self.close_quietly(to_close).await;
    }

    /// Move to `Failed`, tearing down everything except the transport session,
    /// whose id is returned for the caller to close once the lock is released.
    fn fail_locked(&self, inner: &mut Inner, err: ClassifiedError) -> Option<String> {
        tracing::error!("session failed: {err}");
        inner.generation += 1;
        self.cancel_reconnect(inner);
        if let Some(task) = inner.event_task.take() {
            task.abort();
        }
        self.devices.release_all();
        let session_id = inner.session.as_ref().map(|s| s.id.clone());
        self.end_session(inner, SessionState::Failed);
        self.emitter.emit(HuddleEvent::SessionFailed(err));
        session_id
    }

    fn end_session(&self, inner: &mut Inner, terminal: SessionState) {
        let changes = inner.roster.clear();
        self.emit_roster_changes(inner, changes);
        self.transition(inner, terminal);
        if let Some(mut session) = inner.session.take() {
            session.ended_at = Some(Utc::now());
            session.state = terminal;
            tracing::info!(session_id = %session.id, "session ended ({terminal:?})");
            self.emitter.emit(HuddleEvent::SessionEnded(session));
        }
    }

    async fn close_quietly(&self, session_id: Option<String>) {
        let Some(session_id) = session_id else {
            return;
        };
        if let Err(e) = self.transport.close_session(&session_id).await {
            tracing::warn!("error closing session {session_id}: {e}");
        }
    }

    fn transition(&self, inner: &mut Inner, next: SessionState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        debug_assert!(
            previous.can_transition_to(next),
            "illegal transition {previous:?} -> {next:?}"
        );
        tracing::info!("session state {previous:?} -> {next:?}");
        inner.state = next;
        if let Some(session) = inner.session.as_mut() {
            session.state = next;
        }
        self.emitter.emit(HuddleEvent::StateChanged(next));
    }

    fn emit_roster_changes(&self, inner: &Inner, changes: Vec<RosterChange>) {
        if changes.is_empty() {
            return;
        }
        for change in changes {
            match change {
                RosterChange::TileBound { attendee_id, tile_id } => {
                    self.emitter.emit(HuddleEvent::VideoTileBound { attendee_id, tile_id });
                }
                RosterChange::TileReleased { attendee_id, tile_id } => {
                    self.emitter.emit(HuddleEvent::VideoTileReleased { attendee_id, tile_id });
                }
                other => tracing::debug!("roster: {other:?}"),
            }
        }
        self.emitter.emit(HuddleEvent::RosterChanged(inner.roster.snapshot()));
    }
}

fn cancelled_join() -> ClassifiedError {
    ClassifiedError::invalid_state("join was cancelled by leave")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::config::{BackoffConfig, HealthConfig};
    use crate::roster::{AttendeePresence, TileId};
    use crate::sim::{MemoryDevices, SimulatedTransport};

    type Controller = SessionController<SimulatedTransport, MemoryDevices>;

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<HuddleEvent>>,
    }

    impl HuddleEventListener for Recorder {
        fn on_event(&self, event: HuddleEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<HuddleEvent> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, pred: impl Fn(&HuddleEvent) -> bool) -> usize {
            self.events().iter().filter(|e| pred(e)).count()
        }

        fn failure(&self) -> Option<ClassifiedError> {
            self.events().into_iter().find_map(|e| match e {
                HuddleEvent::SessionFailed(err) => Some(err),
                _ => None,
            })
        }
    }

    fn fixed_backoff(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            max_join_attempts: 3,
            join_backoff: fixed_backoff(3),
            reconnect_backoff: fixed_backoff(3),
            health: HealthConfig {
                degraded_after: 5,
                unrecoverable_after: 12,
                ..HealthConfig::default()
            },
        }
    }

    struct Harness {
        controller: Arc<Controller>,
        transport: SimulatedTransport,
        devices: MemoryDevices,
        recorder: Arc<Recorder>,
    }

    fn harness_with(config: ControllerConfig) -> Harness {
        let transport = SimulatedTransport::new();
        transport.set_local_attendee_id("me");
        let devices = MemoryDevices::with_defaults();
        let controller = SessionController::new(transport.clone(), devices.clone(), config).unwrap();
        let recorder = Arc::new(Recorder::default());
        controller.add_listener(recorder.clone());
        Harness {
            controller: Arc::new(controller),
            transport,
            devices,
            recorder,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn mic_1() -> SessionConfig {
        SessionConfig {
            audio_input_id: Some("mic-1".into()),
            display_name: Some("Me".into()),
            ..SessionConfig::new("standup")
        }
    }

    fn poor() -> TransportEvent {
        TransportEvent::QualitySample(ConnectionQualitySample::new(0.4, 0.2, 50))
    }

    fn healthy() -> TransportEvent {
        TransportEvent::QualitySample(ConnectionQualitySample::new(0.0, 0.95, 1_200))
    }

    fn add_remote(id: &str, video: bool) -> TransportEvent {
        TransportEvent::RosterDelta(RosterDelta {
            added: vec![AttendeePresence {
                attendee_id: id.to_string(),
                display_name: id.to_uppercase(),
                audio_enabled: true,
                video_enabled: video,
            }],
            ..Default::default()
        })
    }

    fn remove_remote(id: &str) -> TransportEvent {
        TransportEvent::RosterDelta(RosterDelta {
            removed: vec![id.to_string()],
            ..Default::default()
        })
    }

    /// Let the event loop and any spawned task drain without advancing time.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn degrade(h: &Harness) {
        for _ in 0..5 {
            assert!(h.transport.emit(poor()));
        }
        settle().await;
    }

    #[test]
    fn transition_table_is_closed() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Joining));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Leaving.can_transition_to(Left));
        assert!(!Idle.can_transition_to(Active));
        assert!(!Leaving.can_transition_to(Failed));
        for terminal in [Left, Failed] {
            assert!(terminal.is_terminal());
            for next in [Idle, Joining, Active, Reconnecting, Leaving, Left, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ControllerConfig {
            max_join_attempts: 0,
            ..test_config()
        };
        let result = SessionController::new(SimulatedTransport::new(), MemoryDevices::new(), config);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn join_reaches_active_and_announces_local_attendee() {
        let h = harness();
        assert_eq!(h.controller.state().await, SessionState::Idle);

        let session = h.controller.join(mic_1()).await.unwrap();
        assert_eq!(session.local_attendee_id, "me");
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(h.controller.state().await, SessionState::Active);
        assert_eq!(h.controller.session().await.unwrap().id, "sim-1");
        assert_eq!(
            h.controller.devices().selected(DeviceKind::AudioInput).unwrap().id,
            "mic-1"
        );

        let started = h.recorder.events().into_iter().find_map(|e| match e {
            HuddleEvent::SessionStarted { local_attendee_id, .. } => Some(local_attendee_id),
            _ => None,
        });
        assert_eq!(started.as_deref(), Some("me"));

        let roster = h.controller.roster_snapshot().await;
        assert_eq!(roster.len(), 1);
        assert!(roster[0].is_local);
        assert_eq!(roster[0].display_name, "Me");
    }

    #[tokio::test(start_paused = true)]
    async fn join_outside_idle_is_invalid_state() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        let err = h.controller.join(mic_1()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(h.controller.state().await, SessionState::Active);
        assert_eq!(h.transport.count_calls("open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn degradation_then_healthy_sample_returns_to_active() {
        let h = harness();
        h.transport
            .fail_reconnects_with(Some(RawError::default().with_code("ConnectionHealthReconnect")));
        h.controller.join(mic_1()).await.unwrap();
        h.transport.emit(add_remote("alice", true));
        settle().await;
        let before = h.controller.roster_snapshot().await;

        degrade(&h).await;
        assert_eq!(h.controller.state().await, SessionState::Reconnecting);

        h.transport.emit(healthy());
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Active);
        assert_eq!(h.controller.roster_snapshot().await, before);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionReconnecting { .. })), 1);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionReconnected)), 1);

        // The cancelled reconnection never fires.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.count_calls("reconnect"), 0);
        assert_eq!(h.controller.state().await, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn never_recovering_degradation_fails_after_max_attempts() {
        let h = harness();
        h.transport
            .fail_reconnects_with(Some(RawError::default().with_code("NetworkBecamePoor")));
        h.controller.join(mic_1()).await.unwrap();
        degrade(&h).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.controller.state().await, SessionState::Failed);
        assert_eq!(h.transport.count_calls("reconnect"), 3);
        assert_eq!(h.recorder.failure().unwrap().kind, ErrorKind::NetworkUnrecoverable);
        assert_eq!(h.transport.count_calls("close"), 1);
        let reconnecting: Vec<u32> = h
            .recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HuddleEvent::SessionReconnecting { attempt } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(reconnecting, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_the_monitor() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        degrade(&h).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.controller.state().await, SessionState::Active);
        assert_eq!(h.transport.count_calls("reconnect"), 1);

        // A fresh episode needs a full streak again.
        for _ in 0..4 {
            h.transport.emit(poor());
        }
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_wins_over_reconnection() {
        let h = harness();
        h.transport
            .fail_reconnects_with(Some(RawError::default().with_code("NetworkBecamePoor")));
        h.controller.join(mic_1()).await.unwrap();
        degrade(&h).await;
        assert_eq!(h.controller.state().await, SessionState::Reconnecting);

        h.transport
            .emit(TransportEvent::Error(RawError::default().with_code("AudioCallAtCapacity")));
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Failed);
        assert_eq!(h.recorder.failure().unwrap().kind, ErrorKind::TransportRejected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.count_calls("reconnect"), 0);
        assert_eq!(h.controller.state().await, SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_transport_error_starts_reconnection() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport
            .emit(TransportEvent::Error(RawError::default().with_code("ConnectionHealthReconnect")));
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.controller.state().await, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_transport_error_is_fatal() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport.emit(TransportEvent::Error(RawError::new("kaboom")));
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Failed);
        let err = h.recorder.failure().unwrap();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(!err.recoverable);
        assert!(h.controller.session().await.is_none());
        assert!(!h.controller.devices().is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_degradation_is_unrecoverable() {
        let h = harness();
        h.transport
            .fail_reconnects_with(Some(RawError::default().with_code("NetworkBecamePoor")));
        h.controller.join(mic_1()).await.unwrap();
        for _ in 0..12 {
            h.transport.emit(poor());
        }
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Failed);
        assert_eq!(h.recorder.failure().unwrap().kind, ErrorKind::NetworkUnrecoverable);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_tears_down_and_is_terminal() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.devices.take_log();

        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);
        assert!(h.transport.calls().contains(&"close sim-1".to_string()));
        assert!(h.devices.take_log().contains(&"unbind mic-1".to_string()));

        let ended = h.recorder.events().into_iter().find_map(|e| match e {
            HuddleEvent::SessionEnded(session) => Some(session),
            _ => None,
        });
        let ended = ended.unwrap();
        assert_eq!(ended.state, SessionState::Left);
        assert!(ended.ended_at.is_some());

        assert_eq!(h.controller.leave().await.unwrap_err().kind, ErrorKind::InvalidState);
        assert_eq!(h.controller.join(mic_1()).await.unwrap_err().kind, ErrorKind::InvalidState);
        assert_eq!(h.controller.state().await, SessionState::Left);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_succeeds_even_if_close_fails() {
        let h = harness();
        h.transport.fail_close_with(RawError::new("socket gone"));
        h.controller.join(mic_1()).await.unwrap();
        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_from_idle_goes_straight_to_left() {
        let h = harness();
        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_during_pending_join_discards_the_join() {
        let h = harness();
        h.transport.hold_open();

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.join(mic_1()).await });
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Joining);

        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);

        h.transport.release_open();
        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidState);
        assert_eq!(h.controller.state().await, SessionState::Left);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionStarted { .. })), 0);
        assert!(h.transport.calls().contains(&"close sim-1".to_string()));
        assert!(!h.controller.devices().is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_during_permission_prompt_never_opens_the_transport() {
        let h = harness();
        h.devices.hold_permission();

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.join(mic_1()).await });
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Joining);

        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);

        h.devices.release_permission();
        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidState);
        settle().await;

        assert_eq!(h.controller.state().await, SessionState::Left);
        assert!(h.transport.calls().is_empty(), "calls: {:?}", h.transport.calls());
        assert!(h.devices.take_log().is_empty());
        assert!(!h.controller.devices().is_streaming());
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionStarted { .. })), 0);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionFailed(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_open_failure_after_leave_has_no_effect() {
        let h = harness();
        h.transport.hold_open();
        h.transport
            .fail_next_open(RawError::default().with_code("MeetingEnded"));

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.join(mic_1()).await });
        settle().await;
        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);

        h.transport.release_open();
        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidState);
        settle().await;

        assert_eq!(h.controller.state().await, SessionState::Left);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionFailed(_))), 0);
        assert_eq!(h.transport.count_calls("open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_leave_while_leaving_succeeds() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport.hold_close();

        let controller = h.controller.clone();
        let first = tokio::spawn(async move { controller.leave().await });
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Leaving);

        h.controller.leave().await.unwrap();
        assert_eq!(h.controller.state().await, SessionState::Leaving);

        h.transport.release_close();
        first.await.unwrap().unwrap();
        assert_eq!(h.controller.state().await, SessionState::Left);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::SessionEnded(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_cancels_reconnection() {
        let h = harness();
        h.transport
            .fail_reconnects_with(Some(RawError::default().with_code("NetworkBecamePoor")));
        h.controller.join(mic_1()).await.unwrap();
        degrade(&h).await;

        h.controller.leave().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.controller.state().await, SessionState::Left);
        assert_eq!(h.transport.count_calls("reconnect"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_fails_join_immediately() {
        let h = harness();
        h.devices.deny_permission(DeviceKind::AudioInput);
        let err = h.controller.join(mic_1()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(h.controller.state().await, SessionState::Failed);
        assert_eq!(h.transport.count_calls("open"), 0);
        assert_eq!(h.recorder.failure().unwrap().kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test(start_paused = true)]
    async fn join_retries_recoverable_failures() {
        let h = harness();
        for _ in 0..2 {
            h.transport
                .fail_next_open(RawError::default().with_code("SignalingInternalServerError"));
        }
        h.controller.join(mic_1()).await.unwrap();
        assert_eq!(h.transport.count_calls("open"), 3);
        assert_eq!(h.controller.state().await, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn join_gives_up_after_max_attempts() {
        let h = harness();
        for _ in 0..5 {
            h.transport.fail_next_open(RawError::new("bad gateway").with_http_status(502));
        }
        let err = h.controller.join(mic_1()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkDegraded);
        assert_eq!(h.transport.count_calls("open"), 3);
        assert_eq!(h.controller.state().await, SessionState::Failed);
        assert!(!h.controller.devices().is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_join_is_not_retried() {
        let h = harness();
        h.transport
            .fail_next_open(RawError::default().with_code("AudioAuthenticationRejected"));
        let err = h.controller.join(mic_1()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportRejected);
        assert_eq!(h.transport.count_calls("open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_absent_device_keeps_session_active() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        let listed = h.controller.list_devices(DeviceKind::AudioInput).unwrap();
        assert!(listed.iter().all(|d| d.id != "mic-2"));

        let err = h
            .controller
            .select_device(DeviceKind::AudioInput, "mic-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceUnavailable);
        assert_eq!(h.controller.state().await, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn camera_hot_swap_keeps_the_local_tile() {
        let h = harness();
        h.devices.plug(DeviceKind::VideoInput, "cam-2", "USB Camera");
        let config = SessionConfig {
            video_enabled: true,
            ..mic_1()
        };
        h.controller.join(config).await.unwrap();
        let tile_before: Option<TileId> = h.controller.roster_snapshot().await[0].video_tile_id;
        assert!(tile_before.is_some());
        h.devices.take_log();

        h.controller
            .select_device(DeviceKind::VideoInput, "cam-2")
            .await
            .unwrap();
        assert_eq!(
            h.devices.take_log(),
            vec!["bind cam-2".to_string(), "unbind cam-1".to_string()]
        );
        assert_eq!(h.controller.roster_snapshot().await[0].video_tile_id, tile_before);
        assert_eq!(h.controller.state().await, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn roster_events_release_tiles_before_removal() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport.emit(add_remote("alice", true));
        h.transport.emit(remove_remote("alice"));
        h.transport.emit(remove_remote("alice"));
        settle().await;

        let events = h.recorder.events();
        let released = events
            .iter()
            .position(|e| matches!(e, HuddleEvent::VideoTileReleased { attendee_id, .. } if attendee_id == "alice"))
            .unwrap();
        let joined = events
            .iter()
            .position(|e| matches!(e, HuddleEvent::VideoTileBound { attendee_id, .. } if attendee_id == "alice"))
            .unwrap();
        assert!(joined < released);
        // The first roster notification after the release no longer lists alice.
        let next_roster = events[released..].iter().find_map(|e| match e {
            HuddleEvent::RosterChanged(roster) => Some(roster.clone()),
            _ => None,
        });
        let next_roster = next_roster.unwrap();
        assert_eq!(next_roster.len(), 1);
        assert!(next_roster.iter().all(|a| a.attendee_id != "alice"));

        // Duplicate leave produced no extra roster notification.
        let roster_events = h.recorder.count(|e| matches!(e, HuddleEvent::RosterChanged(_)));
        assert_eq!(roster_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn active_speaker_is_forwarded() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport.emit(add_remote("alice", false));
        h.transport.emit(add_remote("bob", false));
        h.transport.emit(TransportEvent::ActiveSpeaker(Some("alice".into())));
        h.transport.emit(TransportEvent::ActiveSpeaker(Some("bob".into())));
        settle().await;
        let speakers: Vec<String> = h
            .controller
            .roster_snapshot()
            .await
            .into_iter()
            .filter(|a| a.is_active_speaker)
            .map(|a| a.attendee_id)
            .collect();
        assert_eq!(speakers, vec!["bob"]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_event_stream_fails_the_session() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport.end_stream();
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Failed);
        assert_eq!(h.recorder.failure().unwrap().kind, ErrorKind::NetworkUnrecoverable);
    }

    #[tokio::test(start_paused = true)]
    async fn device_change_is_surfaced_without_state_change() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.devices.plug(DeviceKind::AudioInput, "mic-2", "USB Headset");
        h.controller.notify_device_change().await;

        let changed: Vec<(DeviceKind, usize)> = h
            .recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                HuddleEvent::DeviceSetChanged { kind, devices } => Some((kind, devices.len())),
                _ => None,
            })
            .collect();
        assert_eq!(changed, vec![(DeviceKind::AudioInput, 2)]);
        assert_eq!(h.controller.state().await, SessionState::Active);
        assert_eq!(
            h.controller.devices().selected(DeviceKind::AudioInput).unwrap().id,
            "mic-1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_with_devices_left_only_prompts_reselection() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.transport
            .emit(TransportEvent::Error(RawError::default().with_name("NotReadableError")));
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Active);
        assert_eq!(h.recorder.count(|e| matches!(e, HuddleEvent::DeviceUnavailable(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_without_capture_devices_degrades() {
        let h = harness();
        h.controller.join(mic_1()).await.unwrap();
        h.devices.unplug("mic-1");
        h.devices.unplug("cam-1");
        h.transport
            .emit(TransportEvent::Error(RawError::default().with_name("NotFoundError")));
        settle().await;
        assert_eq!(h.controller.state().await, SessionState::Reconnecting);
    }
}
