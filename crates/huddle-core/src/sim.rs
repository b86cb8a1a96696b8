//! In-memory transport and device platform.
//!
//! Used by the test suite and by the CLI's `--simulate` mode. Both types are
//! cheap handles over shared state, so a clone can keep scripting behavior
//! after the original has been handed to a controller.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, mpsc};

use crate::config::SessionConfig;
use crate::devices::{DeviceInfo, DeviceKind, DevicePlatform};
use crate::transport::{OpenedSession, RawError, Transport, TransportEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct TransportScript {
    open_results: VecDeque<RawError>,
    reconnect_results: VecDeque<Result<(), RawError>>,
    reconnect_failure: Option<RawError>,
    close_failure: Option<RawError>,
    open_gate: Option<Arc<Notify>>,
    close_gate: Option<Arc<Notify>>,
    sender: Option<mpsc::UnboundedSender<TransportEvent>>,
    calls: Vec<String>,
    opened: u32,
    local_attendee_id: Option<String>,
}

/// Scriptable [`Transport`].
///
/// By default every open, close and reconnect succeeds. Failures are queued
/// with the `fail_*` methods and consumed in order.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    script: Arc<Mutex<TransportScript>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity handed out as `local_attendee_id`; random when unset.
    pub fn set_local_attendee_id(&self, id: impl Into<String>) {
        lock(&self.script).local_attendee_id = Some(id.into());
    }

    /// Make the next `open_session` fail with `err`.
    pub fn fail_next_open(&self, err: RawError) {
        lock(&self.script).open_results.push_back(err);
    }

    /// Queue the outcome of the next reconnection cycle.
    pub fn push_reconnect_result(&self, result: Result<(), RawError>) {
        lock(&self.script).reconnect_results.push_back(result);
    }

    /// Outcome of reconnection cycles once the queue is empty.
    pub fn fail_reconnects_with(&self, err: Option<RawError>) {
        lock(&self.script).reconnect_failure = err;
    }

    pub fn fail_close_with(&self, err: RawError) {
        lock(&self.script).close_failure = Some(err);
    }

    /// Park `open_session` until [`release_open`](Self::release_open).
    pub fn hold_open(&self) {
        lock(&self.script).open_gate = Some(Arc::new(Notify::new()));
    }

    pub fn release_open(&self) {
        if let Some(gate) = lock(&self.script).open_gate.take() {
            gate.notify_one();
        }
    }

    /// Park `close_session` until [`release_close`](Self::release_close).
    pub fn hold_close(&self) {
        lock(&self.script).close_gate = Some(Arc::new(Notify::new()));
    }

    pub fn release_close(&self) {
        if let Some(gate) = lock(&self.script).close_gate.take() {
            gate.notify_one();
        }
    }

    /// Deliver an event on the most recently opened session.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match &lock(&self.script).sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Close the event stream of the current session.
    pub fn end_stream(&self) {
        lock(&self.script).sender = None;
    }

    /// Calls received so far, e.g. `open standup`, `reconnect sim-1`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.script).calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        lock(&self.script)
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl Transport for SimulatedTransport {
    async fn open_session(&self, config: &SessionConfig) -> Result<OpenedSession, RawError> {
        let gate = {
            let mut script = lock(&self.script);
            script.calls.push(format!("open {}", config.meeting));
            script.open_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut script = lock(&self.script);
        if let Some(err) = script.open_results.pop_front() {
            return Err(err);
        }
        script.opened += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        script.sender = Some(tx);
        let local_attendee_id = script
            .local_attendee_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(OpenedSession {
            session_id: format!("sim-{}", script.opened),
            local_attendee_id,
            events: rx,
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), RawError> {
        let gate = {
            let mut script = lock(&self.script);
            script.calls.push(format!("close {session_id}"));
            script.close_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut script = lock(&self.script);
        script.sender = None;
        match script.close_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn reconnect(&self, session_id: &str) -> Result<(), RawError> {
        let mut script = lock(&self.script);
        script.calls.push(format!("reconnect {session_id}"));
        if let Some(result) = script.reconnect_results.pop_front() {
            return result;
        }
        match script.reconnect_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct DeviceTable {
    devices: Vec<DeviceInfo>,
    denied: HashSet<DeviceKind>,
    broken: HashSet<String>,
    permission_gate: Option<Arc<Notify>>,
    log: Vec<String>,
}

/// In-memory [`DevicePlatform`] with hot-plug controls.
#[derive(Clone, Default)]
pub struct MemoryDevices {
    table: Arc<Mutex<DeviceTable>>,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone, speakers and a camera.
    pub fn with_defaults() -> Self {
        let devices = Self::new();
        devices.plug(DeviceKind::AudioInput, "mic-1", "Built-in Microphone");
        devices.plug(DeviceKind::AudioOutput, "spk-1", "Built-in Speakers");
        devices.plug(DeviceKind::VideoInput, "cam-1", "Built-in Camera");
        devices
    }

    pub fn plug(&self, kind: DeviceKind, id: &str, label: &str) {
        let mut table = lock(&self.table);
        if !table.devices.iter().any(|d| d.id == id) {
            table.devices.push(DeviceInfo {
                id: id.to_string(),
                kind,
                label: label.to_string(),
            });
        }
    }

    pub fn unplug(&self, id: &str) {
        lock(&self.table).devices.retain(|d| d.id != id);
    }

    pub fn deny_permission(&self, kind: DeviceKind) {
        lock(&self.table).denied.insert(kind);
    }

    /// Park permission requests until
    /// [`release_permission`](Self::release_permission), like an unanswered
    /// OS prompt.
    pub fn hold_permission(&self) {
        lock(&self.table).permission_gate = Some(Arc::new(Notify::new()));
    }

    pub fn release_permission(&self) {
        if let Some(gate) = lock(&self.table).permission_gate.take() {
            gate.notify_one();
        }
    }

    /// Make binding the device fail as if it were held by another process.
    pub fn fail_bind(&self, id: &str) {
        lock(&self.table).broken.insert(id.to_string());
    }

    /// Drain the bind/unbind log.
    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut lock(&self.table).log)
    }
}

impl DevicePlatform for MemoryDevices {
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, RawError> {
        Ok(lock(&self.table)
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect())
    }

    async fn request_permission(&self, kind: DeviceKind) -> Result<(), RawError> {
        let gate = lock(&self.table).permission_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if lock(&self.table).denied.contains(&kind) {
            return Err(RawError::new(format!("{kind} permission denied")).with_name("NotAllowedError"));
        }
        Ok(())
    }

    fn bind(&self, device: &DeviceInfo) -> Result<(), RawError> {
        let mut table = lock(&self.table);
        if table.broken.contains(&device.id) {
            return Err(RawError::new(format!("could not start {}", device.id)).with_name("NotReadableError"));
        }
        table.log.push(format!("bind {}", device.id));
        Ok(())
    }

    fn unbind(&self, device: &DeviceInfo) {
        lock(&self.table).log.push(format!("unbind {}", device.id));
    }
}
