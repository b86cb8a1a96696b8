use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use crate::classifier::classify;
use crate::config::SessionConfig;
use crate::errors::ClassifiedError;
use crate::transport::RawError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::AudioInput,
        DeviceKind::AudioOutput,
        DeviceKind::VideoInput,
    ];

    pub fn is_capture(self) -> bool {
        !matches!(self, DeviceKind::AudioOutput)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::AudioInput => "audio-input",
            DeviceKind::AudioOutput => "audio-output",
            DeviceKind::VideoInput => "video-input",
        })
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio-input" => Ok(DeviceKind::AudioInput),
            "audio-output" => Ok(DeviceKind::AudioOutput),
            "video-input" => Ok(DeviceKind::VideoInput),
            other => Err(format!("unknown device kind '{other}'")),
        }
    }
}

/// A device as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// A device as exposed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
    pub is_active: bool,
}

/// Host media API: enumeration, permission and stream binding.
pub trait DevicePlatform: Send + Sync + 'static {
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, RawError>;

    fn request_permission(&self, kind: DeviceKind) -> impl Future<Output = Result<(), RawError>> + Send;

    /// Start capturing from (or playing to) the device.
    fn bind(&self, device: &DeviceInfo) -> Result<(), RawError>;

    fn unbind(&self, device: &DeviceInfo);
}

/// Result of re-enumerating after a platform device-change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChangeReport {
    /// Kinds whose device list changed, with the new list.
    pub changed: Vec<(DeviceKind, Vec<Device>)>,
    /// Kinds whose bound device disappeared.
    pub lost: Vec<DeviceKind>,
}

#[derive(Default)]
struct Bindings {
    /// Selected device per kind.
    selected: HashMap<DeviceKind, DeviceInfo>,
    /// Whether selections are backed by live streams.
    streaming: bool,
    /// Last enumeration per kind, used to detect hot-plug changes.
    known: HashMap<DeviceKind, Vec<DeviceInfo>>,
}

/// Owns the local device bindings. Nothing else mutates them.
pub struct DeviceManager<P: DevicePlatform> {
    platform: P,
    bindings: Mutex<Bindings>,
}

impl<P: DevicePlatform> DeviceManager<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            bindings: Mutex::new(Bindings::default()),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Devices of `kind` in platform order.
    pub fn list_devices(&self, kind: DeviceKind) -> Result<Vec<Device>, ClassifiedError> {
        let infos = self.platform.enumerate(kind).map_err(|e| classify(&e))?;
        let mut bindings = self.lock();
        let devices = Self::to_devices(&bindings, kind, &infos);
        bindings.known.insert(kind, infos);
        Ok(devices)
    }

    /// Currently selected device of `kind`, if any.
    pub fn selected(&self, kind: DeviceKind) -> Option<DeviceInfo> {
        self.lock().selected.get(&kind).cloned()
    }

    /// Select a device. While streaming, the new device is bound before the
    /// old one is released so capture never stops.
    pub fn select_device(&self, kind: DeviceKind, device_id: &str) -> Result<Device, ClassifiedError> {
        let infos = self.platform.enumerate(kind).map_err(|e| classify(&e))?;
        let Some(info) = infos.iter().find(|d| d.id == device_id).cloned() else {
            return Err(ClassifiedError::device_unavailable(format!(
                "{kind} device '{device_id}' is not available"
            )));
        };

        let mut bindings = self.lock();
        bindings.known.insert(kind, infos);
        if bindings.selected.get(&kind) == Some(&info) {
            return Ok(Self::active(&info));
        }

        if bindings.streaming {
            self.platform.bind(&info).map_err(|e| classify(&e))?;
            if let Some(previous) = bindings.selected.get(&kind) {
                self.platform.unbind(previous);
            }
            tracing::info!("hot-swapped {kind} to '{}'", info.label);
        } else {
            tracing::info!("selected {kind} '{}'", info.label);
        }
        bindings.selected.insert(kind, info.clone());
        Ok(Self::active(&info))
    }

    pub async fn request_permission(&self, kind: DeviceKind) -> Result<(), ClassifiedError> {
        self.platform
            .request_permission(kind)
            .await
            .map_err(|e| classify(&e))
    }

    /// Request permission for and bind the devices a session needs.
    ///
    /// Explicitly requested ids must exist; otherwise the first available
    /// device of each kind is used. Audio input is mandatory, video input only
    /// when the session enables video.
    pub async fn acquire(&self, config: &SessionConfig) -> Result<(), ClassifiedError> {
        let chosen = self.prepare(config).await?;
        self.bind_all(chosen)
    }

    /// The permission and selection half of [`acquire`](Self::acquire).
    ///
    /// Nothing is bound yet, so a caller may still abandon the result.
    pub async fn prepare(&self, config: &SessionConfig) -> Result<Vec<DeviceInfo>, ClassifiedError> {
        let mut wanted = vec![
            (DeviceKind::AudioInput, config.audio_input_id.as_deref(), true),
            (DeviceKind::AudioOutput, config.audio_output_id.as_deref(), false),
        ];
        if config.video_enabled {
            wanted.push((DeviceKind::VideoInput, config.video_input_id.as_deref(), true));
        }

        let mut chosen = Vec::new();
        let mut seen: HashMap<DeviceKind, Vec<DeviceInfo>> = HashMap::new();
        for (kind, requested, required) in wanted {
            if kind.is_capture() {
                self.request_permission(kind).await?;
            }
            let infos = self.platform.enumerate(kind).map_err(|e| classify(&e))?;
            let pick = match requested {
                Some(id) => match infos.iter().find(|d| d.id == id) {
                    Some(info) => Some(info.clone()),
                    None => {
                        return Err(ClassifiedError::device_unavailable(format!(
                            "{kind} device '{id}' is not available"
                        )));
                    }
                },
                None => self.selected(kind).filter(|s| infos.contains(s)).or_else(|| infos.first().cloned()),
            };
            seen.insert(kind, infos);
            match pick {
                Some(info) => chosen.push(info),
                None if required => {
                    return Err(ClassifiedError::device_unavailable(format!("no {kind} device available")));
                }
                None => tracing::debug!("no {kind} device, continuing without one"),
            }
        }

        // Baseline for the next refresh, so only later hot-plugs show up.
        for kind in DeviceKind::ALL {
            if !seen.contains_key(&kind) {
                if let Ok(infos) = self.platform.enumerate(kind) {
                    seen.insert(kind, infos);
                }
            }
        }
        self.lock().known.extend(seen);
        Ok(chosen)
    }

    /// Bind the devices returned by [`prepare`](Self::prepare), all or none.
    pub fn bind_all(&self, chosen: Vec<DeviceInfo>) -> Result<(), ClassifiedError> {
        let mut bound: Vec<DeviceInfo> = Vec::new();
        for info in &chosen {
            if let Err(e) = self.platform.bind(info) {
                for done in &bound {
                    self.platform.unbind(done);
                }
                return Err(classify(&e));
            }
            bound.push(info.clone());
        }

        let mut bindings = self.lock();
        bindings.selected.clear();
        for info in chosen {
            tracing::info!("acquired {} '{}'", info.kind, info.label);
            bindings.selected.insert(info.kind, info);
        }
        bindings.streaming = true;
        Ok(())
    }

    /// Stop all streams. Selections are kept for the next session.
    pub fn release_all(&self) {
        let mut bindings = self.lock();
        if !bindings.streaming {
            return;
        }
        for info in bindings.selected.values() {
            self.platform.unbind(info);
        }
        bindings.streaming = false;
        tracing::info!("released local devices");
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    /// Whether any capture device is still present on the platform.
    pub fn has_capture_device(&self) -> bool {
        [DeviceKind::AudioInput, DeviceKind::VideoInput]
            .into_iter()
            .any(|kind| self.platform.enumerate(kind).is_ok_and(|d| !d.is_empty()))
    }

    /// Re-enumerate every kind after a platform change notification.
    ///
    /// A bound device that vanished is unbound and deselected; nothing is
    /// re-selected automatically.
    pub fn refresh(&self) -> DeviceChangeReport {
        let mut report = DeviceChangeReport::default();
        let mut bindings = self.lock();
        for kind in DeviceKind::ALL {
            let infos = match self.platform.enumerate(kind) {
                Ok(infos) => infos,
                Err(e) => {
                    tracing::warn!("enumerating {kind} failed: {e}");
                    continue;
                }
            };
            if let Some(selected) = bindings.selected.get(&kind).cloned() {
                if !infos.iter().any(|d| d.id == selected.id) {
                    if bindings.streaming {
                        self.platform.unbind(&selected);
                    }
                    bindings.selected.remove(&kind);
                    tracing::warn!("{kind} '{}' disappeared", selected.label);
                    report.lost.push(kind);
                }
            }
            if bindings.known.get(&kind) != Some(&infos) {
                report.changed.push((kind, Self::to_devices(&bindings, kind, &infos)));
                bindings.known.insert(kind, infos);
            }
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bindings> {
        match self.bindings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn active(info: &DeviceInfo) -> Device {
        Device {
            id: info.id.clone(),
            kind: info.kind,
            label: info.label.clone(),
            is_active: true,
        }
    }

    fn to_devices(bindings: &Bindings, kind: DeviceKind, infos: &[DeviceInfo]) -> Vec<Device> {
        let selected = bindings.selected.get(&kind).map(|d| d.id.as_str());
        infos
            .iter()
            .map(|info| Device {
                id: info.id.clone(),
                kind: info.kind,
                label: info.label.clone(),
                is_active: selected == Some(info.id.as_str()),
            })
            .collect()
    }
}
