use cpal::traits::{DeviceTrait, HostTrait};

use crate::devices::{DeviceInfo, DeviceKind, DevicePlatform};
use crate::transport::RawError;

/// [`DevicePlatform`] over the host's default cpal audio backend.
///
/// Devices are identified by name. cpal has no camera support, so video
/// input enumerates as empty. Desktop hosts grant audio access without a
/// prompt, so permission requests always succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }

    fn find(&self, device: &DeviceInfo) -> Result<cpal::Device, RawError> {
        host_devices(device.kind)?
            .into_iter()
            .find(|d| d.name().map(|n| n == device.id).unwrap_or(false))
            .ok_or_else(|| not_found(&device.id))
    }
}

fn host_devices(kind: DeviceKind) -> Result<Vec<cpal::Device>, RawError> {
    let host = cpal::default_host();
    let devices: Result<Vec<cpal::Device>, _> = match kind {
        DeviceKind::AudioInput => host.input_devices().map(|d| d.collect()),
        DeviceKind::AudioOutput => host.output_devices().map(|d| d.collect()),
        DeviceKind::VideoInput => return Ok(Vec::new()),
    };
    devices.map_err(|e| RawError::new(e.to_string()).with_name("NotReadableError"))
}

fn not_found(id: &str) -> RawError {
    RawError::new(format!("device {id} not found")).with_name("NotFoundError")
}

impl DevicePlatform for CpalDevices {
    fn enumerate(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, RawError> {
        Ok(host_devices(kind)?
            .into_iter()
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceInfo {
                id: name.clone(),
                kind,
                label: name,
            })
            .collect())
    }

    async fn request_permission(&self, _kind: DeviceKind) -> Result<(), RawError> {
        Ok(())
    }

    fn bind(&self, device: &DeviceInfo) -> Result<(), RawError> {
        let handle = self.find(device)?;
        let config = match device.kind {
            DeviceKind::AudioInput => handle.default_input_config(),
            _ => handle.default_output_config(),
        }
        .map_err(|e| RawError::new(format!("{}: {e}", device.id)).with_name("NotReadableError"))?;

        tracing::info!(
            "bound {}: device={:?}, rate={}, channels={}, format={:?}",
            device.kind,
            device.id,
            config.sample_rate().0,
            config.channels(),
            config.sample_format(),
        );
        Ok(())
    }

    fn unbind(&self, device: &DeviceInfo) {
        tracing::info!("released {}: {:?}", device.kind, device.id);
    }
}
