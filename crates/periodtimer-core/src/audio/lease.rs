//! Process-wide exclusive device leases
//!
//! A [`DeviceLease`] marks `(backend, device, direction)` as taken until it is
//! dropped. A second acquisition fails fast with [`DeviceError::Busy`].

use super::device::{DeviceError, Direction};
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

type LeaseKey = (&'static str, String, Direction);

fn registry() -> &'static Mutex<HashSet<LeaseKey>> {
    static REGISTRY: OnceLock<Mutex<HashSet<LeaseKey>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive claim on one direction of one device
#[derive(Debug)]
pub struct DeviceLease {
    key: LeaseKey,
}

impl DeviceLease {
    pub fn acquire(
        backend: &'static str,
        device: &str,
        direction: Direction,
    ) -> Result<Self, DeviceError> {
        let key = (backend, device.to_string(), direction);
        let mut held = registry().lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return Err(DeviceError::Busy {
                device: device.to_string(),
                direction,
            });
        }
        tracing::debug!(backend, device, %direction, "Device lease acquired");
        Ok(Self { key })
    }

    /// Whether `(backend, device, direction)` is currently leased
    pub fn is_held(backend: &'static str, device: &str, direction: Direction) -> bool {
        let key = (backend, device.to_string(), direction);
        registry()
            .lock()
            .map(|held| held.contains(&key))
            .unwrap_or(false)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut held = registry().lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
        tracing::debug!(
            backend = self.key.0,
            device = %self.key.1,
            direction = %self.key.2,
            "Device lease released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lease_is_busy() {
        let first = DeviceLease::acquire("test", "lease-busy", Direction::Capture).unwrap();
        let second = DeviceLease::acquire("test", "lease-busy", Direction::Capture);
        assert!(matches!(second, Err(DeviceError::Busy { .. })));
        drop(first);
        assert!(DeviceLease::acquire("test", "lease-busy", Direction::Capture).is_ok());
    }

    #[test]
    fn test_directions_are_independent() {
        let _capture = DeviceLease::acquire("test", "lease-duplex", Direction::Capture).unwrap();
        let playback = DeviceLease::acquire("test", "lease-duplex", Direction::Playback);
        assert!(playback.is_ok());
    }

    #[test]
    fn test_drop_releases() {
        {
            let _lease = DeviceLease::acquire("test", "lease-drop", Direction::Playback).unwrap();
            assert!(DeviceLease::is_held("test", "lease-drop", Direction::Playback));
        }
        assert!(!DeviceLease::is_held("test", "lease-drop", Direction::Playback));
    }
}
