//! Output device loss detection and reconnect backoff.

use crate::backend::MixingBackend;
use crate::config::AudioEngineDesc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Connected,
    Lost { since: Instant, next_attempt: Instant },
}

/// Watches the backend for device loss and retries `reset_device` with backoff.
///
/// Nothing is replayed on reconnect. Sources keep their logical state and
/// simply continue once the backend is healthy again.
pub struct DeviceMonitor {
    state: DeviceState,
    interval: Duration,
    slow_interval: Duration,
    slow_after: Duration,
}

impl DeviceMonitor {
    pub fn new(desc: &AudioEngineDesc) -> Self {
        Self {
            state: DeviceState::Connected,
            interval: desc.reconnect_interval,
            slow_interval: desc.reconnect_slow_interval,
            slow_after: desc.reconnect_slow_after,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_lost(&self) -> bool {
        matches!(self.state, DeviceState::Lost { .. })
    }

    /// Checks the backend and attempts a reset if one is due. Returns whether the device is usable.
    pub fn poll<B: MixingBackend>(&mut self, backend: &mut B, now: Instant) -> bool {
        match self.state {
            DeviceState::Connected => {
                if backend.is_device_connected() {
                    return true;
                }
                log::warn!("Audio device disconnected, retrying every {:?}", self.interval);
                self.state = DeviceState::Lost {
                    since: now,
                    next_attempt: now + self.interval,
                };
                false
            }
            DeviceState::Lost {
                since,
                next_attempt,
            } => {
                if now < next_attempt {
                    return false;
                }
                match backend.reset_device() {
                    Ok(()) => {
                        log::info!(
                            "Audio device reconnected after {:?}",
                            now.saturating_duration_since(since)
                        );
                        self.state = DeviceState::Connected;
                        true
                    }
                    Err(e) => {
                        let lost_for = now.saturating_duration_since(since);
                        let delay = if lost_for >= self.slow_after {
                            self.slow_interval
                        } else {
                            self.interval
                        };
                        log::debug!("Device reset failed ({}), next attempt in {:?}", e, delay);
                        self.state = DeviceState::Lost {
                            since,
                            next_attempt: now + delay,
                        };
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VirtualBackend;

    #[test]
    fn backoff_widens_after_prolonged_loss() {
        let (mut backend, probe) = VirtualBackend::new();
        let mut monitor = DeviceMonitor::new(&AudioEngineDesc::default());
        let base = Instant::now();
        let at = |secs: u64| base + Duration::from_secs(secs);

        assert!(monitor.poll(&mut backend, base));
        probe.disconnect(u32::MAX);
        assert!(!monitor.poll(&mut backend, base));

        // Attempts at 3, 6, ..., 21 s, then every 10 s.
        for secs in 1..=40 {
            monitor.poll(&mut backend, at(secs));
        }
        // 3,6,9,12,15,18,21 then 31
        assert_eq!(probe.reset_attempts(), 8);
        assert!(monitor.is_lost());
    }

    #[test]
    fn reconnects_when_reset_succeeds() {
        let (mut backend, probe) = VirtualBackend::new();
        let mut monitor = DeviceMonitor::new(&AudioEngineDesc::default());
        let base = Instant::now();

        probe.disconnect(1);
        assert!(!monitor.poll(&mut backend, base));
        assert!(!monitor.poll(&mut backend, base + Duration::from_secs(3)));
        assert!(!monitor.poll(&mut backend, base + Duration::from_secs(5)));
        assert!(monitor.poll(&mut backend, base + Duration::from_secs(6)));
        assert_eq!(monitor.state(), DeviceState::Connected);
        assert_eq!(probe.reset_attempts(), 2);
    }
}
