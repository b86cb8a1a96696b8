use std::collections::VecDeque;

use crate::config::HealthConfig;

/// A point-in-time connection quality observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionQualitySample {
    /// Fraction of packets lost, 0.0..=1.0.
    pub packet_loss: f32,
    /// Normalized signal strength, 0.0..=1.0.
    pub signal_strength: f32,
    pub bitrate_kbps: u32,
}

impl ConnectionQualitySample {
    pub fn new(packet_loss: f32, signal_strength: f32, bitrate_kbps: u32) -> Self {
        Self {
            packet_loss,
            signal_strength,
            bitrate_kbps,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unrecoverable,
}

/// Judge of connection quality over a stream of samples.
///
/// The verdict rests on the run of consecutive poor samples alone.
/// Degradation requires `degraded_after` poor samples in a row; one good
/// sample ends the episode.
///
/// The bounded rolling window is diagnostic only. It feeds
/// [`average_packet_loss`](Self::average_packet_loss) for logging and never
/// changes the verdict.
#[derive(Debug, Clone)]
pub struct ConnectionHealthMonitor {
    config: HealthConfig,
    window: VecDeque<ConnectionQualitySample>,
    poor_streak: usize,
}

impl ConnectionHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            config,
            window,
            poor_streak: 0,
        }
    }

    pub fn observe(&mut self, sample: ConnectionQualitySample) -> HealthVerdict {
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        if self.is_poor(&sample) {
            self.poor_streak += 1;
        } else {
            self.poor_streak = 0;
        }

        let verdict = self.verdict();
        if verdict != HealthVerdict::Healthy {
            tracing::debug!(
                streak = self.poor_streak,
                avg_loss = self.average_packet_loss(),
                "connection {verdict:?}"
            );
        }
        verdict
    }

    pub fn verdict(&self) -> HealthVerdict {
        if self.poor_streak >= self.config.unrecoverable_after {
            HealthVerdict::Unrecoverable
        } else if self.poor_streak >= self.config.degraded_after {
            HealthVerdict::Degraded
        } else {
            HealthVerdict::Healthy
        }
    }

    /// Forget all history so the next degradation episode is judged fresh.
    pub fn reset(&mut self) {
        self.window.clear();
        self.poor_streak = 0;
    }

    pub fn average_packet_loss(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(|s| s.packet_loss).sum::<f32>() / self.window.len() as f32
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn poor_streak(&self) -> usize {
        self.poor_streak
    }

    fn is_poor(&self, sample: &ConnectionQualitySample) -> bool {
        sample.packet_loss > self.config.max_packet_loss
            || sample.signal_strength < self.config.min_signal_strength
            || self
                .config
                .min_bitrate_kbps
                .is_some_and(|floor| sample.bitrate_kbps < floor)
    }
}
