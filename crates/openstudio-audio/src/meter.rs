//! `ProgramMeter`: RMS and peak-hold reduction of the program bus tap.
//!
//! Listed in the component table but never given its own numbered
//! subsection in the distilled spec — filled in here. Value-only: no
//! rendering, no history, polled at whatever cadence (20 Hz suggested) the
//! owner's control surface wants.

use std::time::{Duration, Instant};

const PEAK_HOLD_WINDOW: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    pub rms: f32,
    pub peak: f32,
    pub peak_hold: f32,
}

pub struct ProgramMeter {
    held_peak: f32,
    held_since: Instant,
}

impl Default for ProgramMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramMeter {
    pub fn new() -> Self {
        Self {
            held_peak: 0.0,
            held_since: Instant::now(),
        }
    }

    /// Reduces the most recent audio callback's buffer to RMS and peak,
    /// and refreshes (or decays) the held peak. `buffer` is interleaved or
    /// mono — only sample magnitudes matter here, not channel layout.
    pub fn sample(&mut self, buffer: &[f32]) -> MeterReading {
        let rms = rms_of(buffer);
        let peak = peak_of(buffer);
        let now = Instant::now();
        let decayed = decayed_peak_hold(self.held_peak, now.duration_since(self.held_since));

        let peak_hold = if peak >= decayed {
            self.held_peak = peak;
            self.held_since = now;
            peak
        } else {
            decayed
        };

        MeterReading { rms, peak, peak_hold }
    }
}

fn rms_of(buffer: &[f32]) -> f32 {
    if buffer.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = buffer.iter().map(|s| s * s).sum();
    (sum_sq / buffer.len() as f32).sqrt()
}

fn peak_of(buffer: &[f32]) -> f32 {
    buffer.iter().fold(0.0_f32, |m, s| m.max(s.abs()))
}

/// Pure so it's testable without a real clock in the loop: linear decay
/// from `held_peak` to 0 over `PEAK_HOLD_WINDOW`, refreshed whenever a new
/// sample exceeds the currently held (possibly already-decayed) value.
fn decayed_peak_hold(held_peak: f32, elapsed: Duration) -> f32 {
    if elapsed >= PEAK_HOLD_WINDOW {
        0.0
    } else {
        let fraction = elapsed.as_secs_f32() / PEAK_HOLD_WINDOW.as_secs_f32();
        held_peak * (1.0 - fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_of(&[0.0; 128]), 0.0);
    }

    #[test]
    fn rms_of_a_constant_signal_equals_its_magnitude() {
        let buf = [0.5_f32; 64];
        assert!((rms_of(&buf) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn peak_of_takes_absolute_value() {
        assert_eq!(peak_of(&[-0.9, 0.2, 0.4]), 0.9);
    }

    #[test]
    fn peak_hold_does_not_decay_immediately() {
        assert_eq!(decayed_peak_hold(1.0, Duration::from_millis(0)), 1.0);
    }

    #[test]
    fn peak_hold_decays_linearly_to_zero_over_the_window() {
        let half = decayed_peak_hold(1.0, PEAK_HOLD_WINDOW / 2);
        assert!((half - 0.5).abs() < 1e-6);
        assert_eq!(decayed_peak_hold(1.0, PEAK_HOLD_WINDOW), 0.0);
        assert_eq!(decayed_peak_hold(1.0, PEAK_HOLD_WINDOW * 2), 0.0);
    }

    #[test]
    fn a_new_higher_peak_refreshes_the_hold() {
        let mut meter = ProgramMeter::new();
        let first = meter.sample(&[0.3; 16]);
        assert_eq!(first.peak_hold, 0.3);
        let second = meter.sample(&[0.8; 16]);
        assert_eq!(second.peak_hold, 0.8);
    }

    #[test]
    fn a_lower_peak_reports_the_held_value_not_the_instant_peak() {
        let mut meter = ProgramMeter::new();
        let _ = meter.sample(&[0.9; 16]);
        let second = meter.sample(&[0.1; 16]);
        assert!(second.peak == 0.1);
        assert!(second.peak_hold >= 0.1);
    }
}
