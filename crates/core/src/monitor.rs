//! Audio level monitoring.
//!
//! A dedicated, always-on, low-rate pipeline measures loudness every
//! [`LEVEL_INTERVAL_MS`] milliseconds and posts one [`LevelSample`] per
//! measurement onto the engine bus. [`LevelMonitor`] keeps a short rolling
//! window of normalized values (the "ambient" judgment fed to the profile
//! selector) and filters out insignificant samples so that silence does not
//! flood the event stream. Filtering is policy, not correctness: consumers
//! must not assume a fixed sample cadence.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::template::{PipelineTemplate, StageDescriptor, SuspendPolicy};

/// Loudness measurement interval in milliseconds.
pub const LEVEL_INTERVAL_MS: u64 = 150;

/// Normalized RMS below which a sample is not worth emitting.
pub const SIGNIFICANCE_THRESHOLD: f64 = 0.1;

/// Rolling window length used for the ambient judgment.
pub const DEFAULT_WINDOW_LEN: usize = 6;

/// One loudness measurement from the monitoring pipeline.
///
/// `rms`, `peak` and `decay` are per-channel decibel readings (channel 0);
/// `normrms` is the linear normalization `10^(rms/20)`, effectively 0..1
/// for typical input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelSample {
    pub rms: f64,
    pub peak: f64,
    pub decay: f64,
    pub normrms: f64,
}

impl LevelSample {
    /// Build a sample from raw decibel readings.
    pub fn from_db(rms_db: f64, peak_db: f64, decay_db: f64) -> Self {
        Self {
            rms: rms_db,
            peak: peak_db,
            decay: decay_db,
            normrms: db_to_linear(rms_db),
        }
    }

    pub fn is_significant(&self, threshold: f64) -> bool {
        self.normrms > threshold
    }
}

/// Convert a log-scale decibel value to a linear 0..1 factor.
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Rolling loudness classifier.
///
/// Every sample is folded into the window; only significant ones are
/// returned for emission.
#[derive(Debug)]
pub struct LevelMonitor {
    threshold: f64,
    window: VecDeque<f64>,
    window_len: usize,
}

impl LevelMonitor {
    pub fn new(threshold: f64, window_len: usize) -> Self {
        Self {
            threshold,
            window: VecDeque::with_capacity(window_len.max(1)),
            window_len: window_len.max(1),
        }
    }

    /// Fold a sample into the rolling window. Returns the sample back if it
    /// is significant enough to emit.
    pub fn observe(&mut self, sample: LevelSample) -> Option<LevelSample> {
        if self.window.len() == self.window_len {
            self.window.pop_front();
        }
        self.window.push_back(sample.normrms);

        if sample.is_significant(self.threshold) {
            Some(sample)
        } else {
            tracing::trace!(normrms = sample.normrms, "sub-threshold level sample");
            None
        }
    }

    /// Mean normalized RMS over the rolling window (0.0 when empty).
    pub fn ambient(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

impl Default for LevelMonitor {
    fn default() -> Self {
        Self::new(SIGNIFICANCE_THRESHOLD, DEFAULT_WINDOW_LEN)
    }
}

/// Template for the level-monitoring pipeline: capture source, band-pass
/// filter, level meter, synced null sink. Always-on and never mounted.
pub fn level_template(name: &str, device: Option<&str>) -> crate::error::Result<PipelineTemplate> {
    let mut source = StageDescriptor::new("pulsesrc")?.with_property("volume", "3");
    if let Some(device) = device {
        source = source.with_property("device", device);
    }
    let interval_ns = LEVEL_INTERVAL_MS * 1_000_000;

    PipelineTemplate::new(
        name,
        vec![
            source,
            StageDescriptor::new("audioconvert")?,
            StageDescriptor::new("audiochebband")?
                .with_property("lower-frequency", "100")
                .with_property("upper-frequency", "12000")
                .with_property("poles", "4"),
            StageDescriptor::new("volume")?.with_property("volume", "3"),
            StageDescriptor::new("level")?
                .with_property("post-messages", "true")
                .with_property("interval", &interval_ns.to_string()),
            StageDescriptor::new("fakesink")?.with_property("sync", "true"),
        ],
    )
    .map(|t| t.suspend_policy(SuspendPolicy::AlwaysRun))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trip() {
        // -20 dB is one tenth, 0 dB is unity.
        assert!((db_to_linear(-20.0) - 0.1).abs() < 1e-9);
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sample_from_db_normalizes_rms() {
        let sample = LevelSample::from_db(-20.0, -10.0, -15.0);
        assert!((sample.normrms - 0.1).abs() < 1e-9);
        assert_eq!(sample.rms, -20.0);
        assert_eq!(sample.peak, -10.0);
    }

    #[test]
    fn quiet_samples_are_filtered() {
        let mut monitor = LevelMonitor::new(0.1, 4);
        // -40 dB => 0.01, well below threshold
        assert!(monitor.observe(LevelSample::from_db(-40.0, -40.0, -40.0)).is_none());
        // -3 dB => ~0.7
        assert!(monitor.observe(LevelSample::from_db(-3.0, -3.0, -3.0)).is_some());
    }

    #[test]
    fn ambient_averages_all_samples() {
        let mut monitor = LevelMonitor::new(0.1, 4);
        monitor.observe(LevelSample::from_db(-40.0, 0.0, 0.0));
        monitor.observe(LevelSample::from_db(0.0, 0.0, 0.0));
        let ambient = monitor.ambient();
        // Quiet samples still count toward the judgment.
        assert!((ambient - (0.01 + 1.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn window_is_bounded() {
        let mut monitor = LevelMonitor::new(0.1, 2);
        monitor.observe(LevelSample::from_db(0.0, 0.0, 0.0));
        monitor.observe(LevelSample::from_db(-40.0, 0.0, 0.0));
        monitor.observe(LevelSample::from_db(-40.0, 0.0, 0.0));
        // The loud first sample has rolled out of the window.
        assert!(monitor.ambient() < 0.05);
    }

    #[test]
    fn level_template_is_always_run() {
        let template = level_template("level-monitor", Some("hw:1")).unwrap();
        assert_eq!(template.suspend(), SuspendPolicy::AlwaysRun);
        assert!(template.launch_line().contains("level post-messages=true"));
        assert!(template.launch_line().contains("device=hw:1"));
    }
}
