//! IncidentWindowDetector - Debounced incident triggers
//!
//! ## Responsibilities
//!
//! - One independent window per incident class (accident, fire, altercation)
//! - Leaky counter over per-frame verdicts, bounded to [0, window_size]
//! - Spike when the counter exceeds floor(spike_fraction * window_size)
//! - Trigger when the last `order` spikes of a class fall within its time limit
//!
//! ## Design
//!
//! The detector only decides. Capturing the frame, writing the incident
//! record and sending the alert belong to `IncidentNotifier`.
//!
//! After a trigger the class counter goes back to 0 and its spike history is
//! cleared, so the next trigger needs a fresh episode: the counter has to
//! climb past the threshold again and then collect `order` new spikes. With
//! the defaults that is 47 consecutive positives (23 + 24), where resetting
//! only the counter would re-trigger after 23.

use crate::models::IncidentClass;
use crate::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

/// Spike timestamps kept per class
pub const SPIKE_HISTORY_CAPACITY: usize = 30;

/// Detector tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Verdict FIFO length and counter ceiling
    pub window_size: usize,
    /// Fraction of the window the counter must exceed to spike
    pub spike_fraction: f64,
    /// Minimum model confidence for a positive verdict
    pub confidence_threshold: f32,
    /// Number of clustered spikes required to trigger
    pub order: usize,
    /// Per-class limit between the oldest and newest of the last `order` spikes
    pub limits_ms: BTreeMap<IncidentClass, u64>,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            window_size: 25,
            spike_fraction: 0.88,
            confidence_threshold: 0.75,
            order: 25,
            limits_ms: BTreeMap::from([
                (IncidentClass::Accident, 2_000),
                (IncidentClass::Fire, 4_000),
                (IncidentClass::Altercation, 4_000),
            ]),
        }
    }
}

impl IncidentConfig {
    /// Counter value that must be exceeded for a spike
    pub fn spike_threshold(&self) -> usize {
        (self.spike_fraction * self.window_size as f64).floor() as usize
    }

    pub fn limit(&self, class: IncidentClass) -> Duration {
        Duration::from_millis(self.limits_ms.get(&class).copied().unwrap_or(4_000))
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Validation("incident window_size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.spike_fraction) {
            return Err(Error::Validation(format!(
                "incident spike_fraction {} must be in [0, 1)",
                self.spike_fraction
            )));
        }
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold < 1.0) {
            return Err(Error::Validation(format!(
                "incident confidence_threshold {} must be in (0, 1)",
                self.confidence_threshold
            )));
        }
        if self.order == 0 || self.order > SPIKE_HISTORY_CAPACITY {
            return Err(Error::Validation(format!(
                "incident order {} must be in 1..={}",
                self.order, SPIKE_HISTORY_CAPACITY
            )));
        }
        Ok(())
    }
}

/// Per-frame verdicts, one per incident class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncidentVerdicts {
    pub accident: bool,
    pub fire: bool,
    pub altercation: bool,
}

impl IncidentVerdicts {
    /// Positive when any confidence for the class is strictly above `threshold`
    pub fn from_confidences(
        confidences: impl IntoIterator<Item = (IncidentClass, f32)>,
        threshold: f32,
    ) -> Self {
        let mut verdicts = Self::default();
        for (class, conf) in confidences {
            if conf > threshold {
                verdicts.set(class, true);
            }
        }
        verdicts
    }

    pub fn get(&self, class: IncidentClass) -> bool {
        match class {
            IncidentClass::Accident => self.accident,
            IncidentClass::Fire => self.fire,
            IncidentClass::Altercation => self.altercation,
        }
    }

    pub fn set(&mut self, class: IncidentClass, value: bool) {
        match class {
            IncidentClass::Accident => self.accident = value,
            IncidentClass::Fire => self.fire = value,
            IncidentClass::Altercation => self.altercation = value,
        }
    }

    pub fn any(&self) -> bool {
        self.accident || self.fire || self.altercation
    }
}

/// Window state of one incident class
#[derive(Debug, Clone)]
pub struct IncidentWindow {
    class: IncidentClass,
    verdicts: VecDeque<bool>,
    counter: usize,
    spikes: VecDeque<NaiveDateTime>,
    last_notified: Option<NaiveDateTime>,
    trigger_count: u64,
}

impl IncidentWindow {
    fn new(class: IncidentClass, window_size: usize) -> Self {
        Self {
            class,
            verdicts: VecDeque::with_capacity(window_size),
            counter: 0,
            spikes: VecDeque::with_capacity(SPIKE_HISTORY_CAPACITY),
            last_notified: None,
            trigger_count: 0,
        }
    }

    pub fn class(&self) -> IncidentClass {
        self.class
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn spike_count(&self) -> usize {
        self.spikes.len()
    }

    pub fn last_notified(&self) -> Option<NaiveDateTime> {
        self.last_notified
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count
    }

    /// Positives currently in the verdict FIFO
    pub fn recent_positives(&self) -> usize {
        self.verdicts.iter().filter(|v| **v).count()
    }

    fn push_verdict(&mut self, positive: bool, window_size: usize) {
        if self.verdicts.len() == window_size {
            self.verdicts.pop_front();
        }
        self.verdicts.push_back(positive);

        self.counter = if positive {
            (self.counter + 1).min(window_size)
        } else {
            self.counter.saturating_sub(1)
        };
    }

    fn push_spike(&mut self, ts: NaiveDateTime) {
        if self.spikes.len() == SPIKE_HISTORY_CAPACITY {
            self.spikes.pop_front();
        }
        self.spikes.push_back(ts);
    }

    /// Span between the newest spike and the `order`-th most recent one
    fn clustered_span(&self, order: usize) -> Option<chrono::Duration> {
        let len = self.spikes.len();
        if len < order {
            return None;
        }
        let newest = self.spikes[len - 1];
        let oldest = self.spikes[len - order];
        Some(newest - oldest)
    }

    fn fire(&mut self, ts: NaiveDateTime) {
        self.counter = 0;
        self.spikes.clear();
        self.last_notified = Some(ts);
        self.trigger_count += 1;
    }
}

/// Incident trigger emitted for one class on one frame
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentTrigger {
    pub class: IncidentClass,
    pub timestamp: NaiveDateTime,
    /// Lifetime triggers of this class, including this one
    pub trigger_count: u64,
    /// Time covered by the clustered spikes
    pub span: Duration,
}

/// Per-stream incident detector
#[derive(Debug, Clone)]
pub struct IncidentWindowDetector {
    config: IncidentConfig,
    spike_threshold: usize,
    windows: BTreeMap<IncidentClass, IncidentWindow>,
}

impl IncidentWindowDetector {
    pub fn new(config: IncidentConfig) -> Self {
        let windows = IncidentClass::ALL
            .iter()
            .map(|c| (*c, IncidentWindow::new(*c, config.window_size)))
            .collect();
        Self {
            spike_threshold: config.spike_threshold(),
            config,
            windows,
        }
    }

    pub fn config(&self) -> &IncidentConfig {
        &self.config
    }

    pub fn window(&self, class: IncidentClass) -> Option<&IncidentWindow> {
        self.windows.get(&class)
    }

    /// Feed one frame's verdicts. Returns at most one trigger per class.
    pub fn on_frame(
        &mut self,
        ts: NaiveDateTime,
        verdicts: &IncidentVerdicts,
    ) -> Vec<IncidentTrigger> {
        let window_size = self.config.window_size;
        let order = self.config.order;
        let mut triggers = Vec::new();

        for (class, window) in self.windows.iter_mut() {
            window.push_verdict(verdicts.get(*class), window_size);

            if window.counter <= self.spike_threshold {
                continue;
            }
            window.push_spike(ts);

            let Some(span) = window.clustered_span(order) else {
                continue;
            };
            let limit = self.config.limit(*class);
            // Negative when frame timestamps step backwards: not a cluster
            let Ok(span_std) = span.to_std() else {
                debug!(
                    class = %class,
                    span_ms = span.num_milliseconds(),
                    "Spike timestamps out of order"
                );
                continue;
            };

            if span_std < limit {
                window.fire(ts);
                info!(
                    class = %class,
                    timestamp = %ts,
                    span_ms = span_std.as_millis() as u64,
                    trigger_count = window.trigger_count,
                    "{} detected",
                    class.display_name()
                );
                triggers.push(IncidentTrigger {
                    class: *class,
                    timestamp: ts,
                    trigger_count: window.trigger_count,
                    span: span_std,
                });
            } else {
                debug!(
                    class = %class,
                    span_ms = span_std.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "Spikes too sparse to trigger"
                );
            }
        }

        triggers
    }
}

impl Default for IncidentWindowDetector {
    fn default() -> Self {
        Self::new(IncidentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn accident() -> IncidentVerdicts {
        IncidentVerdicts {
            accident: true,
            ..Default::default()
        }
    }

    /// Feed `frames` positive accident frames spaced `step_ms` apart
    fn feed(
        detector: &mut IncidentWindowDetector,
        start: NaiveDateTime,
        frames: usize,
        step_ms: i64,
    ) -> Vec<IncidentTrigger> {
        let mut out = Vec::new();
        for i in 0..frames {
            let ts = start + chrono::Duration::milliseconds(step_ms * i as i64);
            out.extend(detector.on_frame(ts, &accident()));
        }
        out
    }

    #[test]
    fn test_threshold_is_22_of_25() {
        assert_eq!(IncidentConfig::default().spike_threshold(), 22);
    }

    #[test]
    fn test_22_positives_never_spike() {
        let mut detector = IncidentWindowDetector::default();
        for round in 0..3 {
            let start = base() + chrono::Duration::seconds(round * 10);
            feed(&mut detector, start, 22, 10);
            for i in 0..22 {
                let ts = start + chrono::Duration::milliseconds(500 + i * 10);
                detector.on_frame(ts, &IncidentVerdicts::default());
            }
        }
        let window = detector.window(IncidentClass::Accident).unwrap();
        assert_eq!(window.spike_count(), 0);
        assert_eq!(window.counter(), 0);
    }

    #[test]
    fn test_23rd_positive_spikes() {
        let mut detector = IncidentWindowDetector::default();
        feed(&mut detector, base(), 23, 40);
        assert_eq!(
            detector.window(IncidentClass::Accident).unwrap().spike_count(),
            1
        );
    }

    #[test]
    fn test_counter_is_leaky_and_bounded() {
        let mut detector = IncidentWindowDetector::default();
        feed(&mut detector, base(), 40, 10);
        assert_eq!(detector.window(IncidentClass::Accident).unwrap().counter(), 25);

        let mut detector = IncidentWindowDetector::default();
        feed(&mut detector, base(), 10, 10);
        detector.on_frame(base(), &IncidentVerdicts::default());
        detector.on_frame(base(), &IncidentVerdicts::default());
        let window = detector.window(IncidentClass::Accident).unwrap();
        assert_eq!(window.counter(), 8);
        assert_eq!(window.recent_positives(), 10);
    }

    #[test]
    fn test_sparse_spikes_do_not_notify() {
        // 22 frames to arm, then 25 spikes over 24 * 125ms = 3s
        let mut detector = IncidentWindowDetector::default();
        let triggers = feed(&mut detector, base(), 22 + 25, 125);
        assert!(triggers.is_empty());
        assert_eq!(detector.window(IncidentClass::Accident).unwrap().trigger_count(), 0);
    }

    #[test]
    fn test_clustered_spikes_notify_once() {
        // 25 spikes over 24 * 62.5ms = 1.5s
        let mut detector = IncidentWindowDetector::default();
        let mut triggers = Vec::new();
        for i in 0..(22 + 25) {
            let ts = base() + chrono::Duration::microseconds(62_500 * i as i64);
            triggers.extend(detector.on_frame(ts, &accident()));
        }

        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].class, IncidentClass::Accident);
        assert_eq!(triggers[0].span, Duration::from_millis(1500));

        let window = detector.window(IncidentClass::Accident).unwrap();
        assert_eq!(window.counter(), 0);
        assert_eq!(window.trigger_count(), 1);
        assert_eq!(window.last_notified(), Some(triggers[0].timestamp));
    }

    #[test]
    fn test_classes_are_independent() {
        let mut detector = IncidentWindowDetector::default();
        let both = IncidentVerdicts {
            fire: true,
            altercation: true,
            ..Default::default()
        };
        let mut triggers = Vec::new();
        for i in 0..(22 + 25) {
            let ts = base() + chrono::Duration::milliseconds(100 * i as i64);
            triggers.extend(detector.on_frame(ts, &both));
        }
        // 2.4s span: under the 4s fire/altercation limit
        assert_eq!(triggers.len(), 2);
        assert!(triggers.iter().all(|t| t.timestamp == triggers[0].timestamp));
        assert_eq!(detector.window(IncidentClass::Accident).unwrap().counter(), 0);
    }

    #[test]
    fn test_rearm_needs_fresh_episode() {
        let mut detector = IncidentWindowDetector::default();
        let triggers = feed(&mut detector, base(), 22 + 25, 50);
        assert_eq!(triggers.len(), 1);

        // Continuing positives: 22 to re-arm, 24 more spikes is one short
        let after = triggers[0].timestamp + chrono::Duration::milliseconds(50);
        let more = feed(&mut detector, after, 22 + 24, 20);
        assert!(more.is_empty());
    }

    #[test]
    fn test_backwards_timestamps_are_not_clustered() {
        // 24 spikes spread over 4.6s, then one stamped 10s before the first frame
        let mut detector = IncidentWindowDetector::default();
        let mut triggers = feed(&mut detector, base(), 22 + 24, 200);
        triggers.extend(detector.on_frame(base() - chrono::Duration::seconds(10), &accident()));

        assert!(triggers.is_empty());
        let window = detector.window(IncidentClass::Accident).unwrap();
        assert_eq!(window.spike_count(), 25);
        assert_eq!(window.trigger_count(), 0);
    }

    #[test]
    fn test_from_confidences_strictly_above() {
        let v = IncidentVerdicts::from_confidences(
            [(IncidentClass::Fire, 0.75), (IncidentClass::Accident, 0.76)],
            0.75,
        );
        assert!(v.accident);
        assert!(!v.fire);
    }

    #[test]
    fn test_validate_rejects_large_order() {
        let config = IncidentConfig {
            order: 31,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(IncidentConfig::default().validate().is_ok());
    }
}
