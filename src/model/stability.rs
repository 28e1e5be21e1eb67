//! Stabilization detection.
//!
//! Decides whether a decoded reading is the final one of a session, according
//! to the configured `StabilizationPolicy`.

use crate::core::config::StabilizationPolicy;
use crate::model::reading::Reading;
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;

/// Progress of the detector after observing a reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Settled,
    /// Not final yet. `window` is `(collected, required)` in window mode.
    Pending {
        window: Option<(usize, usize)>,
        stable_for: Option<Duration>,
    },
}

impl Verdict {
    pub fn is_settled(&self) -> bool {
        matches!(self, Verdict::Settled)
    }
}

#[derive(Debug)]
pub struct StabilityDetector {
    policy: StabilizationPolicy,
    recent: VecDeque<f64>,
    stable_since: Option<OffsetDateTime>,
}

impl StabilityDetector {
    pub fn new(policy: StabilizationPolicy) -> Self {
        Self {
            policy,
            recent: VecDeque::new(),
            stable_since: None,
        }
    }

    pub fn observe(&mut self, reading: &Reading) -> Verdict {
        match self.policy {
            StabilizationPolicy::ScaleFlag => {
                if reading.is_stabilized() {
                    Verdict::Settled
                } else {
                    Verdict::Pending {
                        window: None,
                        stable_for: None,
                    }
                }
            }
            StabilizationPolicy::Window {
                readings,
                tolerance_kg,
                min_duration,
            } => self.observe_window(reading, readings.max(1), tolerance_kg, min_duration),
        }
    }

    fn observe_window(
        &mut self,
        reading: &Reading,
        required: usize,
        tolerance_kg: f64,
        min_duration: Duration,
    ) -> Verdict {
        self.recent.push_back(reading.weight_kg());
        while self.recent.len() > required {
            self.recent.pop_front();
        }
        let pending = |stable_for| Verdict::Pending {
            window: Some((self.recent.len(), required)),
            stable_for,
        };
        if self.recent.len() < required {
            return pending(None);
        }

        let (min, max) = self
            .recent
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), w| {
                (lo.min(*w), hi.max(*w))
            });
        if max - min > tolerance_kg {
            self.stable_since = None;
            return pending(None);
        }

        let now = reading.captured_at();
        let since = *self.stable_since.get_or_insert(now);
        let stable_for = Duration::try_from(now - since).unwrap_or_default();
        if stable_for >= min_duration {
            Verdict::Settled
        } else {
            pending(Some(stable_for))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::reading::{decode, encode_frame, Frame};
    use time::macros::datetime;

    fn reading_at(weight: f64, stabilized: bool, secs: i64) -> Reading {
        let at = datetime!(2024-05-17 07:30:00 UTC) + time::Duration::seconds(secs);
        decode(&Frame::new(encode_frame(weight, None, stabilized), at)).unwrap()
    }

    #[test]
    fn test_scale_flag_policy() {
        let mut detector = StabilityDetector::new(StabilizationPolicy::ScaleFlag);
        assert!(!detector.observe(&reading_at(70.0, false, 0)).is_settled());
        assert!(detector.observe(&reading_at(70.1, true, 1)).is_settled());
    }

    #[test]
    fn test_window_requires_count_and_duration() {
        let mut detector = StabilityDetector::new(StabilizationPolicy::Window {
            readings: 3,
            tolerance_kg: 0.1,
            min_duration: Duration::from_secs(2),
        });
        assert_eq!(
            detector.observe(&reading_at(70.0, true, 0)),
            Verdict::Pending {
                window: Some((1, 3)),
                stable_for: None
            }
        );
        assert!(!detector.observe(&reading_at(70.05, false, 1)).is_settled());
        // window full and within tolerance: stability clock starts
        assert_eq!(
            detector.observe(&reading_at(70.0, false, 2)),
            Verdict::Pending {
                window: Some((3, 3)),
                stable_for: Some(Duration::ZERO)
            }
        );
        assert!(!detector.observe(&reading_at(70.0, false, 3)).is_settled());
        assert!(detector.observe(&reading_at(70.05, false, 4)).is_settled());
    }

    #[test]
    fn test_window_resets_on_fluctuation() {
        let mut detector = StabilityDetector::new(StabilizationPolicy::Window {
            readings: 2,
            tolerance_kg: 0.1,
            min_duration: Duration::from_secs(1),
        });
        detector.observe(&reading_at(70.0, false, 0));
        detector.observe(&reading_at(70.0, false, 1));
        assert!(!detector.observe(&reading_at(72.0, false, 5)).is_settled());
        assert!(detector.stable_since.is_none());
        assert!(!detector.observe(&reading_at(72.0, false, 6)).is_settled());
        assert!(detector.observe(&reading_at(72.0, false, 7)).is_settled());
    }

    #[test]
    fn test_default_window_values() {
        let mut detector = StabilityDetector::new(StabilizationPolicy::window());
        for i in 0..6 {
            assert!(!detector.observe(&reading_at(80.0, true, i)).is_settled());
        }
        // seventh reading fills the window; three more seconds are needed
        assert!(!detector.observe(&reading_at(80.0, true, 6)).is_settled());
        assert!(detector.observe(&reading_at(80.0, true, 9)).is_settled());
    }
}
