//! Software trigger detection with hysteresis.

use crate::config::TriggerDirection;

/// Edge detector over analog or digital sample windows.
///
/// One bit of state persists across calls, so a trigger that fires near the
/// end of one chunk cannot re-fire at the start of the next until the signal
/// has left the hysteresis band. Offsets returned within a single call are
/// strictly increasing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerDetector {
    state: bool,
}

impl TriggerDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the persisted trigger state.
    pub fn reset(&mut self) {
        self.state = false;
    }

    /// Detect trigger offsets in an analog sample window.
    ///
    /// For rising/high triggers an offset is emitted when an untriggered
    /// detector sees a sample at or above `threshold`; the detector re-arms
    /// once a sample falls to `threshold - band` or below. Falling/low
    /// mirrors this around `threshold + band`.
    pub fn detect_analog(
        &mut self,
        samples: &[f32],
        direction: TriggerDirection,
        threshold: f32,
        band: f32,
    ) -> Vec<usize> {
        let mut offsets = Vec::new();
        match direction {
            TriggerDirection::Rising | TriggerDirection::High => {
                let lo = threshold - band;
                for (i, &sample) in samples.iter().enumerate() {
                    if !self.state && sample >= threshold {
                        self.state = true;
                        offsets.push(i);
                    } else if self.state && sample <= lo {
                        self.state = false;
                    }
                }
            }
            TriggerDirection::Falling | TriggerDirection::Low => {
                let hi = threshold + band;
                for (i, &sample) in samples.iter().enumerate() {
                    if self.state && sample <= threshold {
                        self.state = false;
                        offsets.push(i);
                    } else if !self.state && sample >= hi {
                        self.state = true;
                    }
                }
            }
        }
        offsets
    }

    /// Detect trigger offsets on one pin of a digital port window. `mask`
    /// selects the pin bit within each port byte.
    pub fn detect_digital(
        &mut self,
        samples: &[u8],
        direction: TriggerDirection,
        mask: u8,
    ) -> Vec<usize> {
        let mut offsets = Vec::new();
        match direction {
            TriggerDirection::Rising | TriggerDirection::High => {
                for (i, &sample) in samples.iter().enumerate() {
                    if !self.state && sample & mask != 0 {
                        self.state = true;
                        offsets.push(i);
                    } else if self.state && sample & mask == 0 {
                        self.state = false;
                    }
                }
            }
            TriggerDirection::Falling | TriggerDirection::Low => {
                for (i, &sample) in samples.iter().enumerate() {
                    if self.state && sample & mask == 0 {
                        self.state = false;
                        offsets.push(i);
                    } else if !self.state && sample & mask != 0 {
                        self.state = true;
                    }
                }
            }
        }
        offsets
    }
}
