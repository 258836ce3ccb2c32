//! Frame decimation.
//!
//! The throttle is a pure decision from native frame arrival time to emit/drop.
//! Frames that arrive before the next emission slot are dropped, never queued.

use anyhow::{anyhow, Result};
use std::time::Duration;

pub const MAX_TARGET_FPS: u32 = 120;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Emit,
    Drop,
}

/// Rate limiter keyed on stream-relative arrival times.
///
/// Emission slots are spaced `1/fps` apart. A frame is emitted when it arrives at
/// or after the current slot; the next slot is then one interval later, or one
/// interval after the frame if the stream fell behind. Over any window of length
/// `T` at most `T * fps + 1` frames are emitted.
#[derive(Clone, Debug)]
pub struct FrameThrottle {
    interval: Duration,
    next_due: Option<Duration>,
}

impl FrameThrottle {
    pub fn new(target_fps: u32) -> Result<Self> {
        if target_fps == 0 || target_fps > MAX_TARGET_FPS {
            return Err(anyhow!(
                "target fps must be between 1 and {}, got {}",
                MAX_TARGET_FPS,
                target_fps
            ));
        }
        Ok(Self {
            interval: Duration::from_nanos(1_000_000_000 / target_fps as u64),
            next_due: None,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, arrival: Duration) -> ThrottleDecision {
        match self.next_due {
            Some(due) if arrival < due => ThrottleDecision::Drop,
            Some(due) => {
                let next = due + self.interval;
                self.next_due = Some(if next <= arrival {
                    arrival + self.interval
                } else {
                    next
                });
                ThrottleDecision::Emit
            }
            None => {
                self.next_due = Some(arrival + self.interval);
                ThrottleDecision::Emit
            }
        }
    }

    /// Forget the schedule; the next frame is emitted unconditionally.
    pub fn reset(&mut self) {
        self.next_due = None;
    }
}

/// Decide emit/drop for a whole arrival sequence.
pub fn plan_emissions(arrivals: &[Duration], target_fps: u32) -> Result<Vec<ThrottleDecision>> {
    let mut throttle = FrameThrottle::new(target_fps)?;
    Ok(arrivals.iter().map(|a| throttle.admit(*a)).collect())
}
