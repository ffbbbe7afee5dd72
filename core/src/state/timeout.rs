//! Wall-clock execution budgets.
//!
//! Budgets nest in a LIFO stack. Elapsed time is measured lazily at check
//! points and charged to every active budget at once; expiry is then evaluated
//! innermost-first, so an inner one-second budget fires before the outer
//! five-second budget it is nested inside, and the outer budget still sees the
//! full time its callees spent.

use anyhow::{Result, ensure};
use tracing::trace;

use crate::exception::ExceptionReport;

use super::frame::FrameId;
use super::ExecutionState;

pub(crate) const TICKS_PER_SECOND: u64 = 1_000_000;

#[derive(Debug)]
pub(crate) struct Timeout {
    pub length_ticks: u64,
    pub accumulated_ticks: u64,
    /// The frame that pushed this budget and must pop it.
    pub owner: FrameId,
}

/// Where elapsed ticks come from. Tests swap in the manual source to step
/// time deterministically.
#[derive(Debug)]
pub(crate) enum TickSource {
    Monotonic { last: std::time::Instant },
    #[cfg(test)]
    Manual { now: u64, last: u64 },
}

impl TickSource {
    pub fn monotonic() -> Self {
        TickSource::Monotonic {
            last: std::time::Instant::now(),
        }
    }

    /// Ticks since the previous call (or the last reset).
    pub fn ticks_since_last_check(&mut self) -> u64 {
        match self {
            TickSource::Monotonic { last } => {
                let now = std::time::Instant::now();
                let elapsed = now.duration_since(*last).as_micros() as u64;
                *last = now;
                elapsed
            }
            #[cfg(test)]
            TickSource::Manual { now, last } => {
                let elapsed = *now - *last;
                *last = *now;
                elapsed
            }
        }
    }

    /// Forgets time that passed while no budget was active.
    pub fn reset(&mut self) {
        match self {
            TickSource::Monotonic { last } => *last = std::time::Instant::now(),
            #[cfg(test)]
            TickSource::Manual { now, last } => *last = *now,
        }
    }
}

impl ExecutionState {
    /// Changes the default budget pushed around the outermost call. Zero
    /// disables it. Rejected while calls are active; the running stack already
    /// pushed its budget.
    pub fn set_timeout(&mut self, seconds: u64) -> Result<()> {
        ensure!(
            !self.is_in_call_stack(),
            "cannot change the timeout while a call is executing"
        );
        self.timeout_seconds = seconds;
        Ok(())
    }

    /// Pushes a budget of `seconds` owned by `frame`. Existing budgets are
    /// checked first; returns `true` if one of them expired, in which case
    /// nothing is pushed.
    pub fn push_timeout(
        &mut self,
        frame: FrameId,
        seconds: u64,
        report: &mut ExceptionReport,
    ) -> bool {
        if self.check_timeout(report) {
            return true;
        }
        self.push_timeout_unchecked(frame, seconds);
        false
    }

    pub(crate) fn push_timeout_unchecked(&mut self, frame: FrameId, seconds: u64) {
        if self.timeouts.is_empty() {
            // Idle time before the first budget does not count against it.
            self.ticks.reset();
        }
        trace!(seconds, "push timeout budget");
        self.timeouts.push(Timeout {
            length_ticks: seconds.saturating_mul(TICKS_PER_SECOND),
            accumulated_ticks: 0,
            owner: frame,
        });
        self.get_frame_mut(frame).timeouts += 1;
    }

    /// Pops the innermost budget, which must belong to `frame`. Performs a
    /// final check first unless an exception is already in flight; returns
    /// `true` if that check threw.
    pub fn pop_timeout(&mut self, frame: FrameId, report: &mut ExceptionReport) -> bool {
        let expired = if report.has_thrown() {
            false
        } else {
            self.check_timeout(report)
        };
        let popped = self.timeouts.pop();
        debug_assert!(
            popped.map(|t| t.owner == frame).unwrap_or(false),
            "timeout budgets must be popped by the frame that pushed them"
        );
        let frame = self.get_frame_mut(frame);
        frame.timeouts = frame.timeouts.saturating_sub(1);
        expired
    }

    /// Charges time elapsed since the last check to every active budget and
    /// throws if any is exhausted, innermost budget first. Interpreters call
    /// this at loop back-edges and call sites.
    pub fn check_timeout(&mut self, report: &mut ExceptionReport) -> bool {
        if self.timeouts.is_empty() {
            return false;
        }
        let elapsed = self.ticks.ticks_since_last_check();
        let mut exceeded = None;
        for timeout in self.timeouts.iter_mut() {
            timeout.accumulated_ticks = timeout.accumulated_ticks.saturating_add(elapsed);
        }
        for timeout in self.timeouts.iter().rev() {
            if timeout.accumulated_ticks > timeout.length_ticks {
                exceeded = Some(timeout.length_ticks / TICKS_PER_SECOND);
                break;
            }
        }
        match exceeded {
            Some(seconds) => {
                self.throw_exception(
                    report,
                    &format!(
                        "execution exceeded the allotted time of {seconds} second(s); \
                         raise the budget with a longer timeout if this is expected"
                    ),
                );
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn use_manual_ticks(&mut self) {
        self.ticks = TickSource::Manual { now: 0, last: 0 };
    }

    #[cfg(test)]
    pub(crate) fn advance_ticks(&mut self, ticks: u64) {
        if let TickSource::Manual { now, .. } = &mut self.ticks {
            *now += ticks;
        }
    }
}
