#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Disarmed,
    Armed { deadline_ms: u64 },
    Expired,
}

/// One-shot countdown that takes the node offline after a period without
/// activity. There is no automatic re-arm.
#[derive(Debug, Clone)]
pub struct InactivityTimer {
    state: TimerState,
}

impl Default for InactivityTimer {
    fn default() -> Self {
        Self {
            state: TimerState::Disarmed,
        }
    }
}

impl InactivityTimer {
    /// A zero duration leaves the timer disarmed.
    pub fn arm(&mut self, duration_ms: u64, now_ms: u64) {
        self.state = if duration_ms == 0 {
            TimerState::Disarmed
        } else {
            TimerState::Armed {
                deadline_ms: now_ms.saturating_add(duration_ms),
            }
        };
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, TimerState::Armed { .. })
    }

    /// `true` on the first poll at or past the deadline, `false` otherwise.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.state {
            TimerState::Armed { deadline_ms } if now_ms >= deadline_ms => {
                self.state = TimerState::Expired;
                true
            }
            _ => false,
        }
    }

    pub fn stop(&mut self) {
        self.state = TimerState::Disarmed;
    }

    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        match self.state {
            TimerState::Armed { deadline_ms } => Some(deadline_ms.saturating_sub(now_ms)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_never_expires() {
        let mut timer = InactivityTimer::default();
        timer.arm(0, 100);

        assert_eq!(timer.state(), TimerState::Disarmed);
        assert!(!timer.poll(u64::MAX));
    }

    #[test]
    fn expires_once_at_deadline() {
        let mut timer = InactivityTimer::default();
        timer.arm(60_000, 1_000);

        assert!(!timer.poll(60_999));
        assert_eq!(timer.remaining_ms(60_999), Some(1));
        assert!(timer.poll(61_000));
        assert_eq!(timer.state(), TimerState::Expired);
        assert!(!timer.poll(61_001));
        assert!(!timer.poll(1_000_000));
    }

    #[test]
    fn stop_disarms() {
        let mut timer = InactivityTimer::default();
        timer.arm(10, 0);
        timer.stop();

        assert!(!timer.is_armed());
        assert!(!timer.poll(100));
        assert_eq!(timer.remaining_ms(0), None);
    }
}
