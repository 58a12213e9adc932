//! Entity timers
//!
//! One-shot timers driven by the entity clock. The owning task advances the
//! clock once per millisecond and checks for expiry; a dropped entity takes
//! its timers with it.

use std::fmt;

/// RLC timers of TS 38.322 §7.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    PollRetransmit,
    Reassembly,
    StatusProhibit,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::PollRetransmit => "t-PollRetransmit",
            TimerKind::Reassembly => "t-Reassembly",
            TimerKind::StatusProhibit => "t-StatusProhibit",
        };
        write!(f, "{}", name)
    }
}

/// One-shot timer measured in milliseconds of entity time
#[derive(Debug, Clone)]
pub struct RlcTimer {
    kind: TimerKind,
    duration_ms: u32,
    expires_at: Option<u64>,
}

impl RlcTimer {
    pub fn new(kind: TimerKind, duration_ms: u32) -> Self {
        Self {
            kind,
            duration_ms,
            expires_at: None,
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    /// (Re)start the timer at time `now`
    pub fn run(&mut self, now: u64) {
        self.expires_at = Some(now + u64::from(self.duration_ms));
    }

    pub fn stop(&mut self) {
        self.expires_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.expires_at.is_some()
    }

    /// Whether the timer fired at or before `now`; a fired timer stops
    pub fn expire(&mut self, now: u64) -> bool {
        match self.expires_at {
            Some(deadline) if now >= deadline => {
                self.expires_at = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_once() {
        let mut timer = RlcTimer::new(TimerKind::Reassembly, 35);
        assert!(!timer.is_running());
        timer.run(100);
        assert!(timer.is_running());
        assert!(!timer.expire(134));
        assert!(timer.expire(135));
        assert!(!timer.is_running());
        assert!(!timer.expire(136));
    }

    #[test]
    fn test_restart_and_stop() {
        let mut timer = RlcTimer::new(TimerKind::PollRetransmit, 45);
        timer.run(0);
        timer.run(20);
        assert!(!timer.expire(45));
        assert!(timer.expire(65));

        timer.run(70);
        timer.stop();
        assert!(!timer.expire(1000));
        assert_eq!(timer.kind().to_string(), "t-PollRetransmit");
    }
}
