//! Round Clock
//!
//! Countdown against a round's absolute end time. Time left is recomputed
//! from the end timestamp on every tick, never decremented from a prior
//! value, so scheduling jitter cannot accumulate drift. Carries no
//! transition authority; only the lifecycle engine decides when to finalize.

use chrono::{DateTime, Utc};

use crate::models::{GameSnapshot, Phase, Round};

#[derive(Debug, Clone, Copy)]
pub struct RoundClock {
    duration_secs: i64,
    betting_window_secs: i64,
}

impl RoundClock {
    pub fn new(duration_secs: i64, betting_window_secs: i64) -> Self {
        Self {
            duration_secs,
            betting_window_secs,
        }
    }

    /// Whole seconds remaining until `end_time`, clamped at zero.
    pub fn time_left(&self, end_time: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (end_time.timestamp() - now.timestamp()).max(0)
    }

    /// Betting while more than `duration - window` seconds remain, waiting
    /// for the rest of the round.
    pub fn phase(&self, time_left: i64) -> Phase {
        if time_left > self.duration_secs - self.betting_window_secs {
            Phase::Betting
        } else {
            Phase::Waiting
        }
    }

    pub fn snapshot(&self, round: &Round, now: DateTime<Utc>) -> GameSnapshot {
        let time_left = self.time_left(round.end_time, now);
        GameSnapshot {
            round_id: round.id.clone(),
            start_time: round.start_time,
            end_time: round.end_time,
            time_left,
            phase: self.phase(time_left),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn clock() -> RoundClock {
        RoundClock::new(60, 30)
    }

    #[test]
    fn test_time_left_is_never_negative() {
        let now = Utc::now();
        assert_eq!(clock().time_left(now - Duration::seconds(10), now), 0);
        assert_eq!(clock().time_left(now, now), 0);
        assert_eq!(clock().time_left(now + Duration::seconds(45), now), 45);
    }

    #[test]
    fn test_time_left_tracks_absolute_end_not_prior_ticks() {
        let c = clock();
        let end = Utc::now() + Duration::seconds(60);
        // A stalled scheduler jumping 7s forward still lands on the right value.
        let t1 = c.time_left(end, end - Duration::seconds(60));
        let t2 = c.time_left(end, end - Duration::seconds(53));
        assert_eq!(t1, 60);
        assert_eq!(t2, 53);
    }

    #[test]
    fn test_phase_boundaries() {
        let c = clock();
        assert_eq!(c.phase(60), Phase::Betting);
        assert_eq!(c.phase(31), Phase::Betting);
        assert_eq!(c.phase(30), Phase::Waiting);
        assert_eq!(c.phase(1), Phase::Waiting);
        assert_eq!(c.phase(0), Phase::Waiting);
    }
}
