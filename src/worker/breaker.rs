use std::time::{Duration, Instant};

use crate::config::Settings;

/// Speaker-ground-truth stall circuit breaker (spec §4.3). Feature-gated by
/// `STALL_DETECTION_ENABLED`; trips after `circuit_breaker_consecutive`
/// consecutive checks find speaker activity but no recognizer output.
pub struct CircuitBreaker {
    enabled: bool,
    warmup: Duration,
    active_window: Duration,
    stall_threshold: Duration,
    consecutive_threshold: u32,
    started_at: Instant,
    streak: u32,
}

impl CircuitBreaker {
    pub fn new(settings: &Settings, started_at: Instant) -> Self {
        Self {
            enabled: settings.stall_detection_enabled,
            warmup: Duration::from_secs(settings.server_warmup_s),
            active_window: Duration::from_secs(settings.speaker_active_window_s),
            stall_threshold: Duration::from_secs(settings.server_speaker_no_tx_stall_s),
            consecutive_threshold: settings.circuit_breaker_consecutive,
            started_at,
            streak: 0,
        }
    }

    /// Evaluate one check tick; returns `true` once the consecutive-streak
    /// threshold is reached and the caller should shut the session down.
    pub fn check(
        &mut self,
        now: Instant,
        last_speaker_activity_at: Option<Instant>,
        last_output_at: Instant,
    ) -> bool {
        if !self.enabled || now.duration_since(self.started_at) < self.warmup {
            return false;
        }

        let speaker_active = last_speaker_activity_at
            .map(|t| now.duration_since(t) <= self.active_window)
            .unwrap_or(false);
        let stalled = now.duration_since(last_output_at) >= self.stall_threshold;

        if speaker_active && stalled {
            self.streak += 1;
        } else {
            self.streak = 0;
        }

        self.streak >= self.consecutive_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(enabled: bool) -> Settings {
        let mut s = test_settings();
        s.stall_detection_enabled = enabled;
        s.server_warmup_s = 0;
        s.speaker_active_window_s = 8;
        s.server_speaker_no_tx_stall_s = 30;
        s.circuit_breaker_consecutive = 2;
        s
    }

    fn test_settings() -> Settings {
        std::env::set_var("MEETING_TOKEN_SECRET", "test-secret");
        Settings::load().unwrap()
    }

    #[test]
    fn disabled_never_trips() {
        let mut breaker = CircuitBreaker::new(&settings_with(false), Instant::now());
        let now = Instant::now();
        let stale = now - Duration::from_secs(60);
        assert!(!breaker.check(now, Some(now), stale));
        assert!(!breaker.check(now, Some(now), stale));
        assert!(!breaker.check(now, Some(now), stale));
    }

    #[test]
    fn trips_after_consecutive_stalled_checks_with_active_speaker() {
        let mut breaker = CircuitBreaker::new(&settings_with(true), Instant::now() - Duration::from_secs(120));
        let now = Instant::now();
        let recent_speaker = now - Duration::from_secs(2);
        let stale_output = now - Duration::from_secs(60);
        assert!(!breaker.check(now, Some(recent_speaker), stale_output));
        assert!(breaker.check(now, Some(recent_speaker), stale_output));
    }

    #[test]
    fn resets_streak_when_output_resumes() {
        let mut breaker = CircuitBreaker::new(&settings_with(true), Instant::now() - Duration::from_secs(120));
        let now = Instant::now();
        let recent_speaker = now - Duration::from_secs(2);
        assert!(!breaker.check(now, Some(recent_speaker), now - Duration::from_secs(60)));
        assert!(!breaker.check(now, Some(recent_speaker), now));
        assert!(!breaker.check(now, Some(recent_speaker), now - Duration::from_secs(60)));
    }
}
