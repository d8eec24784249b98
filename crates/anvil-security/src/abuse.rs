use std::collections::HashMap;
use std::sync::Mutex;

use anvil_core::error::{AnvilError, Result};
use chrono::{DateTime, Duration, Utc};

/// A single observed abuse signal, keyed independently per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbuseEvent {
    FailedLogin,
    FlagAttemptFailed,
    ScanDetected,
}

struct Record {
    timestamps: Vec<DateTime<Utc>>,
    forbidden_until: Option<DateTime<Utc>>,
}

impl Record {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
            forbidden_until: None,
        }
    }
}

/// Tracks failed-login counts, flag-attempt counts, and scan signals per
/// identity. Exceeding `threshold` occurrences of any single event kind
/// within `window` triggers a `Forbidden` cooldown.
pub struct AbuseTracker {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    records: Mutex<HashMap<(String, AbuseEvent), Record>>,
}

impl AbuseTracker {
    pub fn new(threshold: u32, window_secs: u64, cooldown_secs: u64) -> Self {
        Self {
            threshold,
            window: Duration::seconds(window_secs as i64),
            cooldown: Duration::seconds(cooldown_secs as i64),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Records one occurrence of `event` for `key`. Returns `Forbidden`
    /// once the threshold is crossed within the tracking window, and
    /// continues returning it until the cooldown elapses.
    pub fn record(&self, key: &str, event: AbuseEvent) -> Result<()> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry((key.to_string(), event))
            .or_insert_with(Record::new);

        if let Some(until) = record.forbidden_until {
            if now < until {
                return Err(AnvilError::Forbidden {
                    message: format!("{key} is in cooldown after repeated {event:?} events"),
                });
            }
            record.forbidden_until = None;
            record.timestamps.clear();
        }

        record.timestamps.push(now);
        let cutoff = now - self.window;
        record.timestamps.retain(|t| *t >= cutoff);

        if record.timestamps.len() as u32 >= self.threshold {
            record.forbidden_until = Some(now + self.cooldown);
            tracing::warn!(key, ?event, threshold = self.threshold, "abuse threshold crossed");
            return Err(AnvilError::Forbidden {
                message: format!("{key} exceeded {} {event:?} events in window", self.threshold),
            });
        }
        Ok(())
    }

    pub fn is_forbidden(&self, key: &str, event: AbuseEvent) -> bool {
        let now = Utc::now();
        self.records
            .lock()
            .unwrap()
            .get(&(key.to_string(), event))
            .and_then(|r| r.forbidden_until)
            .is_some_and(|until| now < until)
    }

    /// Evicts records whose most recent event is older than `2 * window`.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let stale_after = self.window * 2;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, record| {
            if let Some(until) = record.forbidden_until {
                if now < until {
                    return true;
                }
            }
            record
                .timestamps
                .last()
                .is_some_and(|last| now - *last <= stale_after)
        });
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_events_under_threshold() {
        let tracker = AbuseTracker::new(3, 900, 60);
        assert!(tracker.record("user-1", AbuseEvent::FailedLogin).is_ok());
        assert!(tracker.record("user-1", AbuseEvent::FailedLogin).is_ok());
    }

    #[test]
    fn crossing_threshold_triggers_forbidden_and_cooldown() {
        let tracker = AbuseTracker::new(3, 900, 60);
        tracker.record("user-1", AbuseEvent::FailedLogin).unwrap();
        tracker.record("user-1", AbuseEvent::FailedLogin).unwrap();
        let err = tracker.record("user-1", AbuseEvent::FailedLogin).unwrap_err();
        assert_eq!(err.tag(), "forbidden");
        assert!(tracker.is_forbidden("user-1", AbuseEvent::FailedLogin));

        let err2 = tracker.record("user-1", AbuseEvent::FailedLogin).unwrap_err();
        assert_eq!(err2.tag(), "forbidden");
    }

    #[test]
    fn different_event_kinds_track_independently() {
        let tracker = AbuseTracker::new(2, 900, 60);
        tracker.record("user-1", AbuseEvent::FailedLogin).unwrap();
        assert!(tracker.record("user-1", AbuseEvent::ScanDetected).is_ok());
    }

    #[test]
    fn sweep_evicts_stale_non_forbidden_records() {
        let tracker = AbuseTracker::new(5, 60, 30);
        tracker.record("user-1", AbuseEvent::FlagAttemptFailed).unwrap();
        {
            let mut records = tracker.records.lock().unwrap();
            let record = records
                .get_mut(&("user-1".to_string(), AbuseEvent::FlagAttemptFailed))
                .unwrap();
            record.timestamps[0] = Utc::now() - Duration::seconds(1000);
        }
        assert_eq!(tracker.sweep(), 1);
    }
}
