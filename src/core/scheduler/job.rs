use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once at `fire_at`, then the job is retired.
    Delay { fire_at: DateTime<Utc> },
    Interval { seconds: u64 },
    Cron { expression: String },
}

fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| anyhow!("invalid cron expression '{}': {:?}", expression, e))
}

impl Trigger {
    pub fn cron(expression: &str) -> Result<Self> {
        parse_cron(expression)?;
        Ok(Trigger::Cron {
            expression: expression.trim().to_string(),
        })
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::Delay { .. })
    }

    /// First fire time strictly after `after`, or `None` once a one-shot
    /// trigger has passed.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Trigger::Delay { fire_at } => Ok((*fire_at > after).then_some(*fire_at)),
            Trigger::Interval { seconds } => {
                let step = i64::try_from((*seconds).max(1))
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or_else(|| anyhow!("interval of {}s is too large", seconds))?;
                after
                    .checked_add_signed(step)
                    .map(Some)
                    .ok_or_else(|| anyhow!("interval of {}s runs past the representable calendar", seconds))
            }
            Trigger::Cron { expression } => {
                let cron = parse_cron(expression)?;
                cron.find_next_occurrence(&after, false)
                    .map(Some)
                    .map_err(|e| anyhow!("no next occurrence for '{}': {:?}", expression, e))
            }
        }
    }

    /// Marker prefixed to the payload when the job reaches the model.
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Delay { .. } => "[Reminder]",
            Trigger::Interval { .. } => "[Interval Task]",
            Trigger::Cron { .. } => "[Scheduled Task]",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Delay { fire_at } => format!("once at {}", fire_at.format("%Y-%m-%d %H:%M:%S UTC")),
            Trigger::Interval { seconds } => format!("every {}s", seconds),
            Trigger::Cron { expression } => format!("cron '{}'", expression),
        }
    }
}

/// A persisted instruction to re-inject `payload` into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub conversation_id: String,
    pub trigger: Trigger,
    pub payload: String,
    pub next_fire_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at <= now
    }

    /// Where the next fire time is computed from after a restart.
    pub fn anchor(&self) -> DateTime<Utc> {
        self.last_fired_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn delay_fires_once() {
        let trigger = Trigger::Delay { fire_at: at(9, 10, 0) };
        assert_eq!(trigger.next_after(at(9, 0, 0)).unwrap(), Some(at(9, 10, 0)));
        assert_eq!(trigger.next_after(at(9, 10, 0)).unwrap(), None);
        assert!(!trigger.is_recurring());
    }

    #[test]
    fn interval_steps_from_anchor() {
        let trigger = Trigger::Interval { seconds: 90 };
        assert_eq!(trigger.next_after(at(9, 0, 0)).unwrap(), Some(at(9, 1, 30)));
    }

    #[test]
    fn oversized_interval_is_an_error() {
        assert!(Trigger::Interval { seconds: u64::MAX }.next_after(at(9, 0, 0)).is_err());
        assert!(Trigger::Interval { seconds: 1 << 63 }.next_after(at(9, 0, 0)).is_err());
        assert!(Trigger::Interval { seconds: i64::MAX as u64 }.next_after(at(9, 0, 0)).is_err());
    }

    #[test]
    fn cron_next_is_strictly_after() {
        let trigger = Trigger::cron("*/15 * * * *").unwrap();
        assert_eq!(trigger.next_after(at(9, 0, 0)).unwrap(), Some(at(9, 15, 0)));
        assert_eq!(trigger.next_after(at(9, 7, 30)).unwrap(), Some(at(9, 15, 0)));
    }

    #[test]
    fn cron_accepts_seconds_field() {
        let trigger = Trigger::cron("30 * * * * *").unwrap();
        assert_eq!(trigger.next_after(at(9, 0, 0)).unwrap(), Some(at(9, 0, 30)));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(Trigger::cron("every tuesday").is_err());
    }

    #[test]
    fn trigger_round_trips_through_json() {
        let trigger = Trigger::cron("0 9 * * MON").unwrap();
        let json = serde_json::to_string(&trigger).unwrap();
        assert!(json.contains("\"kind\":\"cron\""));
        assert_eq!(serde_json::from_str::<Trigger>(&json).unwrap(), trigger);
    }

    #[test]
    fn labels_match_trigger_kind() {
        assert_eq!(Trigger::Delay { fire_at: at(0, 0, 0) }.label(), "[Reminder]");
        assert_eq!(Trigger::Interval { seconds: 5 }.label(), "[Interval Task]");
        assert_eq!(Trigger::cron("* * * * *").unwrap().label(), "[Scheduled Task]");
    }
}
