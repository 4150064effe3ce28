//! Next-execution computation for subscription triggers.

use crate::store::resources::Trigger;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

/// When the trigger should fire next, strictly after `after`. `None`
/// means the trigger is exhausted (one-shots) or unparseable.
pub fn next_execution(trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Cron { expression } => {
            let schedule = Schedule::from_str(expression).ok()?;
            schedule.after(&after).next()
        }
        Trigger::Interval { seconds } => Some(after + Duration::seconds((*seconds).max(1))),
        Trigger::OneTime { at } => match at {
            Some(at) if *at > after => Some(*at),
            // No explicit time: fire on the next scan.
            None => Some(after),
            _ => None,
        },
    }
}

/// Whether a freshly dispatched trigger has further occurrences.
pub fn reschedules(trigger: &Trigger) -> bool {
    !matches!(trigger, Trigger::OneTime { .. })
}
