//! Cron/interval schedule helpers shared by the scheduler.
//!
//! Coreclaw uses the 7-field dialect (`sec min hour dom month dow
//! year`) of the `cron` crate, the same dialect already exercised by
//! `cron_service::scheduler`'s tests.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;

use crate::error::{CoreclawError, Result};
use crate::models::ScheduleType;

/// Compute the next run time for a task given its schedule kind/value
/// and the time it last fired (or was created, for a never-fired task).
///
/// Returns `None` for a `once` schedule that has already fired (the
/// caller marks the task `done` in that case).
pub fn compute_next_run(
    schedule_type: ScheduleType,
    schedule_value: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Cron => {
            let schedule = Schedule::from_str(schedule_value).map_err(|e| {
                CoreclawError::ConfigInvalid {
                    reason: format!("invalid cron expression {schedule_value:?}: {e}"),
                }
            })?;
            Ok(schedule.after(&after).next())
        }
        ScheduleType::Interval => {
            let ms: i64 = schedule_value
                .trim()
                .parse()
                .map_err(|_| CoreclawError::ConfigInvalid {
                    reason: format!("invalid interval schedule value: {schedule_value:?}"),
                })?;
            Ok(Some(after + chrono::Duration::milliseconds(ms)))
        }
        ScheduleType::Once => Ok(None),
    }
}

pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
