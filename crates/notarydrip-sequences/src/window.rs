//! Send-window clamping.
//! Computes when a step may fire: event time + delay, pushed forward into the
//! step's hour-of-day window in the reference timezone.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use notarydrip_core::error::{Result, ValidationError};

use crate::model::{Delay, SendWindow};

/// Earliest eligible fire time for a step. Errors when the delay is out of
/// range or pushes the time past what chrono can represent.
pub fn fire_at(
    event_at: DateTime<Utc>,
    delay: Delay,
    window: Option<SendWindow>,
    tz: Tz,
) -> Result<DateTime<Utc>> {
    let too_large = || ValidationError::DelayTooLarge {
        value: delay.value,
        unit: delay.unit.as_str(),
    };
    if delay.exceeds_max() {
        return Err(too_large().into());
    }
    let at = delay
        .to_duration()
        .and_then(|d| event_at.checked_add_signed(d))
        .ok_or_else(too_large)?;
    Ok(clamp_to_window(at, window, tz))
}

/// Push `at` into `window`:
/// - before `start_hour` → `start_hour:00` the same local day
/// - at or after `end_hour` → `start_hour:00` the next local day
/// - inside, or no window → unchanged
pub fn clamp_to_window(at: DateTime<Utc>, window: Option<SendWindow>, tz: Tz) -> DateTime<Utc> {
    let Some(window) = window else {
        return at;
    };

    let local = at.with_timezone(&tz);
    let hour = local.hour();
    let date = local.date_naive();

    if hour < u32::from(window.start_hour) {
        local_hour_start(tz, date, window.start_hour)
    } else if hour >= u32::from(window.end_hour) {
        let next = date.succ_opt().unwrap_or(date);
        local_hour_start(tz, next, window.start_hour)
    } else {
        at
    }
}

/// `date hour:00` in `tz`, as UTC. If the wall-clock time falls in a DST gap,
/// walk forward a minute at a time to the first instant that exists.
fn local_hour_start(tz: Tz, date: NaiveDate, hour: u8) -> DateTime<Utc> {
    let mut naive = date
        .and_hms_opt(u32::from(hour.min(23)), 0, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));

    // Gaps are at most a couple of hours.
    for _ in 0..(3 * 60) {
        if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
            return dt.with_timezone(&Utc);
        }
        naive += Duration::minutes(1);
    }
    Utc.from_utc_datetime(&naive)
}
