//! A minimal 5-field cron matcher: minute hour day-of-month month
//! day-of-week. No external cron crate; grounded on `scheduler/cron.py`,
//! kept as a direct port since the grammar is small and self-contained.

/// Checks whether `dt` (already projected into the scheduler's configured
/// timezone by the caller) matches every field of a 5-field cron
/// expression.
pub fn cron_matches(expression: &str, dt: &chrono::DateTime<chrono_tz::Tz>) -> anyhow::Result<bool> {
    use chrono::{Datelike, Timelike};

    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        anyhow::bail!("invalid cron expression (need 5 fields): {expression:?}");
    }
    let [minute, hour, dom, month, dow] = [parts[0], parts[1], parts[2], parts[3], parts[4]];

    // cron's day-of-week is 0=Sun..6=Sat, which is exactly chrono's
    // "days from Sunday" -- no Python isoweekday()%7 translation needed.
    let cron_dow = dt.weekday().num_days_from_sunday() as i64;

    Ok(field_matches(minute, dt.minute() as i64, 0, 59)?
        && field_matches(hour, dt.hour() as i64, 0, 23)?
        && field_matches(dom, dt.day() as i64, 1, 31)?
        && field_matches(month, dt.month() as i64, 1, 12)?
        && field_matches(dow, cron_dow, 0, 6)?)
}

fn field_matches(field: &str, value: i64, min_val: i64, max_val: i64) -> anyhow::Result<bool> {
    if field == "*" {
        return Ok(true);
    }

    if let Some(step) = field.strip_prefix("*/") {
        let step: i64 = step.parse().map_err(|_| anyhow::anyhow!("invalid cron step: {field:?}"))?;
        if step == 0 {
            anyhow::bail!("invalid cron step: {field:?}");
        }
        return Ok(value % step == 0);
    }

    if field.contains(',') {
        for part in field.split(',') {
            if field_matches(part.trim(), value, min_val, max_val)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    if let Some((start, end)) = field.split_once('-') {
        let start: i64 = start.parse().map_err(|_| anyhow::anyhow!("invalid cron range: {field:?}"))?;
        let end: i64 = end.parse().map_err(|_| anyhow::anyhow!("invalid cron range: {field:?}"))?;
        return Ok(start <= value && value <= end);
    }

    let exact: i64 = field.parse().map_err(|_| anyhow::anyhow!("invalid cron field: {field:?}"))?;
    Ok(value == exact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::DateTime<chrono_tz::Tz> {
        chrono_tz::UTC.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn wildcard_matches_everything() {
        assert!(cron_matches("* * * * *", &at(2026, 7, 26, 3, 17)).unwrap());
    }

    #[test]
    fn step_matches_multiples() {
        assert!(cron_matches("*/5 * * * *", &at(2026, 7, 26, 3, 15)).unwrap());
        assert!(!cron_matches("*/5 * * * *", &at(2026, 7, 26, 3, 17)).unwrap());
    }

    #[test]
    fn range_and_exact() {
        assert!(cron_matches("0 16 * * 1-5", &at(2026, 7, 27, 16, 0)).unwrap()); // Monday
        assert!(!cron_matches("0 16 * * 1-5", &at(2026, 7, 26, 16, 0)).unwrap()); // Sunday
    }

    #[test]
    fn sunday_is_zero() {
        // 2026-07-26 is a Sunday.
        assert!(cron_matches("0 9 * * 0", &at(2026, 7, 26, 9, 0)).unwrap());
    }

    #[test]
    fn comma_list() {
        assert!(cron_matches("0 9,17 * * *", &at(2026, 7, 26, 17, 0)).unwrap());
        assert!(!cron_matches("0 9,17 * * *", &at(2026, 7, 26, 12, 0)).unwrap());
    }

    #[test]
    fn wrong_field_count_errors() {
        assert!(cron_matches("* * * *", &at(2026, 7, 26, 0, 0)).is_err());
    }
}
