//! Cron engine for task and monitor schedules
//!
//! Accepts standard five-field cron expressions (minute hour day-of-month
//! month day-of-week, with `*`, ranges, lists and `*/N` steps) and computes
//! the next matching instant after a given one. The underlying `cron` crate
//! works on six/seven-field expressions, so validated five-field input is
//! promoted with a literal seconds field before parsing.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Validate a five-field cron expression.
///
/// Rejects expressions that do not have exactly five whitespace-separated
/// fields (the six-field seconds form is a different dialect and is not
/// accepted from tenants) or that the parser cannot understand.
pub fn validate_expression(expr: &str) -> Result<()> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        anyhow::bail!(
            "Cron expression must have exactly 5 fields, got {}: '{}'",
            fields,
            expr
        );
    }
    parse(expr).map(|_| ())
}

/// Parse a five-field expression into a `Schedule`.
fn parse(expr: &str) -> Result<Schedule> {
    // Promote to the six-field form the parser expects: fire at second 0.
    let promoted = format!("0 {}", expr.trim());
    Schedule::from_str(&promoted).with_context(|| format!("Invalid cron expression: '{}'", expr))
}

/// Compute the smallest instant strictly greater than `after_ms` that
/// matches `expr`, as unix milliseconds.
///
/// Returns `None` only when the schedule has no future occurrence inside the
/// parser's horizon; sparse expressions such as a yearly `0 0 1 1 *` resolve
/// without scanning minute-by-minute.
pub fn next_after(expr: &str, after_ms: i64) -> Result<Option<i64>> {
    let schedule = parse(expr)?;
    let after = millis_to_datetime(after_ms)?;
    Ok(schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis()))
}

/// Estimate the interval between runs, in minutes.
///
/// Samples a handful of consecutive fires and returns the smallest gap;
/// the minimum (rather than the average) is what tier gating cares about,
/// since `0 */2 * * *` and `*/30 9 * * *` both contain sub-hourly gaps or
/// not depending on their tightest spacing.
pub fn estimate_interval_minutes(expr: &str) -> Result<i64> {
    let schedule = parse(expr)?;
    // A fixed reference keeps the estimate deterministic.
    let reference = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("fixed reference timestamp is valid");

    let fires: Vec<DateTime<Utc>> = schedule.after(&reference).take(5).collect();
    if fires.len() < 2 {
        // Effectively a one-shot; treat as a very long interval.
        return Ok(i64::MAX / 60_000);
    }

    let mut min_gap_ms = i64::MAX;
    for pair in fires.windows(2) {
        let gap = pair[1].timestamp_millis() - pair[0].timestamp_millis();
        if gap > 0 && gap < min_gap_ms {
            min_gap_ms = gap;
        }
    }

    Ok((min_gap_ms / 60_000).max(1))
}

/// Convert unix milliseconds to a `DateTime<Utc>`, rejecting out-of-range
/// values rather than panicking.
fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow::anyhow!("Timestamp out of range: {}", ms))
}
