//! Tests for the cron engine

use crate::cron::{estimate_interval_minutes, next_after, validate_expression};
use chrono::{TimeZone, Utc};

fn ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
        .single()
        .unwrap()
        .timestamp_millis()
}

#[test]
fn test_validate_accepts_standard_forms() {
    assert!(validate_expression("* * * * *").is_ok());
    assert!(validate_expression("*/5 * * * *").is_ok());
    assert!(validate_expression("0 9-17 * * 1-5").is_ok());
    assert!(validate_expression("15,45 */2 1 * *").is_ok());
    assert!(validate_expression("0 0 1 1 *").is_ok());
}

#[test]
fn test_validate_rejects_wrong_field_count() {
    assert!(validate_expression("* * * *").is_err());
    assert!(validate_expression("0 * * * * *").is_err());
    assert!(validate_expression("").is_err());
}

#[test]
fn test_validate_rejects_garbage() {
    assert!(validate_expression("every five minutes").is_err());
    assert!(validate_expression("61 * * * *").is_err());
}

#[test]
fn test_next_after_is_strictly_greater() {
    // An exact minute boundary must advance to the next match, not return
    // the boundary itself.
    let at_boundary = ms(2024, 6, 1, 12, 0, 0);
    let next = next_after("* * * * *", at_boundary).unwrap().unwrap();
    assert_eq!(next, ms(2024, 6, 1, 12, 1, 0));
}

#[test]
fn test_next_after_mid_minute() {
    let mid = ms(2024, 6, 1, 12, 0, 30);
    let next = next_after("* * * * *", mid).unwrap().unwrap();
    assert_eq!(next, ms(2024, 6, 1, 12, 1, 0));
}

#[test]
fn test_next_after_step_expression() {
    let t = ms(2024, 6, 1, 12, 3, 0);
    let next = next_after("*/15 * * * *", t).unwrap().unwrap();
    assert_eq!(next, ms(2024, 6, 1, 12, 15, 0));
}

#[test]
fn test_next_after_sparse_yearly() {
    // Yearly expressions must resolve without scanning minute-by-minute.
    let t = ms(2024, 3, 1, 0, 0, 0);
    let next = next_after("0 0 1 1 *", t).unwrap().unwrap();
    assert_eq!(next, ms(2025, 1, 1, 0, 0, 0));
}

#[test]
fn test_next_after_equivalent_forms_agree() {
    let t = ms(2024, 6, 1, 0, 7, 0);
    let a = next_after("*/10 * * * *", t).unwrap().unwrap();
    let b = next_after("0,10,20,30,40,50 * * * *", t).unwrap().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_interval_estimate_every_minute() {
    assert_eq!(estimate_interval_minutes("* * * * *").unwrap(), 1);
}

#[test]
fn test_interval_estimate_hourly() {
    assert_eq!(estimate_interval_minutes("0 * * * *").unwrap(), 60);
}

#[test]
fn test_interval_estimate_sub_hourly_detected() {
    let est = estimate_interval_minutes("*/15 * * * *").unwrap();
    assert!(est < 60, "15-minute cron should estimate sub-hourly: {}", est);
}

#[test]
fn test_interval_estimate_daily() {
    let est = estimate_interval_minutes("30 4 * * *").unwrap();
    assert_eq!(est, 24 * 60);
}
