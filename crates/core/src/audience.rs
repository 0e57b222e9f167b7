//! Audience shaping: timezone buckets, localized send times and control groups.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::{DomainError, DomainResult};
use crate::job::PastTimeStrategy;
use crate::user::User;

/// Group users by timezone, keyed by tz string.
pub fn bucket_by_tz(users: Vec<User>) -> BTreeMap<String, Vec<User>> {
    let mut buckets: BTreeMap<String, Vec<User>> = BTreeMap::new();
    for user in users {
        buckets
            .entry(user.tz_or_default().to_string())
            .or_default()
            .push(user);
    }
    buckets
}

/// Parse a `+HHMM`, `-HH:MM` or `HH` style offset.
pub fn parse_tz_offset(tz: &str) -> DomainResult<FixedOffset> {
    let invalid = || DomainError::validation(format!("invalid timezone offset '{tz}'"));
    let (sign, digits) = match tz.as_bytes().first() {
        Some(b'-') => (-1, &tz[1..]),
        Some(b'+') => (1, &tz[1..]),
        Some(_) => (1, tz),
        None => return Err(invalid()),
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>().map_err(|_| invalid())?, 0)
    } else {
        let split = digits.len() - 2;
        (
            digits[..split].parse::<i32>().map_err(|_| invalid())?,
            digits[split..].parse::<i32>().map_err(|_| invalid())?,
        )
    };
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// When a localized bucket should be sent.
///
/// `starts_at_nanos` encodes the local wall-clock time, so the instant for a
/// given offset is `starts_at - offset`. Returns `None` when the instant has
/// passed and the strategy is [`PastTimeStrategy::Skip`].
pub fn localized_send_at(
    starts_at_nanos: i64,
    tz: &str,
    strategy: PastTimeStrategy,
    now: DateTime<Utc>,
) -> DomainResult<Option<DateTime<Utc>>> {
    let offset = parse_tz_offset(tz)?;
    let wall = Utc.timestamp_nanos(starts_at_nanos);
    let at = wall - Duration::seconds(i64::from(offset.local_minus_utc()));
    if at >= now {
        return Ok(Some(at));
    }
    match strategy {
        PastTimeStrategy::Skip => Ok(None),
        PastTimeStrategy::NextDay => Ok(Some(at + Duration::hours(24))),
    }
}

/// Number of users withheld for a control group of `ratio`.
pub fn control_group_size(len: usize, ratio: f64) -> usize {
    if ratio <= 0.0 || len == 0 {
        return 0;
    }
    (len as f64 * ratio).ceil() as usize
}

/// Control-group users owed by a slice of `len` users that starts `offset`
/// users into a larger audience.
///
/// Consecutive slices add up to `control_group_size` of the whole audience,
/// whatever their sizes.
pub fn control_group_share(offset: usize, len: usize, ratio: f64) -> usize {
    let upto = control_group_size(offset + len, ratio);
    upto.saturating_sub(control_group_size(offset, ratio)).min(len)
}

/// Remove and return `size` random users, or all of them when fewer.
pub fn withhold<T, R: Rng + ?Sized>(users: &mut Vec<T>, size: usize, rng: &mut R) -> Vec<T> {
    if size == 0 {
        return Vec::new();
    }
    users.shuffle(rng);
    let keep = users.len().saturating_sub(size);
    users.split_off(keep)
}

/// Withhold a random control group from one slice of an audience whose total
/// size is unknown.
///
/// Shuffles `users` in place (Fisher-Yates), then removes and returns the last
/// `ceil(len * ratio)` of them, always keeping at least one user so slices too
/// small to split are sent in full. Works on token rows as well as bare ids.
pub fn extract_slice_control_group<T, R: Rng + ?Sized>(users: &mut Vec<T>, ratio: f64, rng: &mut R) -> Vec<T> {
    let size = control_group_size(users.len(), ratio).min(users.len().saturating_sub(1));
    withhold(users, size, rng)
}

/// The control group of an audience of `len` users must leave someone to send to.
pub fn check_control_group(size: usize, len: usize) -> DomainResult<()> {
    if size > 0 && size >= len {
        return Err(DomainError::invariant(format!(
            "control group size {size} must be lower than the number of users {len}"
        )));
    }
    Ok(())
}
