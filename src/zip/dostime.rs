//! DOS date/time conversion.
//!
//! ZIP archives store modification times in the DOS format: local wall-clock
//! time at 2-second granularity. Interoperability requires two profiles for
//! picking the UTC offset:
//!
//! - [`TzProfile::DateLocal`] honors the local daylight-saving schedule *of
//!   the date being converted*, matching common unzip/jar tools.
//! - [`TzProfile::Frozen`] applies one fixed offset (usually the raw offset
//!   plus the current daylight-saving delta, captured once) regardless of
//!   the date, matching some desktop shells and archivers.
//!
//! The conversion functions are pure: the profile is passed explicitly and
//! values are plain numbers.

use chrono::{Datelike, FixedOffset, Local, NaiveDate, Offset, TimeZone, Timelike};

use super::ZipError;

/// Minimum representable DOS date/time: 1980-01-01 00:00:00.
pub const MIN_DOS_TIME: u32 = 0x0021 << 16;

const MIN_YEAR: i32 = 1980;
const MAX_YEAR: i32 = 2108; // exclusive

/// Timezone profile for DOS time conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TzProfile {
    /// Offset of the date being converted, DST included.
    DateLocal,
    /// One fixed offset for all dates.
    Frozen(FixedOffset),
}

impl TzProfile {
    /// A frozen profile capturing the current local offset.
    pub fn frozen_now() -> Self {
        TzProfile::Frozen(Local::now().offset().fix())
    }
}

/// Convert a combined DOS date/time (date in the high 16 bits) to Unix
/// milliseconds.
///
/// Out-of-range fields in sloppy archives are clamped to the nearest valid
/// calendar value rather than rejected.
pub fn dos_to_unix_millis(dos: u32, profile: TzProfile) -> i64 {
    let date = (dos >> 16) as u16;
    let time = (dos & 0xFFFF) as u16;

    let year = MIN_YEAR + ((date >> 9) & 0x7F) as i32;
    let month = (((date >> 5) & 0x0F) as u32).clamp(1, 12);
    let day = ((date & 0x1F) as u32).max(1);
    let hour = (((time >> 11) & 0x1F) as u32).min(23);
    let minute = (((time >> 5) & 0x3F) as u32).min(59);
    let second = (((time & 0x1F) * 2) as u32).min(58);

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| {
            // Day beyond the month's end; clamp to the last valid day.
            (1..day)
                .rev()
                .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
        })
        .unwrap_or(NaiveDate::from_ymd_opt(MIN_YEAR, 1, 1).unwrap())
        .and_hms_opt(hour, minute, second)
        .unwrap_or_else(|| {
            NaiveDate::from_ymd_opt(year, month, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        });

    match profile {
        TzProfile::DateLocal => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            // Wall-clock time inside a DST gap; fall back to UTC.
            .unwrap_or_else(|| naive.and_utc().timestamp_millis()),
        TzProfile::Frozen(offset) => offset
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| naive.and_utc().timestamp_millis()),
    }
}

/// Convert Unix milliseconds to a combined DOS date/time.
///
/// Dates before 1980-01-01 clamp up to [`MIN_DOS_TIME`]; dates at or after
/// 2108-01-01 are rejected.
pub fn unix_millis_to_dos(millis: i64, profile: TzProfile) -> Result<u32, ZipError> {
    let naive = match profile {
        TzProfile::DateLocal => match Local.timestamp_millis_opt(millis).single() {
            Some(dt) => dt.naive_local(),
            None => return Err(ZipError::TimestampOutOfRange),
        },
        TzProfile::Frozen(offset) => match offset.timestamp_millis_opt(millis).single() {
            Some(dt) => dt.naive_local(),
            None => return Err(ZipError::TimestampOutOfRange),
        },
    };

    let year = naive.year();
    if year < MIN_YEAR {
        return Ok(MIN_DOS_TIME);
    }
    if year >= MAX_YEAR {
        return Err(ZipError::TimestampOutOfRange);
    }

    let date = (((year - MIN_YEAR) as u32) << 9) | (naive.month() << 5) | naive.day();
    let time = (naive.hour() << 11) | (naive.minute() << 5) | (naive.second() / 2);
    Ok((date << 16) | time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> TzProfile {
        TzProfile::Frozen(FixedOffset::east_opt(0).unwrap())
    }

    #[test]
    fn round_trips_at_two_second_granularity() {
        // 2004-06-15 12:30:42 UTC
        let millis = NaiveDate::from_ymd_opt(2004, 6, 15)
            .unwrap()
            .and_hms_opt(12, 30, 42)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        let dos = unix_millis_to_dos(millis, utc()).unwrap();
        assert_eq!(dos_to_unix_millis(dos, utc()), millis);
    }

    #[test]
    fn odd_seconds_round_down() {
        let millis = NaiveDate::from_ymd_opt(2004, 6, 15)
            .unwrap()
            .and_hms_opt(12, 30, 43)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        let dos = unix_millis_to_dos(millis, utc()).unwrap();
        assert_eq!(dos_to_unix_millis(dos, utc()), millis - 1000);
    }

    #[test]
    fn pre_1980_clamps_to_minimum() {
        assert_eq!(unix_millis_to_dos(0, utc()).unwrap(), MIN_DOS_TIME);
        assert_eq!(unix_millis_to_dos(-86_400_000, utc()).unwrap(), MIN_DOS_TIME);
    }

    #[test]
    fn year_2108_is_rejected() {
        let millis = NaiveDate::from_ymd_opt(2108, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert!(matches!(
            unix_millis_to_dos(millis, utc()),
            Err(ZipError::TimestampOutOfRange)
        ));
        let last = millis - 2000;
        assert!(unix_millis_to_dos(last, utc()).is_ok());
    }

    #[test]
    fn minimum_decodes_to_1980() {
        let millis = dos_to_unix_millis(MIN_DOS_TIME, utc());
        let expect = NaiveDate::from_ymd_opt(1980, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        assert_eq!(millis, expect);
    }

    #[test]
    fn frozen_offset_shifts_wall_clock() {
        let east = TzProfile::Frozen(FixedOffset::east_opt(3600).unwrap());
        // 12:00 wall clock at +01:00 is 11:00 UTC.
        let dos = unix_millis_to_dos(
            NaiveDate::from_ymd_opt(2000, 1, 1)
                .unwrap()
                .and_hms_opt(11, 0, 0)
                .unwrap()
                .and_utc()
                .timestamp_millis(),
            east,
        )
        .unwrap();
        let time = dos & 0xFFFF;
        assert_eq!(time >> 11, 12); // hour field holds wall-clock noon
    }
}
