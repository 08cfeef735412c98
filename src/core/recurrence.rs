//! Recurrence rules for job scheduling.
//!
//! A rule is a frequency (`YEARLY` through `SECONDLY`) plus a compact
//! parameter string such as `interval:15` or `byweekday:MO,WE,FR;byhour:9`.
//! Rules compute the next occurrence strictly after a reference instant;
//! they never return the instant itself, which is what guarantees that a
//! job's `next_run` always advances.

use chrono::{
    DateTime, Datelike, Days, Duration, Months, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scan ceiling for filtered rules. Day-level skipping keeps real rules far
/// below this; hitting it means the rule can never fire again.
const MAX_SCAN_STEPS: u32 = 2_000_000;

/// Weekday mnemonics in rule parameters, Monday first.
const WEEKDAY_MNEMONICS: [&str; 7] = ["MO", "TU", "WE", "TH", "FR", "SA", "SU"];

/// Errors from parsing or evaluating recurrence rules.
#[derive(Debug, Error)]
pub enum RecurrenceError {
    /// The frequency name is not one of YEARLY..SECONDLY.
    #[error("unknown frequency: {0}")]
    UnknownFrequency(String),

    /// A parameter key is not recognized.
    #[error("unknown rule parameter: {0}")]
    UnknownParameter(String),

    /// A parameter value failed to parse or is out of range.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Parameter key.
        key: String,
        /// Offending value text.
        value: String,
    },

    /// The timezone name is not in the tz database.
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    /// `interval:0` would never advance.
    #[error("interval must be at least 1")]
    ZeroInterval,

    /// No occurrence exists after the reference instant.
    #[error("rule has no next occurrence")]
    NoNextOccurrence,

    /// The schedule description could not be translated into a rule.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Recurrence frequency, coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Frequency {
    Yearly,
    Monthly,
    Weekly,
    Daily,
    Hourly,
    Minutely,
    Secondly,
}

impl Frequency {
    /// All frequencies, for listings.
    pub fn all() -> [Frequency; 7] {
        [
            Frequency::Yearly,
            Frequency::Monthly,
            Frequency::Weekly,
            Frequency::Daily,
            Frequency::Hourly,
            Frequency::Minutely,
            Frequency::Secondly,
        ]
    }

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Yearly => "YEARLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Daily => "DAILY",
            Frequency::Hourly => "HOURLY",
            Frequency::Minutely => "MINUTELY",
            Frequency::Secondly => "SECONDLY",
        }
    }
}

impl FromStr for Frequency {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "YEARLY" => Ok(Frequency::Yearly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "WEEKLY" => Ok(Frequency::Weekly),
            "DAILY" => Ok(Frequency::Daily),
            "HOURLY" => Ok(Frequency::Hourly),
            "MINUTELY" => Ok(Frequency::Minutely),
            "SECONDLY" => Ok(Frequency::Secondly),
            other => Err(RecurrenceError::UnknownFrequency(other.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed recurrence rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    frequency: Frequency,
    interval: u32,
    by_weekday: Vec<u32>,
    by_month: Vec<u32>,
    by_month_day: Vec<u32>,
    by_hour: Vec<u32>,
    by_minute: Vec<u32>,
    by_second: Vec<u32>,
    timezone: Tz,
}

impl RecurrenceRule {
    /// Parse a rule from a frequency and a parameter string.
    ///
    /// The grammar is `key:value[,value...]` items joined by `;`. Blank items
    /// are skipped. Weekday mnemonics (`MO`..`SU`) are accepted wherever an
    /// integer is expected and map to 0..6 with Monday as 0. Unknown keys and
    /// malformed or out-of-range values are configuration errors.
    pub fn parse(frequency: Frequency, params: &str, timezone: Tz) -> Result<Self, RecurrenceError> {
        let mut rule = RecurrenceRule {
            frequency,
            interval: 1,
            by_weekday: Vec::new(),
            by_month: Vec::new(),
            by_month_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_second: Vec::new(),
            timezone,
        };

        for item in params.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, raw_values) = item
                .split_once(':')
                .ok_or_else(|| RecurrenceError::InvalidValue {
                    key: item.to_string(),
                    value: String::new(),
                })?;
            let key = key.trim().to_ascii_lowercase();
            let values = parse_values(&key, raw_values)?;

            match key.as_str() {
                "interval" => {
                    let v = single_value(&key, &values, raw_values)?;
                    if v == 0 {
                        return Err(RecurrenceError::ZeroInterval);
                    }
                    rule.interval = v;
                }
                "byweekday" => rule.by_weekday = bounded(&key, values, 0, 6)?,
                "byhour" => rule.by_hour = bounded(&key, values, 0, 23)?,
                "byminute" => rule.by_minute = bounded(&key, values, 0, 59)?,
                "bysecond" => rule.by_second = bounded(&key, values, 0, 59)?,
                "bymonth" => rule.by_month = bounded(&key, values, 1, 12)?,
                "bymonthday" => rule.by_month_day = bounded(&key, values, 1, 31)?,
                other => return Err(RecurrenceError::UnknownParameter(other.to_string())),
            }
        }

        Ok(rule)
    }

    /// Parse with frequency and timezone given as text.
    pub fn parse_str(
        frequency: &str,
        params: &str,
        timezone: &str,
    ) -> Result<Self, RecurrenceError> {
        let freq: Frequency = frequency.parse()?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| RecurrenceError::UnknownTimezone(timezone.to_string()))?;
        Self::parse(freq, params, tz)
    }

    /// The rule's frequency.
    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    /// The rule's interval (defaults to 1).
    pub fn interval(&self) -> u32 {
        self.interval
    }

    fn has_filters(&self) -> bool {
        !(self.by_weekday.is_empty()
            && self.by_month.is_empty()
            && self.by_month_day.is_empty()
            && self.by_hour.is_empty()
            && self.by_minute.is_empty()
            && self.by_second.is_empty())
    }

    /// First occurrence strictly after `after`, anchored at `dtstart`.
    ///
    /// The result is always later than `after`; equality never qualifies.
    pub fn next_after(
        &self,
        dtstart: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        let next = if self.has_filters() {
            self.next_by_scan(dtstart, after)?
        } else {
            self.next_by_arithmetic(dtstart, after)?
        };
        debug_assert!(next > after);
        Ok(next)
    }

    /// Pure-interval rules advance by direct calendar arithmetic.
    fn next_by_arithmetic(
        &self,
        dtstart: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        if dtstart > after {
            return Ok(dtstart);
        }
        match self.frequency {
            Frequency::Yearly | Frequency::Monthly => {
                let step = if self.frequency == Frequency::Yearly {
                    12 * self.interval as i64
                } else {
                    self.interval as i64
                };
                let elapsed = months_between(dtstart, after).max(0);
                let mut k = elapsed / step;
                loop {
                    let cand = dtstart
                        .checked_add_months(Months::new((k * step) as u32))
                        .ok_or(RecurrenceError::NoNextOccurrence)?;
                    if cand > after {
                        return Ok(cand);
                    }
                    k += 1;
                }
            }
            _ => {
                let step_secs = unit_seconds(self.frequency) * self.interval as i64;
                let elapsed = (after - dtstart).num_seconds();
                let mut periods = elapsed / step_secs;
                loop {
                    let cand = dtstart + Duration::seconds(step_secs * periods);
                    if cand > after {
                        return Ok(cand);
                    }
                    periods += 1;
                }
            }
        }
    }

    /// Filtered rules scan candidates at second resolution, skipping whole
    /// days and hours that cannot match so the step count stays bounded.
    fn next_by_scan(
        &self,
        dtstart: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        let dl = dtstart.with_timezone(&self.timezone);
        let mut cand = std::cmp::max(dtstart, after + Duration::seconds(1));
        if let Some(whole) = cand.with_nanosecond(0) {
            if whole > after {
                cand = whole;
            }
        }

        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > MAX_SCAN_STEPS {
                return Err(RecurrenceError::NoNextOccurrence);
            }

            let local = cand.with_timezone(&self.timezone);

            if !self.date_matches(&local, &dl) {
                let next_day = local
                    .date_naive()
                    .checked_add_days(Days::new(1))
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or(RecurrenceError::NoNextOccurrence)?;
                cand = self.advance_to(cand, next_day)?;
                continue;
            }
            if !self.hour_matches(local.hour(), dl.hour()) {
                let into_hour = (local.minute() * 60 + local.second()) as i64;
                cand += Duration::seconds(3600 - into_hour);
                continue;
            }
            if !self.minute_matches(local.minute(), dl.minute()) {
                cand += Duration::seconds(60 - local.second() as i64);
                continue;
            }
            if !self.second_matches(local.second(), dl.second()) {
                cand += Duration::seconds(1);
                continue;
            }
            if !self.period_matches(&local, &dl, cand, dtstart) {
                cand += Duration::seconds(1);
                continue;
            }
            return Ok(cand);
        }
    }

    /// Resolve a local wall time forward of `cand`, stepping over DST gaps.
    fn advance_to(
        &self,
        cand: DateTime<Utc>,
        naive: NaiveDateTime,
    ) -> Result<DateTime<Utc>, RecurrenceError> {
        let resolved = match self.timezone.from_local_datetime(&naive).earliest() {
            Some(dt) => dt.with_timezone(&Utc),
            None => self
                .timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(RecurrenceError::NoNextOccurrence)?,
        };
        if resolved > cand {
            Ok(resolved)
        } else {
            Ok(cand + Duration::hours(1))
        }
    }

    fn date_matches(&self, local: &DateTime<Tz>, dl: &DateTime<Tz>) -> bool {
        if !self.by_month.is_empty() {
            if !self.by_month.contains(&local.month()) {
                return false;
            }
        } else if self.frequency == Frequency::Yearly && local.month() != dl.month() {
            return false;
        }

        if !self.by_month_day.is_empty() {
            if !self.by_month_day.contains(&local.day()) {
                return false;
            }
        } else if matches!(self.frequency, Frequency::Yearly | Frequency::Monthly)
            && local.day() != dl.day()
        {
            return false;
        }

        if !self.by_weekday.is_empty() {
            if !self
                .by_weekday
                .contains(&local.weekday().num_days_from_monday())
            {
                return false;
            }
        } else if self.frequency == Frequency::Weekly && local.weekday() != dl.weekday() {
            return false;
        }

        true
    }

    fn hour_matches(&self, hour: u32, anchor: u32) -> bool {
        if !self.by_hour.is_empty() {
            self.by_hour.contains(&hour)
        } else if self.frequency < Frequency::Hourly {
            hour == anchor
        } else {
            true
        }
    }

    fn minute_matches(&self, minute: u32, anchor: u32) -> bool {
        if !self.by_minute.is_empty() {
            self.by_minute.contains(&minute)
        } else if self.frequency < Frequency::Minutely {
            minute == anchor
        } else {
            true
        }
    }

    fn second_matches(&self, second: u32, anchor: u32) -> bool {
        if !self.by_second.is_empty() {
            self.by_second.contains(&second)
        } else if self.frequency < Frequency::Secondly {
            second == anchor
        } else {
            true
        }
    }

    /// Interval membership: the candidate must fall in a period that is a
    /// whole multiple of `interval` away from the anchor.
    fn period_matches(
        &self,
        local: &DateTime<Tz>,
        dl: &DateTime<Tz>,
        cand: DateTime<Utc>,
        dtstart: DateTime<Utc>,
    ) -> bool {
        if self.interval <= 1 {
            return true;
        }
        let interval = self.interval as i64;
        let index = match self.frequency {
            Frequency::Yearly => (local.year() - dl.year()) as i64,
            Frequency::Monthly => {
                (local.year() as i64 - dl.year() as i64) * 12
                    + (local.month() as i64 - dl.month() as i64)
            }
            Frequency::Weekly => {
                let anchor_week_start = dl.date_naive()
                    - Duration::days(dl.weekday().num_days_from_monday() as i64);
                (local.date_naive() - anchor_week_start).num_days().div_euclid(7)
            }
            Frequency::Daily => (local.date_naive() - dl.date_naive()).num_days(),
            Frequency::Hourly => (cand - dtstart).num_seconds().div_euclid(3600),
            Frequency::Minutely => (cand - dtstart).num_seconds().div_euclid(60),
            Frequency::Secondly => (cand - dtstart).num_seconds(),
        };
        index.rem_euclid(interval) == 0
    }
}

fn unit_seconds(frequency: Frequency) -> i64 {
    match frequency {
        Frequency::Weekly => 7 * 86_400,
        Frequency::Daily => 86_400,
        Frequency::Hourly => 3_600,
        Frequency::Minutely => 60,
        Frequency::Secondly => 1,
        // month-based frequencies never take this path
        Frequency::Yearly | Frequency::Monthly => unreachable!(),
    }
}

fn months_between(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (b.year() as i64 - a.year() as i64) * 12 + (b.month() as i64 - a.month() as i64)
}

/// Parse a comma-separated value list; weekday mnemonics map to 0..6.
fn parse_values(key: &str, raw: &str) -> Result<Vec<u32>, RecurrenceError> {
    let mut out = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let value = if let Ok(n) = token.parse::<u32>() {
            n
        } else if let Some(pos) = WEEKDAY_MNEMONICS
            .iter()
            .position(|m| m.eq_ignore_ascii_case(token))
        {
            pos as u32
        } else {
            return Err(RecurrenceError::InvalidValue {
                key: key.to_string(),
                value: token.to_string(),
            });
        };
        if !out.contains(&value) {
            out.push(value);
        }
    }
    if out.is_empty() {
        return Err(RecurrenceError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        });
    }
    out.sort_unstable();
    Ok(out)
}

fn single_value(key: &str, values: &[u32], raw: &str) -> Result<u32, RecurrenceError> {
    if values.len() == 1 {
        Ok(values[0])
    } else {
        Err(RecurrenceError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }
}

fn bounded(key: &str, values: Vec<u32>, min: u32, max: u32) -> Result<Vec<u32>, RecurrenceError> {
    for &v in &values {
        if v < min || v > max {
            return Err(RecurrenceError::InvalidValue {
                key: key.to_string(),
                value: v.to_string(),
            });
        }
    }
    Ok(values)
}

/// Human-friendly schedule description, in the style of interval schedulers:
/// day-of-week and hour ranges plus an optional every-N-minutes cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HumanSchedule {
    /// Day names or ranges: `mon`, `mon-fri`, `mon,wed,fri`.
    pub day_of_week: Option<String>,
    /// Hour values or ranges: `7`, `2-7`, `16,21,23`.
    pub hour: Option<String>,
    /// Minute within the hour (defaults to 0).
    pub minute: Option<u32>,
    /// Run every N minutes instead of at fixed times.
    pub every_minutes: Option<u32>,
}

/// Result of translating a [`HumanSchedule`] into rule terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedSchedule {
    pub frequency: Frequency,
    /// Concrete first occurrence when the description pins one down.
    pub next_run: Option<DateTime<Utc>>,
    pub params: String,
}

/// Translate a human schedule description into a frequency, an optional
/// first occurrence, and a rule parameter string. Pure function: `now` is
/// the only clock input and no state is touched.
pub fn translate_human_schedule(
    schedule: &HumanSchedule,
    now: DateTime<Utc>,
) -> Result<TranslatedSchedule, RecurrenceError> {
    if let Some(minutes) = schedule.every_minutes {
        if minutes == 0 {
            return Err(RecurrenceError::InvalidSchedule(
                "every_minutes must be at least 1".into(),
            ));
        }
        return Ok(TranslatedSchedule {
            frequency: Frequency::Minutely,
            next_run: Some(now + Duration::minutes(minutes as i64)),
            params: format!("interval:{}", minutes),
        });
    }

    let minute = schedule.minute.unwrap_or(0);
    if minute > 59 {
        return Err(RecurrenceError::InvalidSchedule(format!(
            "minute out of range: {}",
            minute
        )));
    }
    let hours = match &schedule.hour {
        Some(spec) => expand_hour_range(spec)?,
        None => vec![0],
    };

    if let Some(days) = &schedule.day_of_week {
        let mnemonics = expand_day_range(days)?;
        let hour_list = hours
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(",");
        return Ok(TranslatedSchedule {
            // hourly with day/hour filters, so a mid-week edit to the day
            // list takes effect within the week
            frequency: Frequency::Hourly,
            next_run: None,
            params: format!(
                "byweekday:{};byhour:{};byminute:{}",
                mnemonics.join(","),
                hour_list,
                minute
            ),
        });
    }

    if hours.len() == 1 {
        // A single daily time pins down the first occurrence exactly.
        let hour = hours[0];
        let today = now
            .date_naive()
            .and_hms_opt(hour, minute, 0)
            .ok_or_else(|| {
                RecurrenceError::InvalidSchedule(format!("hour out of range: {}", hour))
            })?;
        let today = Utc.from_utc_datetime(&today);
        let next_run = if today > now {
            today
        } else {
            today + Duration::days(1)
        };
        return Ok(TranslatedSchedule {
            frequency: Frequency::Daily,
            next_run: Some(next_run),
            params: format!("byhour:{};byminute:{}", hour, minute),
        });
    }

    let hour_list = hours
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Ok(TranslatedSchedule {
        frequency: Frequency::Daily,
        next_run: None,
        params: format!("byhour:{};byminute:{}", hour_list, minute),
    })
}

const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

fn day_index(name: &str) -> Result<usize, RecurrenceError> {
    DAY_NAMES
        .iter()
        .position(|d| d.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| RecurrenceError::InvalidSchedule(format!("unknown day: {}", name)))
}

/// Expand `mon-fri` / `mon,wed` / `sat` into weekday mnemonics. Ranges may
/// wrap around the end of the week (`sat-mon`).
fn expand_day_range(spec: &str) -> Result<Vec<&'static str>, RecurrenceError> {
    let spec = spec.trim();
    if let Some((start, end)) = spec.split_once('-') {
        let start = day_index(start)?;
        let end = day_index(end)?;
        let mut days = Vec::new();
        let mut i = start;
        loop {
            days.push(WEEKDAY_MNEMONICS[i]);
            if i == end {
                break;
            }
            i = (i + 1) % 7;
        }
        return Ok(days);
    }
    spec.split(',')
        .map(|name| day_index(name).map(|i| WEEKDAY_MNEMONICS[i]))
        .collect()
}

/// Expand `2-7` / `16,21,23` / `5` into hour values.
fn expand_hour_range(spec: &str) -> Result<Vec<u32>, RecurrenceError> {
    let parse_hour = |s: &str| -> Result<u32, RecurrenceError> {
        let h: u32 = s
            .trim()
            .parse()
            .map_err(|_| RecurrenceError::InvalidSchedule(format!("bad hour: {}", s)))?;
        if h > 23 {
            return Err(RecurrenceError::InvalidSchedule(format!(
                "hour out of range: {}",
                h
            )));
        }
        Ok(h)
    };

    let spec = spec.trim();
    if let Some((start, end)) = spec.split_once('-') {
        let start = parse_hour(start)?;
        let end = parse_hour(end)?;
        if start > end {
            return Err(RecurrenceError::InvalidSchedule(format!(
                "descending hour range: {}",
                spec
            )));
        }
        return Ok((start..=end).collect());
    }
    spec.split(',').map(parse_hour).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn rule(freq: Frequency, params: &str) -> RecurrenceRule {
        RecurrenceRule::parse(freq, params, Tz::UTC).unwrap()
    }

    #[test]
    fn test_parse_weekday_mnemonics() {
        let r = rule(Frequency::Weekly, "byweekday:MO,WE,FR");
        assert_eq!(r.by_weekday, vec![0, 2, 4]);
    }

    #[test]
    fn test_parse_mixed_numeric_and_mnemonic() {
        let r = rule(Frequency::Weekly, "byweekday:SU,1");
        assert_eq!(r.by_weekday, vec![1, 6]);
    }

    #[test]
    fn test_parse_skips_blank_items() {
        let r = rule(Frequency::Daily, "byhour:9;;byminute:30;");
        assert_eq!(r.by_hour, vec![9]);
        assert_eq!(r.by_minute, vec![30]);
    }

    #[test]
    fn test_parse_unknown_key_is_error() {
        let err = RecurrenceRule::parse(Frequency::Daily, "byfoo:1", Tz::UTC).unwrap_err();
        assert!(matches!(err, RecurrenceError::UnknownParameter(_)));
    }

    #[test]
    fn test_parse_out_of_range_value_is_error() {
        let err = RecurrenceRule::parse(Frequency::Daily, "byhour:24", Tz::UTC).unwrap_err();
        assert!(matches!(err, RecurrenceError::InvalidValue { .. }));
    }

    #[test]
    fn test_parse_zero_interval_is_error() {
        let err = RecurrenceRule::parse(Frequency::Minutely, "interval:0", Tz::UTC).unwrap_err();
        assert!(matches!(err, RecurrenceError::ZeroInterval));
    }

    #[test]
    fn test_parse_bad_frequency_name() {
        assert!(matches!(
            "FORTNIGHTLY".parse::<Frequency>(),
            Err(RecurrenceError::UnknownFrequency(_))
        ));
    }

    #[test]
    fn test_daily_interval_advances_strictly() {
        let r = rule(Frequency::Daily, "");
        let start = utc(2024, 3, 1, 9, 0, 0);
        // exactly on an occurrence: next must be the following one
        let next = r.next_after(start, start).unwrap();
        assert_eq!(next, utc(2024, 3, 2, 9, 0, 0));
    }

    #[test]
    fn test_minutely_interval_15() {
        let r = rule(Frequency::Minutely, "interval:15");
        let start = utc(2024, 3, 1, 9, 0, 0);
        let next = r.next_after(start, utc(2024, 3, 1, 9, 20, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 9, 30, 0));
    }

    #[test]
    fn test_dtstart_in_future_is_first_occurrence() {
        let r = rule(Frequency::Hourly, "");
        let start = utc(2024, 6, 1, 0, 0, 0);
        let next = r.next_after(start, utc(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, start);
    }

    #[test]
    fn test_monthly_clamps_short_months() {
        let r = rule(Frequency::Monthly, "");
        let start = utc(2024, 1, 31, 12, 0, 0);
        let next = r.next_after(start, start).unwrap();
        // February has no 31st; chrono clamps to the last day
        assert_eq!(next, utc(2024, 2, 29, 12, 0, 0));
    }

    #[test]
    fn test_yearly_advances() {
        let r = rule(Frequency::Yearly, "");
        let start = utc(2020, 7, 4, 6, 0, 0);
        let next = r.next_after(start, utc(2024, 7, 4, 6, 0, 0)).unwrap();
        assert_eq!(next, utc(2025, 7, 4, 6, 0, 0));
    }

    #[test]
    fn test_weekly_byweekday_picks_next_matching_day() {
        let r = rule(Frequency::Weekly, "byweekday:MO,FR;byhour:8;byminute:0");
        let start = utc(2024, 1, 1, 8, 0, 0); // a Monday
        // Wednesday afternoon: next match is Friday 08:00
        let next = r.next_after(start, utc(2024, 1, 3, 15, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 5, 8, 0, 0));
        assert_eq!(next.weekday().num_days_from_monday(), 4);
    }

    #[test]
    fn test_daily_byhour_list() {
        let r = rule(Frequency::Daily, "byhour:7,8,9;byminute:30");
        let start = utc(2024, 3, 1, 0, 0, 0);
        let next = r.next_after(start, utc(2024, 3, 1, 8, 30, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 9, 30, 0));
        let next = r.next_after(start, next).unwrap();
        assert_eq!(next, utc(2024, 3, 2, 7, 30, 0));
    }

    #[test]
    fn test_filtered_second_defaults_to_anchor() {
        let r = rule(Frequency::Daily, "byhour:6;byminute:15");
        let start = utc(2024, 3, 1, 0, 0, 42);
        let next = r.next_after(start, start).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 6, 15, 42));
    }

    #[test]
    fn test_yearly_bymonth_bymonthday() {
        let r = rule(Frequency::Yearly, "bymonth:12;bymonthday:25;byhour:0;byminute:0");
        let start = utc(2024, 1, 1, 0, 0, 0);
        let next = r.next_after(start, utc(2024, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 12, 25, 0, 0, 0));
    }

    #[test]
    fn test_bymonthday_30_skips_february() {
        let r = rule(Frequency::Monthly, "bymonthday:30;byhour:1;byminute:0");
        let start = utc(2024, 1, 1, 0, 0, 0);
        let next = r.next_after(start, utc(2024, 1, 31, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 30, 1, 0, 0));
    }

    #[test]
    fn test_filters_respect_rule_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let r = RecurrenceRule::parse(Frequency::Daily, "byhour:9;byminute:0", tz).unwrap();
        let start = utc(2024, 1, 1, 0, 0, 0);
        let next = r.next_after(start, utc(2024, 1, 10, 0, 0, 0)).unwrap();
        // 09:00 Eastern standard time is 14:00 UTC
        assert_eq!(next, utc(2024, 1, 10, 14, 0, 0));
    }

    #[test]
    fn test_result_is_strictly_after_argument() {
        let r = rule(Frequency::Hourly, "byminute:0");
        let start = utc(2024, 3, 1, 0, 0, 0);
        let mut at = start;
        for _ in 0..5 {
            let next = r.next_after(start, at).unwrap();
            assert!(next > at);
            at = next;
        }
        assert_eq!(at, utc(2024, 3, 1, 5, 0, 0));
    }

    #[test]
    fn test_translate_every_minutes() {
        let now = utc(2024, 3, 1, 10, 0, 0);
        let t = translate_human_schedule(
            &HumanSchedule {
                every_minutes: Some(20),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(t.frequency, Frequency::Minutely);
        assert_eq!(t.params, "interval:20");
        assert_eq!(t.next_run, Some(utc(2024, 3, 1, 10, 20, 0)));
    }

    #[test]
    fn test_translate_daily_hour_before_now_rolls_to_tomorrow() {
        let now = utc(2024, 3, 1, 10, 0, 0);
        let t = translate_human_schedule(
            &HumanSchedule {
                hour: Some("7".into()),
                minute: Some(30),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(t.frequency, Frequency::Daily);
        assert_eq!(t.next_run, Some(utc(2024, 3, 2, 7, 30, 0)));
        assert_eq!(t.params, "byhour:7;byminute:30");
    }

    #[test]
    fn test_translate_day_range() {
        let now = utc(2024, 3, 1, 10, 0, 0);
        let t = translate_human_schedule(
            &HumanSchedule {
                day_of_week: Some("mon-fri".into()),
                hour: Some("2-4".into()),
                minute: Some(0),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(t.frequency, Frequency::Hourly);
        assert_eq!(t.next_run, None);
        assert_eq!(t.params, "byweekday:MO,TU,WE,TH,FR;byhour:2,3,4;byminute:0");

        // the filters, not the base frequency, pin the slots
        let rule = RecurrenceRule::parse(t.frequency, &t.params, Tz::UTC).unwrap();
        let next = rule.next_after(now, now).unwrap();
        assert_eq!(next, utc(2024, 3, 4, 2, 0, 0)); // Monday 02:00
    }

    #[test]
    fn test_translate_wrapping_day_range() {
        assert_eq!(expand_day_range("sat-mon").unwrap(), vec!["SA", "SU", "MO"]);
    }

    #[test]
    fn test_translate_hour_list() {
        let now = utc(2024, 3, 1, 10, 0, 0);
        let t = translate_human_schedule(
            &HumanSchedule {
                hour: Some("16,21,23".into()),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        assert_eq!(t.frequency, Frequency::Daily);
        assert_eq!(t.next_run, None);
        assert_eq!(t.params, "byhour:16,21,23;byminute:0");
    }

    #[test]
    fn test_translate_rejects_unknown_day() {
        let err = translate_human_schedule(
            &HumanSchedule {
                day_of_week: Some("funday".into()),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, RecurrenceError::InvalidSchedule(_)));
    }
}
