//! Hot-path timestamp normalization.
//!
//! Sensor readings arrive with timestamps in several textual layouts depending on
//! the BMC firmware that produced them. Rather than running a general-purpose date
//! parser per reading, the text is split into number, word and separator runs and
//! the layout is recognised from the token shape.
//!
//! Verified layouts:
//!
//! ```text
//! Fri Sep 14 13:03:43 2018
//! 07/13/2021 18:26:36
//! 12/04/2020 07:47:08 PM UTC
//! 12/14/2020 - 07:26:13 AM CST
//! 12/14/20 14:05:45 CST
//! 12/14/20 04:05:45 AM CST
//! 2020-10-26T14:29:24Z
//! 2020-10-26T14:29:24
//! 2021-07-26T14:25:56.495+0000
//! 2021-12-15T21:25:41+00:00
//! 2020-02-29T00:00:00.999999999Z
//! ```

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// No supported layout produces more than this many tokens.
const MAX_FIELDS: usize = 15;
/// Longest run of digits and decimal points accepted as a single number.
const MAX_NUMBER_LEN: usize = 12;

const LOCALTIME_PATH: &str = "/etc/localtime";
const ZONEINFO_DIR: &str = "/usr/share/zoneinfo";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("Unknown time format: {0}")]
    Malformed(String),

    #[error("Unknown month name: {0}")]
    UnknownMonth(String),

    #[error("Unsupported timezone: {0}")]
    UnsupportedTimezone(String),

    #[error("Time value out of range: {0}")]
    OutOfRange(String),
}

/// A named zone with its offset east of UTC in seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneName {
    pub name: String,
    pub offset_secs: i32,
}

/// Names of the process-local standard and daylight zones.
///
/// Only these names (plus UTC/GMT) are accepted as textual zones; any other name
/// would need a full timezone database to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalZone {
    pub standard: Option<ZoneName>,
    pub daylight: Option<ZoneName>,
}

impl LocalZone {
    /// Resolve the local zone names from an explicit POSIX descriptor, then the
    /// `TZ` environment variable, then the compiled zone file the system clock uses.
    pub fn from_env(descriptor: Option<&str>) -> Self {
        let tz = std::env::var("TZ").ok();
        descriptor
            .and_then(Self::from_posix)
            .or_else(|| tz.as_deref().and_then(Self::from_posix))
            .or_else(|| Self::from_system(tz.as_deref()))
            .unwrap_or_default()
    }

    /// Names from the zone file selected by an IANA `TZ` value, or `/etc/localtime`
    fn from_system(tz: Option<&str>) -> Option<Self> {
        let path = match tz.map(|tz| tz.trim_start_matches(':')) {
            Some(name) if name.starts_with('/') => PathBuf::from(name),
            Some(name) if !name.is_empty() => Path::new(ZONEINFO_DIR).join(name),
            _ => PathBuf::from(LOCALTIME_PATH),
        };
        let bytes = std::fs::read(&path).ok()?;
        Self::from_tzif(&bytes)
    }

    /// Parse the POSIX descriptor footer that version 2+ TZif files end with.
    pub fn from_tzif(bytes: &[u8]) -> Option<Self> {
        if !bytes.starts_with(b"TZif") || bytes.get(4).map_or(true, |version| *version < b'2') {
            return None;
        }
        let body = bytes.strip_suffix(b"\n")?;
        let start = body.iter().rposition(|b| *b == b'\n')? + 1;
        let footer = std::str::from_utf8(&body[start..]).ok()?;
        Self::from_posix(footer)
    }

    /// Parse a POSIX `TZ` descriptor such as `CST6CDT` or `EST5EDT,M3.2.0,M11.1.0`.
    ///
    /// Returns `None` for IANA names (`America/Chicago`) which carry no abbreviations.
    pub fn from_posix(descriptor: &str) -> Option<Self> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() || descriptor.starts_with(':') {
            return None;
        }
        // Transition rules are irrelevant for name lookup.
        let descriptor = descriptor.split(',').next()?;

        let (std_name, rest) = take_zone_name(descriptor)?;
        let (std_west, rest) = take_posix_offset(rest)?;
        let standard = ZoneName {
            name: std_name.to_string(),
            offset_secs: -std_west,
        };

        if rest.is_empty() {
            return Some(Self {
                standard: Some(standard),
                daylight: None,
            });
        }

        let (dst_name, rest) = take_zone_name(rest)?;
        let dst_east = if rest.is_empty() {
            standard.offset_secs + 3600
        } else {
            let (dst_west, rest) = take_posix_offset(rest)?;
            if !rest.is_empty() {
                return None;
            }
            -dst_west
        };

        Some(Self {
            standard: Some(standard),
            daylight: Some(ZoneName {
                name: dst_name.to_string(),
                offset_secs: dst_east,
            }),
        })
    }

    /// Offset east of UTC in seconds for a zone name, if known.
    pub fn offset_for(&self, name: &str) -> Option<i32> {
        if name.eq_ignore_ascii_case("utc") || name.eq_ignore_ascii_case("gmt") {
            return Some(0);
        }
        [&self.standard, &self.daylight]
            .into_iter()
            .flatten()
            .find(|zone| zone.name == name)
            .map(|zone| zone.offset_secs)
    }
}

fn take_zone_name(s: &str) -> Option<(&str, &str)> {
    if let Some(quoted) = s.strip_prefix('<') {
        let end = quoted.find('>')?;
        return Some((&quoted[..end], &quoted[end + 1..]));
    }
    let end = s
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    if end < 3 {
        return None;
    }
    Some((&s[..end], &s[end..]))
}

/// Parse `[+-]hh[:mm[:ss]]`, returning seconds west of UTC as POSIX defines it.
fn take_posix_offset(s: &str) -> Option<(i32, &str)> {
    let (sign, s) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => (1, s),
    };
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == ':'))
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }

    let mut seconds = 0;
    let mut scale = 3600;
    for part in s[..end].split(':') {
        if scale == 0 {
            return None;
        }
        let part = part.parse::<i32>().ok()?.checked_mul(scale)?;
        seconds = part.checked_add(seconds)?;
        scale /= 60;
    }
    // POSIX allows at most 24:59:59
    if seconds > 25 * 3600 {
        return None;
    }
    Some((sign * seconds, &s[end..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Number,
    Word,
    Separator,
}

/// Fixed-capacity token list; avoids allocating per reading.
struct Fields<'a> {
    items: [&'a str; MAX_FIELDS],
    kinds: [Kind; MAX_FIELDS],
    ends: [usize; MAX_FIELDS],
    len: usize,
}

impl<'a> Fields<'a> {
    fn tokenize(text: &'a str) -> Result<Self, TimestampError> {
        let malformed = || TimestampError::Malformed(text.to_string());
        let bytes = text.as_bytes();
        let mut fields = Fields {
            items: [""; MAX_FIELDS],
            kinds: [Kind::Separator; MAX_FIELDS],
            ends: [0; MAX_FIELDS],
            len: 0,
        };

        let mut i = 0;
        while i < bytes.len() {
            let start = i;
            let b = bytes[i];
            if b.is_ascii_digit() || b == b'.' {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if i - start > MAX_NUMBER_LEN {
                    return Err(malformed());
                }
                fields.push(text, start, i, Kind::Number).ok_or_else(malformed)?;
            } else if b.is_ascii_alphabetic() {
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                match i - start {
                    // A lone date/zone designator acts as a separator
                    1 if b == b'T' || b == b'Z' => {
                        fields.push(text, start, i, Kind::Separator).ok_or_else(malformed)?
                    }
                    2 | 3 => fields.push(text, start, i, Kind::Word).ok_or_else(malformed)?,
                    _ => return Err(malformed()),
                }
            } else if is_separator(b) {
                while i < bytes.len() && is_separator(bytes[i]) {
                    i += 1;
                }
                fields.push(text, start, i, Kind::Separator).ok_or_else(malformed)?;
            } else {
                return Err(malformed());
            }
        }

        Ok(fields)
    }

    fn push(&mut self, text: &'a str, start: usize, end: usize, kind: Kind) -> Option<()> {
        // Adjacent separator runs merge into one token
        if kind == Kind::Separator && self.len > 0 {
            let last = self.len - 1;
            if self.kinds[last] == Kind::Separator && self.ends[last] == start {
                let begin = self.ends[last] - self.items[last].len();
                self.items[last] = &text[begin..end];
                self.ends[last] = end;
                return Some(());
            }
        }
        if self.len == MAX_FIELDS {
            return None;
        }
        self.items[self.len] = &text[start..end];
        self.kinds[self.len] = kind;
        self.ends[self.len] = end;
        self.len += 1;
        Some(())
    }

    fn get(&self, index: usize) -> &'a str {
        self.items[index]
    }
}

fn is_separator(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'/' | b'-' | b':' | b'+')
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(month)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateForm {
    Weekday,
    Iso,
    Us,
}

enum Zone {
    Local,
    /// Seconds east of UTC
    Fixed(i32),
}

/// Converts textual timestamps into milliseconds since the Unix epoch
#[derive(Debug, Clone, Default)]
pub struct TimestampParser {
    zone: LocalZone,
    fail_soft: bool,
}

impl TimestampParser {
    pub fn new(zone: LocalZone, fail_soft: bool) -> Self {
        Self { zone, fail_soft }
    }

    pub fn is_fail_soft(&self) -> bool {
        self.fail_soft
    }

    /// Parse honouring the configured failure mode: in fail-soft mode an
    /// unparseable timestamp becomes the current wall-clock time.
    pub fn epoch_ms(&self, text: &str) -> Result<i64, TimestampError> {
        match self.parse_epoch_ms(text) {
            Err(_) if self.fail_soft => Ok(Utc::now().timestamp_millis()),
            result => result,
        }
    }

    pub fn parse_epoch_ms(&self, text: &str) -> Result<i64, TimestampError> {
        let malformed = || TimestampError::Malformed(text.to_string());
        let fields = Fields::tokenize(text)?;
        if fields.len < 11 || fields.get(7) != ":" {
            return Err(malformed());
        }

        let form = match fields.get(1) {
            " " => DateForm::Weekday,
            "-" => DateForm::Iso,
            "/" => DateForm::Us,
            _ => return Err(malformed()),
        };

        let (year, month, day) = match form {
            DateForm::Weekday => {
                if fields.len != 13 {
                    return Err(malformed());
                }
                let month = month_number(fields.get(2))
                    .ok_or_else(|| TimestampError::UnknownMonth(fields.get(2).to_string()))?;
                (fields.get(12), month, number(fields.get(4), text)?)
            }
            DateForm::Iso => (
                fields.get(0),
                number(fields.get(2), text)?,
                number(fields.get(4), text)?,
            ),
            DateForm::Us => (
                fields.get(4),
                number(fields.get(0), text)?,
                number(fields.get(2), text)?,
            ),
        };
        let year = match year.len() {
            2 => 2000 + number(year, text)?,
            _ => number(year, text)?,
        };

        let mut hour = number(fields.get(6), text)?;
        let minute = number(fields.get(8), text)?;
        let (second, millis) = seconds(fields.get(10), text)?;

        let zone = match fields.len {
            11 => Zone::Local,
            12 => {
                if !fields.get(11).eq_ignore_ascii_case("z") {
                    return Err(malformed());
                }
                Zone::Fixed(0)
            }
            13 if form == DateForm::Weekday => Zone::Local,
            13 => match sign(fields.get(11)) {
                Some(sign) => {
                    let compact = fields.get(12);
                    if !(3..=4).contains(&compact.len()) || fields.kinds[12] != Kind::Number {
                        return Err(malformed());
                    }
                    let (hours, minutes) = compact.split_at(compact.len() - 2);
                    Zone::Fixed(sign * offset_secs(hours, minutes, text)?)
                }
                None => Zone::Fixed(self.named_offset(fields.get(12))?),
            },
            15 => match sign(fields.get(11)) {
                Some(sign) => {
                    if fields.get(13) != ":" {
                        return Err(malformed());
                    }
                    Zone::Fixed(sign * offset_secs(fields.get(12), fields.get(14), text)?)
                }
                None => {
                    let marker = fields.get(12);
                    if marker.eq_ignore_ascii_case("pm") {
                        if hour < 12 {
                            hour += 12;
                        }
                    } else if marker.eq_ignore_ascii_case("am") {
                        if hour == 12 {
                            hour = 0;
                        }
                    } else {
                        return Err(malformed());
                    }
                    Zone::Fixed(self.named_offset(fields.get(14))?)
                }
            },
            _ => return Err(malformed()),
        };

        let out_of_range = || TimestampError::OutOfRange(text.to_string());
        let date = NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(out_of_range)?;
        let time = NaiveTime::from_hms_milli_opt(hour, minute, second, millis).ok_or_else(out_of_range)?;
        let naive = NaiveDateTime::new(date, time);

        match zone {
            Zone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.timestamp_millis())
                .ok_or_else(out_of_range),
            Zone::Fixed(east) => Ok(naive.and_utc().timestamp_millis() - i64::from(east) * 1000),
        }
    }

    fn named_offset(&self, name: &str) -> Result<i32, TimestampError> {
        self.zone
            .offset_for(name)
            .ok_or_else(|| TimestampError::UnsupportedTimezone(name.to_string()))
    }
}

fn sign(token: &str) -> Option<i32> {
    match token {
        "+" => Some(1),
        "-" => Some(-1),
        _ => None,
    }
}

fn number(token: &str, text: &str) -> Result<u32, TimestampError> {
    token
        .parse()
        .map_err(|_| TimestampError::Malformed(text.to_string()))
}

/// Seconds for a numeric `HH[:]MM` offset. Offsets beyond a day are rejected.
fn offset_secs(hours: &str, minutes: &str, text: &str) -> Result<i32, TimestampError> {
    let hours = number(hours, text)?;
    let minutes = number(minutes, text)?;
    if hours > 23 || minutes > 59 {
        return Err(TimestampError::OutOfRange(text.to_string()));
    }
    Ok((hours * 3600 + minutes * 60) as i32)
}

/// Split `SS[.fff...]` into whole seconds and truncated milliseconds.
fn seconds(token: &str, text: &str) -> Result<(u32, u32), TimestampError> {
    let (whole, fraction) = token.split_once('.').unwrap_or((token, ""));
    let whole = number(whole, text)?;
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimestampError::Malformed(text.to_string()));
    }
    let millis = fraction
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(3)
        .fold(0, |acc, digit| acc * 10 + u32::from(digit - b'0'));
    Ok((whole, millis))
}
