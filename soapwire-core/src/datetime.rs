//! xsd date/time text forms.
//!
//! `xsd:dateTime` keeps an optional UTC offset: the wire form carries one
//! only when the producer knew it, and we must reproduce exactly what we
//! parsed. Milliseconds are written only when non-zero.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::error::DecodeError;

/// An `xsd:dateTime`: a naive timestamp plus an optional known offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XsdDateTime {
    naive: NaiveDateTime,
    offset: Option<FixedOffset>,
}

impl XsdDateTime {
    pub fn new(naive: NaiveDateTime) -> Self {
        XsdDateTime { naive, offset: None }
    }

    pub fn with_offset(naive: NaiveDateTime, offset: FixedOffset) -> Self {
        XsdDateTime {
            naive,
            offset: Some(offset),
        }
    }

    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        let dt = DateTime::<Utc>::from_timestamp_millis(millis)?;
        Some(XsdDateTime {
            naive: dt.naive_utc(),
            offset: FixedOffset::east_opt(0),
        })
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.naive
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        self.offset
    }

    /// Seconds since the epoch, interpreting a missing offset as UTC.
    pub fn timestamp_millis(&self) -> i64 {
        match self.offset {
            Some(off) => (self.naive - off).and_utc().timestamp_millis(),
            None => self.naive.and_utc().timestamp_millis(),
        }
    }

    /// The ISO 8601 wire form: millisecond precision when non-zero, offset
    /// suffix when known (`Z` for zero).
    pub fn to_date_string(&self) -> String {
        let base = if self.naive.time().nanosecond() != 0 {
            self.naive.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
        } else {
            self.naive.format("%Y-%m-%dT%H:%M:%S").to_string()
        };
        match self.offset {
            Some(off) if off.local_minus_utc() == 0 => format!("{base}Z"),
            Some(off) => format!("{base}{off}"),
            None => base,
        }
    }

    /// Parse the xsd wire form, with or without an offset.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(XsdDateTime {
                naive: dt.naive_local(),
                offset: Some(*dt.offset()),
            });
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .map(XsdDateTime::new)
            .map_err(|_| DecodeError::numeric(text, "dateTime"))
    }
}

impl std::fmt::Display for XsdDateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_date_string())
    }
}

pub fn date_to_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `hh:mm:ss`, with milliseconds appended only when present.
pub fn time_to_text(time: NaiveTime) -> String {
    if time.nanosecond() != 0 {
        time.format("%H:%M:%S%.3f").to_string()
    } else {
        time.format("%H:%M:%S").to_string()
    }
}

pub fn parse_date(text: &str) -> Result<NaiveDate, DecodeError> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| DecodeError::numeric(text, "date"))
}

pub fn parse_time(text: &str) -> Result<NaiveTime, DecodeError> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|_| DecodeError::numeric(text, "time"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_millis_only_when_nonzero() {
        let dt = XsdDateTime::from_timestamp_millis(123456789).unwrap();
        assert_eq!(dt.to_date_string(), "1970-01-02T10:17:36.789Z");

        let dt = XsdDateTime::from_timestamp_millis(123456000).unwrap();
        assert_eq!(dt.to_date_string(), "1970-01-02T10:17:36Z");
    }

    #[test]
    fn test_datetime_without_offset() {
        let naive = NaiveDate::from_ymd_opt(2011, 3, 15)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let dt = XsdDateTime::new(naive);
        assert_eq!(dt.to_date_string(), "2011-03-15T09:30:00");
    }

    #[test]
    fn test_datetime_roundtrip_with_offset() {
        for text in ["2011-03-15T09:30:00+01:00", "1970-01-02T10:17:36.789Z"] {
            let dt = XsdDateTime::parse(text).unwrap();
            assert_eq!(dt.to_date_string(), text);
        }
    }

    #[test]
    fn test_datetime_roundtrip_naive() {
        let dt = XsdDateTime::parse("2011-03-15T09:30:00").unwrap();
        assert_eq!(dt.offset(), None);
        assert_eq!(dt.to_date_string(), "2011-03-15T09:30:00");
    }

    #[test]
    fn test_time_text() {
        let t = NaiveTime::from_hms_milli_opt(9, 30, 1, 250).unwrap();
        assert_eq!(time_to_text(t), "09:30:01.250");
        let t = NaiveTime::from_hms_opt(9, 30, 1).unwrap();
        assert_eq!(time_to_text(t), "09:30:01");
    }

    #[test]
    fn test_bad_datetime() {
        assert!(XsdDateTime::parse("not a date").is_err());
    }
}
