//! SMPP time fields (`schedule_delivery_time`, `validity_period`)
//!
//! Format `YYMMDDhhmmsstnnp`: `t` tenths of a second, `nn` quarter hours
//! offset from UTC and `p` one of `+`, `-` (absolute) or `R` (relative).

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid SMPP time '{0}'")]
pub struct TimeError(pub String);

/// A parsed non-empty time field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmppTime {
    Absolute(DateTime<Utc>),
    Relative(ChronoDuration),
}

impl SmppTime {
    /// Resolve against the submission instant
    pub fn at(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Absolute(at) => at,
            Self::Relative(offset) => now + offset,
        }
    }
}

/// Parse a time field; an empty field is `None`
pub fn parse(field: &str) -> Result<Option<SmppTime>, TimeError> {
    if field.is_empty() {
        return Ok(None);
    }
    let err = || TimeError(field.to_string());
    if field.len() != 16 || !field.is_ascii() {
        return Err(err());
    }

    let num = |range: std::ops::Range<usize>| -> Result<u32, TimeError> {
        field[range].parse::<u32>().map_err(|_| err())
    };
    let yy = num(0..2)?;
    let mm = num(2..4)?;
    let dd = num(4..6)?;
    let hh = num(6..8)?;
    let mi = num(8..10)?;
    let ss = num(10..12)?;
    let tenths = num(12..13)?;
    let quarters = num(13..15)? as i64;

    match &field[15..16] {
        "R" => {
            // YY years, MM months counted as 365 and 30 days
            let days = yy as i64 * 365 + mm as i64 * 30 + dd as i64;
            let secs = days * 86_400 + hh as i64 * 3600 + mi as i64 * 60 + ss as i64;
            Ok(Some(SmppTime::Relative(ChronoDuration::seconds(secs))))
        }
        sign @ ("+" | "-") => {
            let local = NaiveDate::from_ymd_opt(2000 + yy as i32, mm, dd)
                .and_then(|d| d.and_hms_milli_opt(hh, mi, ss, tenths * 100))
                .ok_or_else(err)?;
            let offset = ChronoDuration::minutes(quarters * 15);
            let utc = if sign == "+" {
                local - offset
            } else {
                local + offset
            };
            Ok(Some(SmppTime::Absolute(utc.and_utc())))
        }
        _ => Err(err()),
    }
}

/// Validity in whole seconds from `now`; a time already past is an error
pub fn validity_secs(field: &str, now: DateTime<Utc>) -> Result<Option<u64>, TimeError> {
    match parse(field)? {
        None => Ok(None),
        Some(time) => {
            let secs = (time.at(now) - now).num_seconds();
            if secs <= 0 {
                return Err(TimeError(field.to_string()));
            }
            Ok(Some(secs as u64))
        }
    }
}

/// Receipt timestamp format `YYMMDDhhmm`
pub fn receipt_stamp(at: DateTime<Utc>) -> String {
    at.format("%y%m%d%H%M").to_string()
}
