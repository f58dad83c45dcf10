//! Window id codec
//!
//! Wire grammar: `{asset}-{duration}m-YYYY-MM-DD-HH:MM`, all times UTC.
//! The parser is exact-match: anything that deviates from the grammar is
//! rejected with a reason, never coerced.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

/// Parse failure detail for a window id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowIdError {
    #[error("window id '{0}' does not match '{{asset}}-{{n}}m-YYYY-MM-DD-HH:MM'")]
    Malformed(String),
    #[error("window id '{id}' has invalid asset segment '{asset}'")]
    BadAsset { id: String, asset: String },
    #[error("window id '{id}' has invalid duration segment '{duration}'")]
    BadDuration { id: String, duration: String },
    #[error("window id '{id}' has invalid date/time: {detail}")]
    BadTimestamp { id: String, detail: String },
}

/// Parsed window identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowId {
    /// Lower-case asset symbol, e.g. `btc`
    pub asset: String,
    /// Duration label as it appeared on the wire, e.g. `15m`
    pub duration_label: String,
    /// Duration in minutes, parsed from the label
    pub duration_min: u32,
    /// Window start, UTC
    pub start_time: DateTime<Utc>,
    /// Window end = start + duration
    pub end_time: DateTime<Utc>,
}

impl WindowId {
    pub fn start_ms(&self) -> i64 {
        self.start_time.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end_time.timestamp_millis()
    }

    /// Reformat by the same rule the parser accepts
    pub fn format(&self) -> String {
        format_window_id(&self.asset, self.duration_min, &self.start_time)
    }
}

/// Format a window id from its parts
pub fn format_window_id(asset: &str, duration_min: u32, start: &DateTime<Utc>) -> String {
    format!(
        "{}-{}m-{}",
        asset,
        duration_min,
        start.format("%Y-%m-%d-%H:%M")
    )
}

/// Parse a window id, rejecting anything outside the grammar
pub fn parse_window_id(id: &str) -> Result<WindowId, WindowIdError> {
    // asset-{n}m-YYYY-MM-DD-HH:MM splits into exactly 6 dash segments
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() != 6 {
        return Err(WindowIdError::Malformed(id.to_string()));
    }
    let (asset, duration, year, month, day, hhmm) =
        (parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]);

    if asset.is_empty() || !asset.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(WindowIdError::BadAsset {
            id: id.to_string(),
            asset: asset.to_string(),
        });
    }

    let Some(mins) = duration.strip_suffix('m') else {
        return Err(WindowIdError::BadDuration {
            id: id.to_string(),
            duration: duration.to_string(),
        });
    };
    if mins.is_empty() || !mins.chars().all(|c| c.is_ascii_digit()) {
        return Err(WindowIdError::BadDuration {
            id: id.to_string(),
            duration: duration.to_string(),
        });
    }
    let duration_min: u32 = mins.parse().map_err(|_| WindowIdError::BadDuration {
        id: id.to_string(),
        duration: duration.to_string(),
    })?;
    if duration_min == 0 {
        return Err(WindowIdError::BadDuration {
            id: id.to_string(),
            duration: duration.to_string(),
        });
    }

    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return Err(WindowIdError::Malformed(id.to_string()));
    }
    let (y, mo, d) = match (
        parse_digits(year),
        parse_digits(month),
        parse_digits(day),
    ) {
        (Some(y), Some(mo), Some(d)) => (y as i32, mo, d),
        _ => return Err(WindowIdError::Malformed(id.to_string())),
    };

    let hm: Vec<&str> = hhmm.split(':').collect();
    if hm.len() != 2 || hm[0].len() != 2 || hm[1].len() != 2 {
        return Err(WindowIdError::Malformed(id.to_string()));
    }
    let (h, mi) = match (parse_digits(hm[0]), parse_digits(hm[1])) {
        (Some(h), Some(mi)) => (h, mi),
        _ => return Err(WindowIdError::Malformed(id.to_string())),
    };

    let date = NaiveDate::from_ymd_opt(y, mo, d).ok_or_else(|| WindowIdError::BadTimestamp {
        id: id.to_string(),
        detail: format!("no such date {y:04}-{mo:02}-{d:02}"),
    })?;
    let time = date
        .and_hms_opt(h, mi, 0)
        .ok_or_else(|| WindowIdError::BadTimestamp {
            id: id.to_string(),
            detail: format!("no such time {h:02}:{mi:02}"),
        })?;
    let start_time = Utc.from_utc_datetime(&time);
    // chrono handles the day/month/year carry here
    let end_time = start_time + chrono::Duration::minutes(duration_min as i64);

    Ok(WindowId {
        asset: asset.to_string(),
        duration_label: duration.to_string(),
        duration_min,
        start_time,
        end_time,
    })
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.chars().all(|c| c.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}
