//! Display helpers for command output.

use chrono::{DateTime, TimeZone, Utc};

const UNITS: [(f64, &str); 3] = [(1e9, "B"), (1e6, "M"), (1e3, "K")];

/// Format a count in compact notation: `999`, `1.2K`, `12K`, `3.4M`.
pub fn compact_number(n: u64) -> String {
  let value = n as f64;
  for (i, (scale, suffix)) in UNITS.iter().enumerate() {
    if value < *scale {
      continue;
    }
    let scaled = value / scale;
    let rounded = if scaled < 10.0 {
      (scaled * 10.0).round() / 10.0
    } else {
      scaled.round()
    };
    // 999_999 rounds to 1000K; show it with the next unit up
    if rounded >= 1000.0 && i > 0 {
      let (_, bigger) = UNITS[i - 1];
      return format!("1{}", bigger);
    }
    return format!("{}{}", trim_number(rounded), suffix);
  }
  n.to_string()
}

/// Render a number without a trailing `.0`.
pub fn trim_number(value: f64) -> String {
  if value.fract() == 0.0 {
    format!("{}", value as i64)
  } else {
    format!("{}", value)
  }
}

/// Label of a chapter number; negative numbers mark a one-shot.
pub fn chapter_label(chapter: f64) -> String {
  if chapter < 0.0 {
    "One shot".to_string()
  } else {
    format!("Chapter {}", trim_number(chapter))
  }
}

/// Relative time such as "5 minutes ago" for an epoch-millisecond timestamp.
pub fn time_from_now(epoch_ms: i64, now: DateTime<Utc>) -> String {
  let Some(at) = Utc.timestamp_millis_opt(epoch_ms).single() else {
    return "unknown".to_string();
  };
  relative(at, now)
}

pub fn relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let secs = (now - at).num_seconds();
  if secs < 60 {
    return "just now".to_string();
  }
  let (amount, unit) = match secs {
    s if s < 3_600 => (s / 60, "minute"),
    s if s < 86_400 => (s / 3_600, "hour"),
    s if s < 30 * 86_400 => (s / 86_400, "day"),
    s if s < 365 * 86_400 => (s / (30 * 86_400), "month"),
    s => (s / (365 * 86_400), "year"),
  };
  if amount == 1 {
    format!("1 {} ago", unit)
  } else {
    format!("{} {}s ago", amount, unit)
  }
}
