use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Datelike,
  Days,
  Local,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "docket-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "DOCKET_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "DOCKET_TIME_CONFIG";

pub const DATE_FORMAT: &str =
  "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Zone in which due dates and times are
/// interpreted.
#[derive(Debug, Clone, Copy)]
pub enum UserZone {
  Named(Tz),
  System
}

pub fn user_timezone() -> UserZone {
  static USER_TZ: OnceLock<UserZone> =
    OnceLock::new();
  *USER_TZ
    .get_or_init(resolve_user_timezone)
}

/// Wall-clock time of `now` in the user's
/// zone. Due instants are compared against
/// this.
#[must_use]
pub fn to_user_local(
  now: DateTime<Utc>
) -> NaiveDateTime {
  match user_timezone() {
    | UserZone::Named(tz) => {
      now.with_timezone(&tz).naive_local()
    }
    | UserZone::System => {
      now
        .with_timezone(&Local)
        .naive_local()
    }
  }
}

#[must_use]
pub fn user_today(
  now: DateTime<Utc>
) -> NaiveDate {
  to_user_local(now).date()
}

/// `date`+`time` when both are set,
/// `date` at 23:59:59 when only the date
/// is set. A time without a date is
/// ignored.
#[must_use]
pub fn effective_due(
  date: Option<NaiveDate>,
  time: Option<NaiveTime>
) -> Option<NaiveDateTime> {
  let date = date?;
  let time =
    time.unwrap_or_else(end_of_day);
  Some(date.and_time(time))
}

fn end_of_day() -> NaiveTime {
  NaiveTime::from_hms_opt(23, 59, 59)
    .unwrap_or(NaiveTime::MIN)
}

fn resolve_user_timezone() -> UserZone {
  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) =
      parse_timezone(&raw, TIMEZONE_ENV_VAR)
  {
    return UserZone::Named(tz);
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return UserZone::Named(tz);
  }

  tracing::debug!(
    "no timezone configured; using \
     system local time"
  );
  UserZone::System
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    tracing::warn!(
      source,
      "timezone source was empty"
    );
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::info!(
        source,
        timezone = %trimmed,
        "configured user timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// Parses a due date typed on the command
/// line: `YYYY-MM-DD`, `today`,
/// `tomorrow`, `yesterday`, a weekday
/// name, or `+N` followed by `d` or `w`.
#[tracing::instrument(skip(today), fields(input = input))]
pub fn parse_due_date(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();

  match lower.as_str() {
    | "today" => return Ok(today),
    | "tomorrow" => {
      return today
        .checked_add_days(Days::new(1))
        .ok_or_else(|| {
          anyhow!("date out of range")
        });
    }
    | "yesterday" => {
      return today
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| {
          anyhow!("date out of range")
        });
    }
    | _ => {}
  }

  if let Some(weekday) =
    parse_weekday_name(&lower)
  {
    return Ok(next_weekday_date(
      today, weekday
    ));
  }

  if let Some(captures) = relative_re()
    .and_then(|re| re.captures(&lower))
  {
    let amount = captures["amount"]
      .parse::<u64>()
      .map_err(|err| {
        anyhow!(
          "invalid offset in {token}: \
           {err}"
        )
      })?;
    let days = match &captures["unit"] {
      | "w" => amount.saturating_mul(7),
      | _ => amount
    };
    return today
      .checked_add_days(Days::new(days))
      .ok_or_else(|| {
        anyhow!(
          "date out of range: {token}"
        )
      });
  }

  NaiveDate::parse_from_str(
    token,
    DATE_FORMAT
  )
  .map_err(|_| {
    anyhow!(
      "unrecognized due date: {token} \
       (use YYYY-MM-DD, today, \
       tomorrow, a weekday name or +Nd)"
    )
  })
}

/// Parses `HH:MM` (24-hour) or a 12-hour
/// clock time such as `3:15pm`.
pub fn parse_due_time(
  input: &str
) -> anyhow::Result<NaiveTime> {
  let token = input.trim();
  parse_clock_time(token)
    .and_then(|(hour, minute)| {
      NaiveTime::from_hms_opt(
        hour, minute, 0
      )
    })
    .ok_or_else(|| {
      anyhow!(
        "unrecognized due time: {token} \
         (use HH:MM)"
      )
    })
}

fn relative_re() -> Option<&'static Regex>
{
  static RE: OnceLock<Option<Regex>> =
    OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"^\+(?P<amount>\d{1,4})(?P<unit>[dw])$"
    )
    .ok()
  })
  .as_ref()
}

fn clock_re() -> Option<&'static Regex> {
  static RE: OnceLock<Option<Regex>> =
    OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"(?i)^(?P<hour>\d{1,2}):(?P<minute>\d{2})\s*(?P<ampm>[ap]m)?$",
    )
    .ok()
  })
  .as_ref()
}

fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = from
    .weekday()
    .num_days_from_monday()
    as u64;
  let target_idx = target
    .num_days_from_monday()
    as u64;
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  from
    .checked_add_days(Days::new(delta))
    .unwrap_or(from)
}

fn parse_clock_time(
  token: &str
) -> Option<(u32, u32)> {
  let captures =
    clock_re()?.captures(token)?;

  let raw_hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = captures
    .name("minute")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  if minute > 59 {
    return None;
  }

  let hour = if let Some(ampm_match) =
    captures.name("ampm")
  {
    if raw_hour == 0 || raw_hour > 12 {
      return None;
    }
    match ampm_match
      .as_str()
      .to_ascii_lowercase()
      .as_str()
    {
      | "am" => raw_hour % 12,
      | "pm" => raw_hour % 12 + 12,
      | _ => return None
    }
  } else {
    if raw_hour > 23 {
      return None;
    }
    raw_hour
  };

  Some((hour, minute))
}


/// `YYYY-MM-DD` or absent. Empty strings
/// are treated as absent.
pub mod due_date_serde {
  use chrono::NaiveDate;
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  use super::DATE_FORMAT;

  pub fn serialize<S>(
    date: &Option<NaiveDate>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    match date {
      | Some(value) => {
        serializer.serialize_str(
          &value
            .format(DATE_FORMAT)
            .to_string()
        )
      }
      | None => {
        serializer.serialize_none()
      }
    }
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<Option<NaiveDate>, D::Error>
  where
    D: Deserializer<'de>
  {
    let opt =
      Option::<String>::deserialize(
        deserializer
      )?;
    match opt.as_deref().map(str::trim) {
      | None | Some("") => Ok(None),
      | Some(raw) => {
        NaiveDate::parse_from_str(
          raw,
          DATE_FORMAT
        )
        .map(Some)
        .map_err(serde::de::Error::custom)
      }
    }
  }
}

/// `HH:MM` or absent. Seconds are accepted
/// on input and dropped on output.
pub mod due_time_serde {
  use chrono::NaiveTime;
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  use super::TIME_FORMAT;

  pub fn serialize<S>(
    time: &Option<NaiveTime>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    match time {
      | Some(value) => {
        serializer.serialize_str(
          &value
            .format(TIME_FORMAT)
            .to_string()
        )
      }
      | None => {
        serializer.serialize_none()
      }
    }
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<Option<NaiveTime>, D::Error>
  where
    D: Deserializer<'de>
  {
    let opt =
      Option::<String>::deserialize(
        deserializer
      )?;
    match opt.as_deref().map(str::trim) {
      | None | Some("") => Ok(None),
      | Some(raw) => {
        NaiveTime::parse_from_str(
          raw,
          TIME_FORMAT
        )
        .or_else(|_| {
          NaiveTime::parse_from_str(
            raw, "%H:%M:%S"
          )
        })
        .map(Some)
        .map_err(serde::de::Error::custom)
      }
    }
  }
}
