use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::str::FromStr;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

const RC_ENV_VAR: &str = "DOCKETRC";
const RC_FILE_NAME: &str = ".docketrc";
const OVERRIDE_PREFIX: &str = "rc.";
const MAX_INCLUDE_DEPTH: usize = 8;

const DEFAULTS: [(&str, &str); 9] = [
  ("data.location", "~/.docket"),
  ("color", "on"),
  ("default.sort", "createdAt"),
  ("default.order", "desc"),
  ("default.category", "Personal"),
  ("notify.sink", "command"),
  ("notify.command", "notify-send"),
  ("notify.lead_minutes", "5"),
  ("notify.interval_seconds", "30")
];

/// Settings layered as defaults, then the
/// rc file (and its includes), then
/// command-line overrides.
#[derive(Debug, Clone)]
pub struct Config {
  values:      BTreeMap<String, String>,
  pub sources: Vec<PathBuf>
}

#[derive(Debug, PartialEq, Eq)]
enum RcLine<'a> {
  Blank,
  Include(&'a str),
  Setting {
    key:   &'a str,
    value: &'a str
  }
}

impl Config {
  pub fn defaults() -> Self {
    Self {
      values:  DEFAULTS
        .iter()
        .map(|(key, value)| {
          (
            (*key).to_string(),
            (*value).to_string()
          )
        })
        .collect(),
      sources: Vec::new()
    }
  }

  /// `rc_override` wins over `DOCKETRC`,
  /// which wins over `~/.docketrc`.
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Self::defaults();
    match locate_rc(rc_override) {
      | Some(path) => {
        info!(rc = %path.display(), "loading docketrc");
        cfg.read_rc(&path, 0)?;
      }
      | None => {
        debug!(
          "no docketrc in use; keeping \
           defaults"
        );
      }
    }
    Ok(cfg)
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.values.get(key).cloned()
  }

  /// Parses `key` with `FromStr`. Absent
  /// keys yield `None`; unparsable values
  /// are errors naming the key.
  pub fn get_parsed<T>(
    &self,
    key: &str
  ) -> anyhow::Result<Option<T>>
  where
    T: FromStr,
    T::Err: Display
  {
    self
      .values
      .get(key)
      .map(|raw| {
        raw.trim().parse::<T>().map_err(
          |err| {
            anyhow!(
              "invalid value for {key}: \
               {raw} ({err})"
            )
          }
        )
      })
      .transpose()
  }

  /// Keys may carry the `rc.` prefix used
  /// on the command line.
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (key, value) in overrides {
      let key = key
        .strip_prefix(OVERRIDE_PREFIX)
        .map(str::to_string)
        .unwrap_or(key);
      debug!(key = %key, value = %value, "override");
      self.values.insert(key, value);
    }
  }

  fn read_rc(
    &mut self,
    path: &Path,
    depth: usize
  ) -> anyhow::Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
      return Err(anyhow!(
        "includes nested deeper than \
         {MAX_INCLUDE_DEPTH} at {}",
        path.display()
      ));
    }

    let text = fs::read_to_string(path)
      .with_context(|| {
        format!(
          "failed to read {}",
          path.display()
        )
      })?;
    self.sources.push(path.to_path_buf());

    for (idx, raw) in
      text.lines().enumerate()
    {
      let line = parse_rc_line(raw)
        .with_context(|| {
          format!(
            "{}:{}",
            path.display(),
            idx + 1
          )
        })?;

      match line {
        | RcLine::Blank => {}
        | RcLine::Include(target) => {
          let target =
            include_target(path, target)?;
          if target.is_file() {
            self.read_rc(
              &target,
              depth + 1
            )?;
          } else {
            warn!(include = %target.display(), "include not found; skipped");
          }
        }
        | RcLine::Setting {
          key,
          value
        } => {
          trace!(key, value, "rc setting");
          self.values.insert(
            key.to_string(),
            value.to_string()
          );
        }
      }
    }
    Ok(())
  }
}

/// Directory holding the storage slots:
/// `--data`, else `data.location`.
pub fn resolve_data_dir(
  cfg: &Config,
  data_override: Option<&Path>
) -> anyhow::Result<PathBuf> {
  if let Some(dir) = data_override {
    return Ok(dir.to_path_buf());
  }
  let location = cfg
    .get("data.location")
    .filter(|raw| !raw.trim().is_empty())
    .ok_or_else(|| {
      anyhow!("data.location is not set")
    })?;
  expand_home(location.trim())
}

fn locate_rc(
  rc_override: Option<&Path>
) -> Option<PathBuf> {
  if let Some(path) = rc_override {
    return Some(path.to_path_buf());
  }

  if let Ok(raw) =
    std::env::var(RC_ENV_VAR)
  {
    let raw = raw.trim();
    if raw.is_empty() || raw == "/dev/null"
    {
      return None;
    }
    return expand_home(raw).ok();
  }

  dirs::home_dir()
    .map(|home| home.join(RC_FILE_NAME))
    .filter(|path| path.is_file())
}

fn parse_rc_line(
  raw: &str
) -> anyhow::Result<RcLine<'_>> {
  let line = raw
    .split_once('#')
    .map_or(raw, |(before, _)| before)
    .trim();
  if line.is_empty() {
    return Ok(RcLine::Blank);
  }

  if let Some(target) =
    line.strip_prefix("include ")
  {
    let target = target.trim();
    if target.is_empty() {
      return Err(anyhow!(
        "include needs a path"
      ));
    }
    return Ok(RcLine::Include(target));
  }

  let (key, value) =
    line.split_once('=').ok_or_else(
      || anyhow!("expected key = value, got: {line}")
    )?;
  let key = key.trim();
  if key.is_empty() {
    return Err(anyhow!(
      "missing key before '='"
    ));
  }
  Ok(RcLine::Setting {
    key,
    value: value.trim()
  })
}

fn include_target(
  from: &Path,
  target: &str
) -> anyhow::Result<PathBuf> {
  let expanded = expand_home(target)?;
  if expanded.is_absolute() {
    return Ok(expanded);
  }
  let base = from
    .parent()
    .unwrap_or_else(|| Path::new("."));
  Ok(base.join(expanded))
}

fn expand_home(
  raw: &str
) -> anyhow::Result<PathBuf> {
  let Some(rest) = raw.strip_prefix("~/")
  else {
    return Ok(PathBuf::from(raw));
  };
  let home = dirs::home_dir().ok_or_else(
    || {
      anyhow!(
        "cannot expand {raw}: no home \
         directory"
      )
    }
  )?;
  Ok(home.join(rest))
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::path::Path;

  use tempfile::tempdir;

  use super::{
    Config,
    RcLine,
    parse_rc_line,
    resolve_data_dir
  };

  #[test]
  fn classifies_rc_lines() {
    assert_eq!(
      parse_rc_line("   # just a comment")
        .expect("comment"),
      RcLine::Blank
    );
    assert_eq!(
      parse_rc_line("color = off # dim")
        .expect("setting"),
      RcLine::Setting {
        key:   "color",
        value: "off"
      }
    );
    assert_eq!(
      parse_rc_line("include ~/extra.rc")
        .expect("include"),
      RcLine::Include("~/extra.rc")
    );
    assert!(parse_rc_line("include ").is_err());
    assert!(parse_rc_line("= value").is_err());
    assert!(
      parse_rc_line("no equals sign")
        .is_err()
    );
  }

  #[test]
  fn loads_file_with_include_and_overrides()
  {
    let temp =
      tempdir().expect("tempdir");
    fs::write(
      temp.path().join("extra.rc"),
      "notify.lead_minutes = 10\ninclude missing.rc\n"
    )
    .expect("write include");
    let rc = temp.path().join("docketrc");
    fs::write(
      &rc,
      "# comment\ncolor = off # inline\ninclude extra.rc\n"
    )
    .expect("write rc");

    let mut cfg = Config::load(Some(&rc))
      .expect("load config");
    assert_eq!(
      cfg.get("color").as_deref(),
      Some("off")
    );
    assert_eq!(
      cfg
        .get_parsed::<u32>(
          "notify.lead_minutes"
        )
        .expect("parse"),
      Some(10)
    );
    assert_eq!(
      cfg.get("notify.command").as_deref(),
      Some("notify-send")
    );
    assert_eq!(cfg.sources.len(), 2);

    cfg.apply_overrides(vec![(
      "rc.notify.command".to_string(),
      "true".to_string()
    )]);
    assert_eq!(
      cfg.get("notify.command").as_deref(),
      Some("true")
    );
  }

  #[test]
  fn malformed_line_reports_location() {
    let temp =
      tempdir().expect("tempdir");
    let rc = temp.path().join("docketrc");
    fs::write(
      &rc,
      "color = on\nno equals sign\n"
    )
    .expect("write rc");
    let err = Config::load(Some(&rc))
      .expect_err("should fail");
    assert!(
      format!("{err:#}")
        .contains("docketrc:2")
    );
  }

  #[test]
  fn include_cycle_is_an_error() {
    let temp =
      tempdir().expect("tempdir");
    let rc = temp.path().join("docketrc");
    fs::write(&rc, "include docketrc\n")
      .expect("write rc");
    assert!(Config::load(Some(&rc)).is_err());
  }

  #[test]
  fn unparsable_value_names_the_key() {
    let mut cfg = Config::defaults();
    cfg.apply_overrides(vec![(
      "notify.interval_seconds".to_string(),
      "soon".to_string()
    )]);
    let err = cfg
      .get_parsed::<u64>(
        "notify.interval_seconds"
      )
      .expect_err("should fail");
    assert!(
      err
        .to_string()
        .contains("notify.interval_seconds")
    );
    assert_eq!(
      cfg
        .get_parsed::<u64>("no.such.key")
        .expect("absent"),
      None
    );
  }

  #[test]
  fn data_dir_prefers_flag_then_setting() {
    let mut cfg = Config::defaults();
    assert_eq!(
      resolve_data_dir(
        &cfg,
        Some(Path::new("/tmp/flag"))
      )
      .expect("flag"),
      Path::new("/tmp/flag")
    );

    cfg.apply_overrides(vec![(
      "data.location".to_string(),
      "/srv/docket".to_string()
    )]);
    assert_eq!(
      resolve_data_dir(&cfg, None)
        .expect("setting"),
      Path::new("/srv/docket")
    );

    cfg.apply_overrides(vec![(
      "data.location".to_string(),
      "  ".to_string()
    )]);
    assert!(
      resolve_data_dir(&cfg, None).is_err()
    );
  }
}
