use std::cell::RefCell;
use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{
  self,
  IsTerminal,
  Write
};
use std::path::{
  Path,
  PathBuf
};
use std::process::{
  Command,
  Stdio
};

use chrono::{
  Duration,
  NaiveDateTime
};
use tracing::{
  debug,
  info,
  warn
};

use crate::task::Task;

pub const DUE_SOON_TITLE: &str =
  "Task Due Soon!";
pub const TEST_TITLE: &str =
  "Test Notification";
pub const TEST_BODY: &str =
  "Your notifications are working!";
pub const DEFAULT_LEAD_MINUTES: u32 = 5;
pub const DEFAULT_POLL_SECONDS: u64 = 30;

/// The platform notification surface the
/// notifier depends on.
pub trait NotificationSink {
  fn is_available(&self) -> bool;

  /// Best effort. Returns whether the
  /// notification was actually shown.
  fn fire(
    &self,
    title: &str,
    body: &str
  ) -> bool;

  fn request_authorization(
    &self
  ) -> bool;
}

impl<S: NotificationSink + ?Sized>
  NotificationSink for Box<S>
{
  fn is_available(&self) -> bool {
    (**self).is_available()
  }

  fn fire(
    &self,
    title: &str,
    body: &str
  ) -> bool {
    (**self).fire(title, body)
  }

  fn request_authorization(
    &self
  ) -> bool {
    (**self).request_authorization()
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum NotifierState {
  Disabled,
  Enabled
}

/// Warns once per task shortly before its
/// effective due instant.
#[derive(Debug)]
pub struct DueNotifier<S> {
  sink:     S,
  state:    NotifierState,
  lead:     Duration,
  notified: BTreeSet<String>
}

impl<S: NotificationSink> DueNotifier<S> {
  pub fn new(sink: S) -> Self {
    Self::with_lead_minutes(
      sink,
      DEFAULT_LEAD_MINUTES
    )
  }

  pub fn with_lead_minutes(
    sink: S,
    lead_minutes: u32
  ) -> Self {
    Self {
      sink,
      state: NotifierState::Disabled,
      lead: Duration::minutes(
        i64::from(lead_minutes.max(1))
      ),
      notified: BTreeSet::new()
    }
  }

  pub fn sink(&self) -> &S {
    &self.sink
  }

  pub fn state(&self) -> NotifierState {
    self.state
  }

  pub fn is_enabled(&self) -> bool {
    self.state == NotifierState::Enabled
  }

  pub fn lead_minutes(&self) -> i64 {
    self.lead.num_minutes()
  }

  pub fn is_notified(
    &self,
    id: &str
  ) -> bool {
    self.notified.contains(id)
  }

  /// Startup probe: enabled exactly when
  /// the sink reports availability.
  #[tracing::instrument(skip(self))]
  pub fn refresh_availability(
    &mut self
  ) -> NotifierState {
    self.state =
      if self.sink.is_available() {
        NotifierState::Enabled
      } else {
        NotifierState::Disabled
      };
    debug!(state = ?self.state, "probed notification availability");
    self.state
  }

  #[tracing::instrument(skip(self))]
  pub fn authorize(
    &mut self
  ) -> NotifierState {
    self.state = if self
      .sink
      .request_authorization()
    {
      NotifierState::Enabled
    } else {
      NotifierState::Disabled
    };
    info!(state = ?self.state, "notification authorization finished");
    self.state
  }

  pub fn disable(&mut self) {
    if self.state
      == NotifierState::Enabled
    {
      info!("due notifications disabled");
    }
    self.state = NotifierState::Disabled;
  }

  /// One poll. Fires for every incomplete,
  /// not yet notified task whose due
  /// instant lies in `(now, now + lead]`
  /// and returns the ids it fired for. An
  /// id is marked even when the sink
  /// refused the notification.
  #[tracing::instrument(skip(self, tasks), fields(count = tasks.len()))]
  pub fn check(
    &mut self,
    tasks: &[Task],
    now: NaiveDateTime
  ) -> Vec<String> {
    if !self.is_enabled() {
      return Vec::new();
    }

    let mut fired = Vec::new();
    for task in tasks {
      if task.completed
        || self.notified.contains(&task.id)
      {
        continue;
      }
      let Some(due) = task.effective_due()
      else {
        continue;
      };

      let remaining = due - now;
      if remaining <= Duration::zero()
        || remaining > self.lead
      {
        continue;
      }

      let body = self.due_soon_body(task);
      let shown =
        self.sink.fire(DUE_SOON_TITLE, &body);
      if !shown {
        warn!(
          id = %task.id,
          "due-soon notification was not shown"
        );
      }
      info!(
        id = %task.id,
        due = %due,
        shown,
        "sent due-soon notification"
      );
      self.notified.insert(task.id.clone());
      fired.push(task.id.clone());
    }
    fired
  }

  /// Drops notified ids whose task no
  /// longer exists.
  pub fn forget_missing(
    &mut self,
    tasks: &[Task]
  ) {
    let live: BTreeSet<&str> = tasks
      .iter()
      .map(|task| task.id.as_str())
      .collect();
    self
      .notified
      .retain(|id| live.contains(id.as_str()));
  }

  /// Fires a fixed notification right
  /// away. Gated only by availability.
  #[tracing::instrument(skip(self))]
  pub fn test_notification(
    &self
  ) -> bool {
    if !self.sink.is_available() {
      warn!(
        "notifications unavailable; \
         skipping test notification"
      );
      return false;
    }
    self.sink.fire(TEST_TITLE, TEST_BODY)
  }

  fn due_soon_body(
    &self,
    task: &Task
  ) -> String {
    format!(
      "\"{}\" is due in {} minutes",
      task.title,
      self.lead.num_minutes()
    )
  }
}

/// Runs an external program with the
/// title and body as its two arguments,
/// e.g. `notify-send`.
#[derive(Debug, Clone)]
pub struct CommandSink {
  program: String
}

impl CommandSink {
  pub fn new(
    program: impl Into<String>
  ) -> Self {
    Self {
      program: program.into()
    }
  }

  pub fn program(&self) -> &str {
    &self.program
  }

  fn resolve(&self) -> Option<PathBuf> {
    let program = self.program.trim();
    if program.is_empty() {
      return None;
    }

    let direct = Path::new(program);
    if direct.components().count() > 1 {
      return is_executable(direct)
        .then(|| direct.to_path_buf());
    }

    let search_path: OsString =
      env::var_os("PATH")?;
    env::split_paths(&search_path)
      .map(|dir| dir.join(program))
      .find(|candidate| {
        is_executable(candidate)
      })
  }
}

impl NotificationSink for CommandSink {
  fn is_available(&self) -> bool {
    self.resolve().is_some()
  }

  #[tracing::instrument(skip(self, body))]
  fn fire(
    &self,
    title: &str,
    body: &str
  ) -> bool {
    let Some(path) = self.resolve()
    else {
      debug!(
        program = %self.program,
        "notification command not found"
      );
      return false;
    };

    let output = Command::new(&path)
      .arg(title)
      .arg(body)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .output();

    match output {
      | Ok(output)
        if output.status.success() =>
      {
        true
      }
      | Ok(output) => {
        let stderr =
          String::from_utf8_lossy(
            &output.stderr
          )
          .trim()
          .to_string();
        warn!(
          program = %path.display(),
          status = ?output.status.code(),
          stderr = %stderr,
          "notification command failed"
        );
        false
      }
      | Err(err) => {
        warn!(
          program = %path.display(),
          error = %err,
          "failed to run notification command"
        );
        false
      }
    }
  }

  fn request_authorization(
    &self
  ) -> bool {
    self.is_available()
  }
}

/// Prints notifications to stderr with a
/// terminal bell.
#[derive(Debug, Clone, Default)]
pub struct TerminalSink;

impl NotificationSink for TerminalSink {
  fn is_available(&self) -> bool {
    true
  }

  fn fire(
    &self,
    title: &str,
    body: &str
  ) -> bool {
    let mut err = io::stderr().lock();
    let bell = if io::stderr().is_terminal()
    {
      "\x07"
    } else {
      ""
    };
    writeln!(err, "{bell}[{title}] {body}")
      .is_ok()
  }

  fn request_authorization(
    &self
  ) -> bool {
    true
  }
}

/// Keeps every fired notification in
/// memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingSink {
  pub available: bool,
  pub accept:    bool,
  fired:         RefCell<Vec<(String, String)>>
}

impl RecordingSink {
  pub fn available() -> Self {
    Self {
      available: true,
      accept:    true,
      fired:     RefCell::new(Vec::new())
    }
  }

  pub fn unavailable() -> Self {
    Self::default()
  }

  pub fn fired(
    &self
  ) -> Vec<(String, String)> {
    self.fired.borrow().clone()
  }
}

impl NotificationSink for RecordingSink {
  fn is_available(&self) -> bool {
    self.available
  }

  fn fire(
    &self,
    title: &str,
    body: &str
  ) -> bool {
    self.fired.borrow_mut().push((
      title.to_string(),
      body.to_string()
    ));
    self.accept
  }

  fn request_authorization(
    &self
  ) -> bool {
    self.available
  }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;

  fs::metadata(path)
    .map(|meta| {
      meta.is_file()
        && meta.permissions().mode() & 0o111
          != 0
    })
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
  path.is_file()
}
