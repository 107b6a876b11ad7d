use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use tracing::trace;

use crate::task::{
  Priority,
  Task
};

#[derive(
  Debug, Clone, Default, PartialEq, Eq,
)]
pub enum CategoryFilter {
  #[default]
  All,
  Named(String)
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
pub enum PriorityFilter {
  #[default]
  All,
  Only(Priority)
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
pub enum StatusFilter {
  #[default]
  All,
  Pending,
  Completed
}

/// Narrowing criteria. All predicates
/// are AND-combined.
#[derive(
  Debug, Clone, Default, PartialEq, Eq,
)]
pub struct FilterState {
  pub search:   String,
  pub category: CategoryFilter,
  pub priority: PriorityFilter,
  pub status:   StatusFilter
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
pub enum SortBy {
  #[default]
  CreatedAt,
  Title,
  Priority,
  DueDate
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
)]
pub enum SortOrder {
  Asc,
  #[default]
  Desc
}

impl FromStr for CategoryFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
      return Err(anyhow!(
        "category filter cannot be \
         empty"
      ));
    }
    if trimmed == "all" {
      Ok(Self::All)
    } else {
      Ok(Self::Named(
        trimmed.to_string()
      ))
    }
  }
}

impl FromStr for PriorityFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s.trim() {
      | "all" => Ok(Self::All),
      | other => {
        Ok(Self::Only(other.parse()?))
      }
    }
  }
}

impl FromStr for StatusFilter {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "all" => Ok(Self::All),
      | "pending" => Ok(Self::Pending),
      | "completed" | "done" => {
        Ok(Self::Completed)
      }
      | other => {
        Err(anyhow!(
          "invalid status filter: \
           {other} (expected all, \
           pending or completed)"
        ))
      }
    }
  }
}

impl FromStr for SortBy {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s.trim() {
      | "createdAt" | "created" => {
        Ok(Self::CreatedAt)
      }
      | "title" => Ok(Self::Title),
      | "priority" => Ok(Self::Priority),
      | "dueDate" | "due" => {
        Ok(Self::DueDate)
      }
      | other => {
        Err(anyhow!(
          "invalid sort field: {other} \
           (expected createdAt, title, \
           priority or dueDate)"
        ))
      }
    }
  }
}

impl FromStr for SortOrder {
  type Err = anyhow::Error;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "asc" => Ok(Self::Asc),
      | "desc" => Ok(Self::Desc),
      | other => {
        Err(anyhow!(
          "invalid sort order: {other} \
           (expected asc or desc)"
        ))
      }
    }
  }
}

impl fmt::Display for SortBy {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(match self {
      | Self::CreatedAt => "createdAt",
      | Self::Title => "title",
      | Self::Priority => "priority",
      | Self::DueDate => "dueDate"
    })
  }
}

impl fmt::Display for SortOrder {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(match self {
      | Self::Asc => "asc",
      | Self::Desc => "desc"
    })
  }
}

impl FilterState {
  pub fn matches(
    &self,
    task: &Task
  ) -> bool {
    let search =
      self.search.to_lowercase();
    self.matches_with_needle(
      task, &search
    )
  }

  fn matches_with_needle(
    &self,
    task: &Task,
    needle_lower: &str
  ) -> bool {
    if !task.matches_text(needle_lower)
    {
      return false;
    }

    if let CategoryFilter::Named(name) =
      &self.category
      && &task.category != name
    {
      return false;
    }

    if let PriorityFilter::Only(
      priority
    ) = self.priority
      && task.priority != priority
    {
      return false;
    }

    match self.status {
      | StatusFilter::All => true,
      | StatusFilter::Pending => {
        !task.completed
      }
      | StatusFilter::Completed => {
        task.completed
      }
    }
  }
}

/// Filters `tasks` and orders the
/// survivors. The sort is stable, so ties
/// keep their input order in both
/// directions.
#[tracing::instrument(skip(tasks, filter), fields(count = tasks.len()))]
pub fn view(
  tasks: &[Task],
  filter: &FilterState,
  sort_by: SortBy,
  sort_order: SortOrder
) -> Vec<Task> {
  let needle =
    filter.search.to_lowercase();
  let mut rows: Vec<Task> = tasks
    .iter()
    .filter(|task| {
      filter.matches_with_needle(
        task, &needle
      )
    })
    .cloned()
    .collect();

  rows.sort_by(|a, b| {
    let ordering =
      compare_tasks(a, b, sort_by);
    match sort_order {
      | SortOrder::Asc => ordering,
      | SortOrder::Desc => {
        ordering.reverse()
      }
    }
  });

  trace!(
    kept = rows.len(),
    "filtered and sorted tasks"
  );
  rows
}

/// Ascending comparison. For `DueDate` an
/// undated task always compares greater,
/// before any direction flip, so undated
/// tasks lead a descending list.
pub fn compare_tasks(
  a: &Task,
  b: &Task,
  sort_by: SortBy
) -> Ordering {
  match sort_by {
    | SortBy::Title => {
      locale_compare(&a.title, &b.title)
    }
    | SortBy::Priority => {
      a.priority
        .rank()
        .cmp(&b.priority.rank())
    }
    | SortBy::DueDate => {
      match (
        a.effective_due(),
        b.effective_due()
      ) {
        | (None, None) => Ordering::Equal,
        | (None, Some(_)) => {
          Ordering::Greater
        }
        | (Some(_), None) => {
          Ordering::Less
        }
        | (Some(x), Some(y)) => x.cmp(&y)
      }
    }
    | SortBy::CreatedAt => {
      a.created_at.cmp(&b.created_at)
    }
  }
}

/// Accent- and case-insensitive first,
/// then lowercase before uppercase, then
/// raw code points.
pub fn locale_compare(
  a: &str,
  b: &str
) -> Ordering {
  fold(a)
    .cmp(&fold(b))
    .then_with(|| {
      case_marks(a).cmp(&case_marks(b))
    })
    .then_with(|| a.cmp(b))
}

fn fold(s: &str) -> String {
  deunicode::deunicode(s).to_lowercase()
}

fn case_marks(s: &str) -> Vec<bool> {
  s.chars()
    .filter(|c| c.is_alphabetic())
    .map(char::is_uppercase)
    .collect()
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use chrono::{
    Duration,
    NaiveDate,
    NaiveTime,
    TimeZone,
    Utc
  };

  use super::{
    CategoryFilter,
    FilterState,
    PriorityFilter,
    SortBy,
    SortOrder,
    StatusFilter,
    locale_compare,
    view
  };
  use crate::task::{
    NewTask,
    Priority,
    Task
  };

  fn task(
    id: &str,
    title: &str,
    minutes: i64
  ) -> Task {
    let base = Utc
      .with_ymd_and_hms(
        2024, 1, 1, 8, 0, 0
      )
      .single()
      .expect("valid base");
    NewTask::titled(title).into_task(
      id.to_string(),
      base + Duration::minutes(minutes)
    )
  }

  fn ids(tasks: &[Task]) -> Vec<&str> {
    tasks
      .iter()
      .map(|t| t.id.as_str())
      .collect()
  }

  fn sample() -> Vec<Task> {
    let mut a = task("a", "Write report", 0);
    a.description =
      "quarterly NUMBERS".to_string();
    a.category = "Work".to_string();
    a.priority = Priority::High;

    let mut b = task("b", "buy milk", 1);
    b.category = "Shopping".to_string();
    b.priority = Priority::Low;
    b.completed = true;

    let mut c = task("c", "Call mom", 2);
    c.due_date =
      NaiveDate::from_ymd_opt(2024, 1, 2);

    vec![a, b, c]
  }

  #[test]
  fn empty_filter_keeps_everything() {
    let rows = view(
      &sample(),
      &FilterState::default(),
      SortBy::CreatedAt,
      SortOrder::Asc
    );
    assert_eq!(ids(&rows), ["a", "b", "c"]);

    let rows = view(
      &sample(),
      &FilterState::default(),
      SortBy::CreatedAt,
      SortOrder::Desc
    );
    assert_eq!(ids(&rows), ["c", "b", "a"]);
  }

  #[test]
  fn search_matches_title_or_description()
  {
    let filter = FilterState {
      search: "numbers".to_string(),
      ..FilterState::default()
    };
    let rows = view(
      &sample(),
      &filter,
      SortBy::CreatedAt,
      SortOrder::Asc
    );
    assert_eq!(ids(&rows), ["a"]);

    let filter = FilterState {
      search: "MILK".to_string(),
      ..FilterState::default()
    };
    let rows = view(
      &sample(),
      &filter,
      SortBy::CreatedAt,
      SortOrder::Asc
    );
    assert_eq!(ids(&rows), ["b"]);
  }

  #[test]
  fn category_and_priority_are_exact() {
    let filter = FilterState {
      category: CategoryFilter::Named(
        "work".to_string()
      ),
      ..FilterState::default()
    };
    assert!(
      view(
        &sample(),
        &filter,
        SortBy::CreatedAt,
        SortOrder::Asc
      )
      .is_empty()
    );

    let filter = FilterState {
      category: CategoryFilter::Named(
        "Work".to_string()
      ),
      priority: PriorityFilter::Only(
        Priority::High
      ),
      ..FilterState::default()
    };
    let rows = view(
      &sample(),
      &filter,
      SortBy::CreatedAt,
      SortOrder::Asc
    );
    assert_eq!(ids(&rows), ["a"]);
  }

  #[test]
  fn status_filters_partition_the_list() {
    let base = sample();
    let completed = view(
      &base,
      &FilterState {
        status: StatusFilter::Completed,
        ..FilterState::default()
      },
      SortBy::CreatedAt,
      SortOrder::Asc
    );
    let pending = view(
      &base,
      &FilterState {
        status: StatusFilter::Pending,
        ..FilterState::default()
      },
      SortBy::CreatedAt,
      SortOrder::Asc
    );

    let completed_ids: BTreeSet<_> =
      ids(&completed).into_iter().collect();
    let pending_ids: BTreeSet<_> =
      ids(&pending).into_iter().collect();
    let all_ids: BTreeSet<_> =
      ids(&base).into_iter().collect();

    assert!(
      completed_ids
        .is_disjoint(&pending_ids)
    );
    let union: BTreeSet<_> = completed_ids
      .union(&pending_ids)
      .copied()
      .collect();
    assert_eq!(union, all_ids);
  }

  #[test]
  fn title_desc_is_reverse_of_asc() {
    let base = vec![
      task("1", "banana", 0),
      task("2", "Apple", 1),
      task("3", "cherry", 2),
      task("4", "Éclair", 3),
    ];
    let mut asc = view(
      &base,
      &FilterState::default(),
      SortBy::Title,
      SortOrder::Asc
    );
    let desc = view(
      &base,
      &FilterState::default(),
      SortBy::Title,
      SortOrder::Desc
    );
    assert_eq!(
      ids(&asc),
      ["2", "1", "3", "4"]
    );
    asc.reverse();
    assert_eq!(ids(&asc), ids(&desc));
  }

  #[test]
  fn priority_sort_is_stable() {
    let mut first = task("1", "x", 0);
    first.priority = Priority::Low;
    let mut second = task("2", "y", 1);
    second.priority = Priority::High;
    let mut third = task("3", "z", 2);
    third.priority = Priority::Low;
    let mut fourth = task("4", "w", 3);
    fourth.priority = Priority::High;
    let base =
      vec![first, second, third, fourth];

    let asc = view(
      &base,
      &FilterState::default(),
      SortBy::Priority,
      SortOrder::Asc
    );
    assert_eq!(
      ids(&asc),
      ["2", "4", "1", "3"]
    );

    let desc = view(
      &base,
      &FilterState::default(),
      SortBy::Priority,
      SortOrder::Desc
    );
    assert_eq!(
      ids(&desc),
      ["1", "3", "2", "4"]
    );
  }

  #[test]
  fn undated_tasks_lead_descending_due_sort()
  {
    let mut dated = task("dated", "d", 0);
    dated.due_date =
      NaiveDate::from_ymd_opt(2024, 3, 1);
    let undated = task("undated", "u", 1);
    let base = vec![undated, dated];

    let asc = view(
      &base,
      &FilterState::default(),
      SortBy::DueDate,
      SortOrder::Asc
    );
    assert_eq!(
      ids(&asc),
      ["dated", "undated"]
    );

    let desc = view(
      &base,
      &FilterState::default(),
      SortBy::DueDate,
      SortOrder::Desc
    );
    assert_eq!(
      ids(&desc),
      ["undated", "dated"]
    );
  }

  #[test]
  fn due_sort_uses_time_and_end_of_day() {
    let mut morning = task("am", "a", 0);
    morning.due_date =
      NaiveDate::from_ymd_opt(2024, 1, 1);
    morning.due_time =
      NaiveTime::from_hms_opt(9, 0, 0);
    let mut whole_day =
      task("day", "b", 1);
    whole_day.due_date =
      NaiveDate::from_ymd_opt(2024, 1, 1);
    let mut evening = task("pm", "c", 2);
    evening.due_date =
      NaiveDate::from_ymd_opt(2024, 1, 1);
    evening.due_time =
      NaiveTime::from_hms_opt(22, 0, 0);

    let rows = view(
      &[whole_day, evening, morning],
      &FilterState::default(),
      SortBy::DueDate,
      SortOrder::Asc
    );
    assert_eq!(
      ids(&rows),
      ["am", "pm", "day"]
    );
  }

  #[test]
  fn locale_compare_folds_case_and_accents()
  {
    use std::cmp::Ordering;

    assert_eq!(
      locale_compare("apple", "Banana"),
      Ordering::Less
    );
    assert_eq!(
      locale_compare("a", "A"),
      Ordering::Less
    );
    assert_eq!(
      locale_compare("éclair", "eclairs"),
      Ordering::Less
    );
  }

  #[test]
  fn parses_filter_strings() {
    assert_eq!(
      "all"
        .parse::<CategoryFilter>()
        .expect("all"),
      CategoryFilter::All
    );
    assert_eq!(
      "high"
        .parse::<PriorityFilter>()
        .expect("high"),
      PriorityFilter::Only(
        Priority::High
      )
    );
    assert_eq!(
      "dueDate"
        .parse::<SortBy>()
        .expect("dueDate"),
      SortBy::DueDate
    );
    assert!("sideways".parse::<SortOrder>().is_err());
  }
}
