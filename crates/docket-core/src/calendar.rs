use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::{
  Datelike,
  Days,
  NaiveDate
};

use crate::task::Task;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq,
)]
pub struct DayCell {
  pub date:    NaiveDate,
  pub due:     usize,
  pub pending: usize
}

/// A month laid out in Monday-first weeks.
/// Cells outside the month are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthGrid {
  pub year:  i32,
  pub month: u32,
  pub weeks: Vec<[Option<DayCell>; 7]>
}

/// Tasks that carry a due date, keyed by
/// that date. Input order is kept within
/// a day.
pub fn tasks_by_date(
  tasks: &[Task]
) -> BTreeMap<NaiveDate, Vec<&Task>> {
  let mut dates: BTreeMap<
    NaiveDate,
    Vec<&Task>
  > = BTreeMap::new();
  for task in tasks {
    if let Some(date) = task.due_date {
      dates
        .entry(date)
        .or_default()
        .push(task);
    }
  }
  dates
}

pub fn tasks_on(
  tasks: &[Task],
  date: NaiveDate
) -> Vec<&Task> {
  tasks
    .iter()
    .filter(|task| {
      task.due_date == Some(date)
    })
    .collect()
}

#[tracing::instrument(skip(tasks))]
pub fn month_grid(
  year: i32,
  month: u32,
  tasks: &[Task]
) -> anyhow::Result<MonthGrid> {
  let first = NaiveDate::from_ymd_opt(
    year, month, 1
  )
  .ok_or_else(|| {
    anyhow!(
      "invalid month: {year}-{month:02}"
    )
  })?;
  let by_date = tasks_by_date(tasks);

  let mut weeks = Vec::new();
  let mut week: [Option<DayCell>; 7] =
    [None; 7];
  let mut column = first
    .weekday()
    .num_days_from_monday()
    as usize;

  let mut day = first;
  while day.month() == month {
    let on_day = by_date.get(&day);
    week[column] = Some(DayCell {
      date:    day,
      due:     on_day
        .map(Vec::len)
        .unwrap_or(0),
      pending: on_day
        .map(|tasks| {
          tasks
            .iter()
            .filter(|t| !t.completed)
            .count()
        })
        .unwrap_or(0)
    });

    column += 1;
    if column == 7 {
      weeks.push(week);
      week = [None; 7];
      column = 0;
    }

    let Some(next) =
      day.checked_add_days(Days::new(1))
    else {
      break;
    };
    day = next;
  }

  if column > 0 {
    weeks.push(week);
  }

  Ok(MonthGrid {
    year,
    month,
    weeks
  })
}

/// Parses `YYYY-MM`.
pub fn parse_year_month(
  input: &str
) -> anyhow::Result<(i32, u32)> {
  let (year, month) = input
    .trim()
    .split_once('-')
    .ok_or_else(|| {
      anyhow!(
        "expected YYYY-MM, got: {input}"
      )
    })?;
  let year = year.parse::<i32>().map_err(
    |_| anyhow!("invalid year in {input}")
  )?;
  let month =
    month.parse::<u32>().map_err(|_| {
      anyhow!("invalid month in {input}")
    })?;
  if !(1..=12).contains(&month) {
    return Err(anyhow!(
      "month out of range in {input}"
    ));
  }
  Ok((year, month))
}
