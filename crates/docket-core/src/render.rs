use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use unicode_width::UnicodeWidthStr;

use crate::calendar::MonthGrid;
use crate::config::Config;
use crate::datetime::{DATE_FORMAT, TIME_FORMAT};
use crate::stats::Stats;
use crate::task::{Priority, Task};

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    #[tracing::instrument(skip(self, tasks, now))]
    pub fn print_task_table(&mut self, tasks: &[Task], now: NaiveDateTime) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        if tasks.is_empty() {
            writeln!(out, "No tasks.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            " ".to_string(),
            "Pri".to_string(),
            "Category".to_string(),
            "Due".to_string(),
            "Title".to_string(),
        ];

        let mut rows = Vec::with_capacity(tasks.len());

        for task in tasks {
            let id = self.paint(short_id(&task.id), "33");
            let done = if task.completed { "x" } else { " " }.to_string();
            let priority = self.paint_priority(task.priority);
            let due = format_due(task);
            let due = if task.is_overdue(now) {
                self.paint(&due, "31")
            } else {
                due
            };
            let title = if task.completed {
                self.paint(&task.title, "2")
            } else {
                task.title.clone()
            };

            rows.push(vec![id, done, priority, task.category.clone(), due, title]);
        }

        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, task))]
    pub fn print_task_info(&mut self, task: &Task, now: NaiveDateTime) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id          {}", task.id)?;
        writeln!(out, "title       {}", task.title)?;
        if !task.description.is_empty() {
            writeln!(out, "description {}", task.description)?;
        }
        writeln!(
            out,
            "status      {}",
            if task.completed { "completed" } else { "pending" }
        )?;
        writeln!(out, "priority    {}", task.priority)?;
        writeln!(out, "category    {}", task.category)?;
        if task.due_date.is_some() {
            let due = format_due(task);
            if task.is_overdue(now) {
                writeln!(out, "due         {} {}", due, self.paint("(overdue)", "31"))?;
            } else {
                writeln!(out, "due         {due}")?;
            }
        }
        writeln!(out, "created     {}", task.created_at.to_rfc3339())?;
        writeln!(out, "updated     {}", task.updated_at.to_rfc3339())?;
        Ok(())
    }

    pub fn print_stats(&mut self, stats: &Stats) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "Total      {}", stats.total)?;
        writeln!(out, "Pending    {}", stats.pending)?;
        writeln!(out, "Completed  {}", stats.completed)?;
        let overdue = stats.overdue.to_string();
        let overdue = if stats.overdue > 0 {
            self.paint(&overdue, "31")
        } else {
            overdue
        };
        writeln!(out, "Overdue    {overdue}")?;
        Ok(())
    }

    pub fn print_categories(&mut self, categories: &[String], tasks: &[Task]) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let headers = vec!["Category".to_string(), "Tasks".to_string()];
        let rows = categories
            .iter()
            .map(|name| {
                let count = tasks.iter().filter(|t| &t.category == name).count();
                vec![name.clone(), count.to_string()]
            })
            .collect();
        write_table(&mut out, headers, rows)
    }

    /// Month grid; days with open tasks are marked `*`, days whose tasks
    /// are all done are marked `+`.
    pub fn print_month(&mut self, grid: &MonthGrid, today: NaiveDate) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        let label = NaiveDate::from_ymd_opt(grid.year, grid.month, 1)
            .map(|d| d.format("%B %Y").to_string())
            .unwrap_or_default();
        writeln!(out, "{label:^28}")?;
        writeln!(out, " Mo  Tu  We  Th  Fr  Sa  Su")?;

        for week in &grid.weeks {
            for cell in week {
                match cell {
                    None => write!(out, "    ")?,
                    Some(cell) => {
                        let marker = if cell.pending > 0 {
                            "*"
                        } else if cell.due > 0 {
                            "+"
                        } else {
                            " "
                        };
                        let text = format!("{:>3}{marker}", cell.date.day());
                        let text = if cell.date == today {
                            self.paint(&text, "7")
                        } else if cell.pending > 0 {
                            self.paint(&text, "33")
                        } else {
                            text
                        };
                        write!(out, "{text}")?;
                    }
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn paint_priority(&self, priority: Priority) -> String {
        match priority {
            Priority::High => self.paint("H", "31"),
            Priority::Medium => self.paint("M", "33"),
            Priority::Low => self.paint("L", "32"),
        }
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn short_id(id: &str) -> &str {
    id.char_indices()
        .nth(SHORT_ID_LEN)
        .map(|(idx, _)| &id[..idx])
        .unwrap_or(id)
}

fn format_due(task: &Task) -> String {
    match (task.due_date, task.due_time) {
        (Some(date), Some(time)) => {
            format!("{} {}", date.format(DATE_FORMAT), time.format(TIME_FORMAT))
        }
        (Some(date), None) => date.format(DATE_FORMAT).to_string(),
        (None, _) => String::new(),
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for idx in 0..column_count {
        write!(writer, "{:-<width$} ", "", width = widths[idx])?;
    }
    writeln!(writer)?;

    for row in rows {
        for idx in 0..column_count {
            let cell = &row[idx];
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
