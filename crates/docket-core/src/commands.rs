use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{Datelike, NaiveDateTime, Utc};
use tokio::task::LocalSet;
use tracing::{debug, error, info, instrument};

use crate::calendar::{month_grid, parse_year_month, tasks_on};
use crate::cli::{AddArgs, Command, EditArgs, ListArgs};
use crate::config::Config;
use crate::datastore::TaskStore;
use crate::datetime::{parse_due_date, parse_due_time, to_user_local, user_today};
use crate::filter::{FilterState, SortBy, SortOrder, compare_tasks, view};
use crate::notify::{
    CommandSink, DEFAULT_LEAD_MINUTES, DEFAULT_POLL_SECONDS, DueNotifier, NotificationSink,
    NotifierState, TerminalSink,
};
use crate::render::{Renderer, short_id};
use crate::schedule::Poller;
use crate::stats::Stats;
use crate::storage::KeyValueStore;
use crate::task::{DEFAULT_CATEGORY, NewTask, Task, TaskPatch};

const MAX_POLL_SECONDS: u64 = 24 * 60 * 60;

#[instrument(skip(store, cfg, renderer, command))]
pub fn dispatch<K>(
    store: &mut TaskStore<K>,
    cfg: &Config,
    renderer: &mut Renderer,
    command: Command,
) -> anyhow::Result<()>
where
    K: KeyValueStore + Clone + 'static,
{
    let now = Utc::now();
    debug!(?command, "dispatching command");

    match command {
        Command::Add(args) => cmd_add(store, cfg, args, now),
        Command::List(args) => cmd_list(store, cfg, renderer, args, now),
        Command::Show { id } => cmd_show(store, renderer, &id, now),
        Command::Edit(args) => cmd_edit(store, args, now),
        Command::Done { id } => cmd_done(store, &id, now),
        Command::Delete { id } => cmd_delete(store, &id),
        Command::Categories => renderer.print_categories(store.categories(), store.tasks()),
        Command::CategoryAdd { name } => cmd_category_add(store, &name),
        Command::Stats => cmd_stats(store, renderer, now),
        Command::Calendar { month } => cmd_calendar(store, renderer, month.as_deref(), now),
        Command::Agenda { date } => cmd_agenda(store, renderer, date.as_deref(), now),
        Command::Watch => cmd_watch(store, cfg),
        Command::NotifyTest => cmd_notify_test(cfg),
    }
}

#[instrument(skip(store, cfg, args, now))]
fn cmd_add<K: KeyValueStore>(
    store: &mut TaskStore<K>,
    cfg: &Config,
    args: AddArgs,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command add");

    let title = args.title.join(" ").trim().to_string();
    if title.is_empty() {
        return Err(anyhow!("task title cannot be empty"));
    }

    let category = match args.category {
        Some(category) => category.trim().to_string(),
        None => cfg
            .get("default.category")
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
    };
    ensure_category(store, &category)?;

    let today = user_today(now);
    let due_date = args
        .due
        .as_deref()
        .map(|raw| parse_due_date(raw, today))
        .transpose()?;
    let due_time = args.time.as_deref().map(parse_due_time).transpose()?;
    if due_time.is_some() && due_date.is_none() {
        return Err(anyhow!("--time needs --due"));
    }

    let draft = NewTask {
        title,
        description: args.description.map(|d| d.trim().to_string()),
        priority: args.priority,
        category: Some(category),
        due_date,
        due_time,
    };

    let task = store.add(draft, now)?;
    debug!(id = %task.id, "task added");
    println!("Created task {}.", short_id(&task.id));
    Ok(())
}

#[instrument(skip(store, cfg, renderer, args, now))]
fn cmd_list<K: KeyValueStore>(
    store: &TaskStore<K>,
    cfg: &Config,
    renderer: &mut Renderer,
    args: ListArgs,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command list");

    let filter = FilterState {
        search: args.search.trim().to_string(),
        category: args.category.parse()?,
        priority: args.priority.parse()?,
        status: args.status.parse()?,
    };

    let sort_by = match args.sort {
        Some(raw) => raw.parse::<SortBy>()?,
        None => cfg.get_parsed::<SortBy>("default.sort")?.unwrap_or_default(),
    };
    let sort_order = match args.order {
        Some(raw) => raw.parse::<SortOrder>()?,
        None => cfg
            .get_parsed::<SortOrder>("default.order")?
            .unwrap_or_default(),
    };

    let rows = view(store.tasks(), &filter, sort_by, sort_order);
    debug!(
        shown = rows.len(),
        total = store.tasks().len(),
        %sort_by,
        %sort_order,
        "listing tasks"
    );
    renderer.print_task_table(&rows, to_user_local(now))
}

#[instrument(skip(store, renderer, now))]
fn cmd_show<K: KeyValueStore>(
    store: &TaskStore<K>,
    renderer: &mut Renderer,
    id: &str,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command show");
    let id = store.resolve_id(id)?;
    let task = store
        .get(&id)
        .ok_or_else(|| anyhow!("no task matches id {id}"))?;
    renderer.print_task_info(task, to_user_local(now))
}

#[instrument(skip(store, args, now), fields(id = %args.id))]
fn cmd_edit<K: KeyValueStore>(
    store: &mut TaskStore<K>,
    args: EditArgs,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command edit");

    let id = store.resolve_id(&args.id)?;
    let today = user_today(now);

    let title = match args.title {
        Some(title) if title.trim().is_empty() => {
            return Err(anyhow!("task title cannot be empty"));
        }
        Some(title) => Some(title.trim().to_string()),
        None => None,
    };

    let category = args.category.map(|c| c.trim().to_string());
    if let Some(category) = &category {
        ensure_category(store, category)?;
    }

    let due_date = if args.clear_due {
        Some(None)
    } else {
        args.due
            .as_deref()
            .map(|raw| parse_due_date(raw, today).map(Some))
            .transpose()?
    };
    let due_time = if args.clear_time {
        Some(None)
    } else if let Some(raw) = args.time.as_deref() {
        Some(Some(parse_due_time(raw)?))
    } else if args.clear_due {
        Some(None)
    } else {
        None
    };

    if let Some(Some(_)) = due_time {
        let resulting_date = match due_date {
            Some(date) => date,
            None => store.get(&id).and_then(|task| task.due_date),
        };
        if resulting_date.is_none() {
            return Err(anyhow!("--time needs a due date; pass --due as well"));
        }
    }

    let patch = TaskPatch {
        title,
        description: args.description.map(|d| d.trim().to_string()),
        completed: None,
        priority: args.priority,
        category,
        due_date,
        due_time,
    };
    if patch.is_empty() {
        return Err(anyhow!("nothing to change; pass at least one field"));
    }

    store.update(&id, patch, now)?;
    println!("Modified task {}.", short_id(&id));
    Ok(())
}

#[instrument(skip(store, now))]
fn cmd_done<K: KeyValueStore>(
    store: &mut TaskStore<K>,
    id: &str,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command done");
    let id = store.resolve_id(id)?;
    store.toggle_complete(&id, now)?;

    let completed = store.get(&id).is_some_and(|t| t.completed);
    if completed {
        println!("Completed task {}.", short_id(&id));
    } else {
        println!("Reopened task {}.", short_id(&id));
    }
    Ok(())
}

#[instrument(skip(store))]
fn cmd_delete<K: KeyValueStore>(store: &mut TaskStore<K>, id: &str) -> anyhow::Result<()> {
    info!("command delete");
    let id = store.resolve_id(id)?;
    store.remove(&id)?;
    println!("Deleted task {}.", short_id(&id));
    Ok(())
}

#[instrument(skip(store))]
fn cmd_category_add<K: KeyValueStore>(store: &mut TaskStore<K>, name: &str) -> anyhow::Result<()> {
    info!("command category-add");
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("category name cannot be empty"));
    }
    if store.add_category(name)? {
        println!("Added category {name}.");
    } else {
        println!("Category {name} already exists.");
    }
    Ok(())
}

#[instrument(skip(store, renderer, now))]
fn cmd_stats<K: KeyValueStore>(
    store: &TaskStore<K>,
    renderer: &mut Renderer,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command stats");
    let stats = Stats::compute(store.tasks(), to_user_local(now));
    renderer.print_stats(&stats)
}

#[instrument(skip(store, renderer, now))]
fn cmd_calendar<K: KeyValueStore>(
    store: &TaskStore<K>,
    renderer: &mut Renderer,
    month: Option<&str>,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command calendar");
    let today = user_today(now);
    let (year, month) = match month {
        Some(raw) => parse_year_month(raw)?,
        None => (today.year(), today.month()),
    };
    let grid = month_grid(year, month, store.tasks())?;
    renderer.print_month(&grid, today)
}

#[instrument(skip(store, renderer, now))]
fn cmd_agenda<K: KeyValueStore>(
    store: &TaskStore<K>,
    renderer: &mut Renderer,
    date: Option<&str>,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command agenda");
    let local_now = to_user_local(now);
    let date = match date {
        Some(raw) => parse_due_date(raw, local_now.date())?,
        None => local_now.date(),
    };

    let mut rows: Vec<Task> = tasks_on(store.tasks(), date).into_iter().cloned().collect();
    rows.sort_by(|a, b| compare_tasks(a, b, SortBy::DueDate));
    println!("{}", date.format("%A, %B %-d %Y"));
    renderer.print_task_table(&rows, local_now)
}

/// Builds the sink selected by `notify.sink`.
pub fn build_sink(cfg: &Config) -> anyhow::Result<Box<dyn NotificationSink>> {
    let kind = cfg
        .get("notify.sink")
        .unwrap_or_else(|| "command".to_string());
    match kind.trim().to_ascii_lowercase().as_str() {
        "command" => {
            let program = cfg
                .get("notify.command")
                .unwrap_or_else(|| "notify-send".to_string());
            Ok(Box::new(CommandSink::new(program)))
        }
        "terminal" => Ok(Box::new(TerminalSink)),
        other => Err(anyhow!(
            "invalid value for notify.sink: {other} (use command or terminal)"
        )),
    }
}

/// One watch cycle: reread the stored tasks, drop bookkeeping for deleted
/// ones, then fire for anything coming due.
pub fn watch_tick<K, S>(notifier: &mut DueNotifier<S>, storage: &K, now: NaiveDateTime) -> Vec<String>
where
    K: KeyValueStore + Clone,
    S: NotificationSink,
{
    let current = TaskStore::load(storage.clone());
    notifier.forget_missing(current.tasks());
    notifier.check(current.tasks(), now)
}

#[instrument(skip(store, cfg))]
fn cmd_watch<K>(store: &TaskStore<K>, cfg: &Config) -> anyhow::Result<()>
where
    K: KeyValueStore + Clone + 'static,
{
    info!("command watch");

    let lead_minutes = cfg
        .get_parsed::<u32>("notify.lead_minutes")?
        .unwrap_or(DEFAULT_LEAD_MINUTES);
    let interval = watch_interval(cfg)?;

    let mut notifier = DueNotifier::with_lead_minutes(build_sink(cfg)?, lead_minutes);
    if notifier.authorize() != NotifierState::Enabled {
        return Err(anyhow!(
            "notifications are unavailable; check notify.sink and notify.command"
        ));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let storage = store.storage().clone();
    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let handle = Poller::spawn(interval, move || {
            let fired = watch_tick(&mut notifier, &storage, to_user_local(Utc::now()));
            if !fired.is_empty() {
                debug!(count = fired.len(), "due-soon notifications sent");
            }
        });

        println!(
            "Watching for tasks due within {lead_minutes} minutes. Press Ctrl-C to stop."
        );
        wait_for_shutdown_signal().await;
        info!("shutdown signal received; stopping watch");
        handle.stop().await;
    });

    Ok(())
}

/// Poll period from `notify.interval_seconds`, between one second and one
/// day.
pub fn watch_interval(cfg: &Config) -> anyhow::Result<Duration> {
    let seconds = cfg
        .get_parsed::<u64>("notify.interval_seconds")?
        .unwrap_or(DEFAULT_POLL_SECONDS);
    if !(1..=MAX_POLL_SECONDS).contains(&seconds) {
        return Err(anyhow!(
            "notify.interval_seconds must be between 1 and {MAX_POLL_SECONDS}, got {seconds}"
        ));
    }
    Ok(Duration::from_secs(seconds))
}

#[instrument(skip(cfg))]
fn cmd_notify_test(cfg: &Config) -> anyhow::Result<()> {
    info!("command notify-test");
    let notifier = DueNotifier::new(build_sink(cfg)?);
    if notifier.test_notification() {
        println!("Test notification sent.");
        Ok(())
    } else {
        Err(anyhow!("test notification could not be shown"))
    }
}

fn ensure_category<K: KeyValueStore>(store: &TaskStore<K>, category: &str) -> anyhow::Result<()> {
    if store.has_category(category) {
        return Ok(());
    }
    Err(anyhow!(
        "unknown category: {category} (known: {}; add it with `docket category-add`)",
        store.categories().join(", ")
    ))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            error!(%error, "failed to register SIGINT handler; falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            error!(%error, "failed to register SIGTERM handler; falling back to ctrl_c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed waiting for ctrl_c signal");
    }
}
