use std::collections::BTreeSet;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datetime::{due_date_serde, due_time_serde};
use crate::storage::KeyValueStore;
use crate::task::{DEFAULT_CATEGORIES, NewTask, Priority, Task, TaskPatch};

pub const STORAGE_KEY: &str = "todo-app-data";

/// Receives the previous slot contents before the first save that would
/// replace data which did not load cleanly.
pub const BACKUP_KEY: &str = "todo-app-data.bak";

#[derive(Debug, Serialize)]
struct Snapshot<'a> {
    todos: &'a [Task],
    categories: &'a [String],
}

#[derive(Debug)]
struct Decoded {
    tasks: Vec<Task>,
    categories: Vec<String>,
    lossy: bool,
}

impl Decoded {
    fn fresh(lossy: bool) -> Self {
        Self {
            tasks: Vec::new(),
            categories: default_categories(),
            lossy,
        }
    }
}

pub fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

/// Owns the task list and category set and mirrors both into one storage
/// slot after every change. The in-memory state is authoritative.
#[derive(Debug)]
pub struct TaskStore<K: KeyValueStore> {
    storage: K,
    tasks: Vec<Task>,
    categories: Vec<String>,
    pending_backup: Option<String>,
}

impl<K: KeyValueStore> TaskStore<K> {
    /// Loads the persisted slot record by record. Records with bad fields
    /// are repaired where a default exists and skipped otherwise; an
    /// unreadable slot yields an empty task list and the default
    /// categories. Whenever anything was lost or rewritten the raw slot is
    /// copied to [`BACKUP_KEY`] on the next save.
    #[tracing::instrument(skip(storage))]
    pub fn load(storage: K) -> Self {
        let (decoded, raw) = match storage.get(STORAGE_KEY) {
            Ok(Some(raw)) => (decode_snapshot(&raw), Some(raw)),
            Ok(None) => {
                debug!("no stored task data; starting fresh");
                (Decoded::fresh(false), None)
            }
            Err(err) => {
                warn!(error = %err, "failed reading stored task data; starting fresh");
                (Decoded::fresh(false), None)
            }
        };

        info!(
            tasks = decoded.tasks.len(),
            categories = decoded.categories.len(),
            lossy = decoded.lossy,
            "loaded task store"
        );

        Self {
            storage,
            tasks: decoded.tasks,
            categories: decoded.categories,
            pending_backup: raw.filter(|_| decoded.lossy),
        }
    }

    #[tracing::instrument(skip(self), fields(tasks = self.tasks.len()))]
    pub fn save(&mut self) -> anyhow::Result<()> {
        if let Some(previous) = self.pending_backup.as_deref() {
            self.storage
                .set(BACKUP_KEY, previous)
                .context("failed to back up previous task data")?;
            info!(key = BACKUP_KEY, "backed up previous task data");
            self.pending_backup = None;
        }

        let snapshot = Snapshot {
            todos: &self.tasks,
            categories: &self.categories,
        };
        let serialized =
            serde_json::to_string(&snapshot).context("failed to serialize task data")?;
        self.storage
            .set(STORAGE_KEY, &serialized)
            .context("failed to save task data")
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn storage(&self) -> &K {
        &self.storage
    }

    pub fn has_category(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c == name)
    }

    /// Resolves a full id or a unique id prefix.
    pub fn resolve_id(&self, prefix: &str) -> anyhow::Result<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(anyhow!("task id cannot be empty"));
        }
        if let Some(task) = self.get(prefix) {
            return Ok(task.id.clone());
        }

        let mut matches = self.tasks.iter().filter(|t| t.id.starts_with(prefix));
        let first = matches
            .next()
            .ok_or_else(|| anyhow!("no task matches id {prefix}"))?;
        if matches.next().is_some() {
            return Err(anyhow!("task id {prefix} is ambiguous; type more characters"));
        }
        Ok(first.id.clone())
    }

    /// Creates a task at the front of the list. The caller rejects blank
    /// titles before calling.
    #[tracing::instrument(skip(self, draft, now), fields(title = %draft.title))]
    pub fn add(&mut self, draft: NewTask, now: DateTime<Utc>) -> anyhow::Result<&Task> {
        let id = self.fresh_id();
        let task = draft.into_task(id, now);
        debug!(id = %task.id, "task created");
        self.tasks.insert(0, task);
        self.save()?;
        Ok(&self.tasks[0])
    }

    #[tracing::instrument(skip(self, patch, now))]
    pub fn update(&mut self, id: &str, patch: TaskPatch, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            debug!("update for unknown id ignored");
            return Ok(false);
        };
        patch.apply(task);
        task.updated_at = task.updated_at.max(now);
        self.save()?;
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    pub fn remove(&mut self, id: &str) -> anyhow::Result<bool> {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        if self.tasks.len() == before {
            debug!("remove for unknown id ignored");
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    #[tracing::instrument(skip(self, now))]
    pub fn toggle_complete(&mut self, id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            debug!("toggle for unknown id ignored");
            return Ok(false);
        };
        task.completed = !task.completed;
        task.updated_at = task.updated_at.max(now);
        debug!(completed = task.completed, "toggled completion");
        self.save()?;
        Ok(true)
    }

    #[tracing::instrument(skip(self))]
    pub fn add_category(&mut self, name: &str) -> anyhow::Result<bool> {
        if self.has_category(name) {
            return Ok(false);
        }
        self.categories.push(name.to_string());
        self.save()?;
        Ok(true)
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.get(&id).is_none() {
                return id;
            }
        }
    }
}

fn decode_snapshot(raw: &str) -> Decoded {
    let root = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(root)) => root,
        Ok(_) => {
            warn!("stored task data is not an object; starting fresh");
            return Decoded::fresh(true);
        }
        Err(err) => {
            warn!(error = %err, "stored task data is malformed; starting fresh");
            return Decoded::fresh(true);
        }
    };

    let mut lossy = false;
    let mut tasks = Vec::new();
    match root.get("todos") {
        None | Some(Value::Null) => {}
        Some(Value::Array(records)) => {
            let mut seen = BTreeSet::new();
            for record in records {
                let Some((task, repaired)) = decode_task(record) else {
                    lossy = true;
                    continue;
                };
                if !seen.insert(task.id.clone()) {
                    warn!(id = %task.id, "skipping stored task with duplicate id");
                    lossy = true;
                    continue;
                }
                lossy |= repaired;
                tasks.push(task);
            }
        }
        Some(_) => {
            warn!("stored todos is not a list; ignoring it");
            lossy = true;
        }
    }

    let categories = match root.get("categories") {
        None | Some(Value::Null) => default_categories(),
        Some(Value::Array(names)) => {
            let kept: Vec<String> = names
                .iter()
                .filter_map(|name| name.as_str().map(str::to_string))
                .collect();
            if kept.len() != names.len() {
                warn!(
                    dropped = names.len() - kept.len(),
                    "ignoring non-text stored categories"
                );
                lossy = true;
            }
            kept
        }
        Some(_) => {
            warn!("stored categories is not a list; using defaults");
            lossy = true;
            default_categories()
        }
    };

    Decoded {
        tasks,
        categories,
        lossy,
    }
}

/// Returns the task and whether it needed repair.
fn decode_task(record: &Value) -> Option<(Task, bool)> {
    if let Ok(task) = Task::deserialize(record) {
        return Some((task, false));
    }

    let id = match record.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => "<none>".to_string(),
    };
    let mut fields = match record {
        Value::Object(fields) => fields.clone(),
        _ => {
            warn!(id = %id, "skipping stored task that is not an object");
            return None;
        }
    };
    repair_fields(&mut fields);

    match Task::deserialize(&Value::Object(fields)) {
        Ok(task) => {
            warn!(id = %id, "repaired stored task with invalid fields");
            Some((task, true))
        }
        Err(err) => {
            warn!(id = %id, error = %err, "skipping unreadable stored task");
            None
        }
    }
}

/// Drops or normalises every field that has a sensible default so the
/// record deserializes; `id`, `title` and the timestamps stay required.
fn repair_fields(fields: &mut Map<String, Value>) {
    if let Some(Value::Number(id)) = fields.get("id") {
        let id = id.to_string();
        fields.insert("id".to_string(), Value::String(id));
    }

    let canonical = fields
        .get("priority")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<Priority>().ok());
    if let Some(priority) = canonical {
        fields.insert("priority".to_string(), Value::from(priority.as_str()));
    }

    drop_unless(fields, "description", Value::is_string);
    drop_unless(fields, "category", Value::is_string);
    drop_unless(fields, "completed", Value::is_boolean);
    drop_unless(fields, "priority", |v| Priority::deserialize(v).is_ok());
    drop_unless(fields, "dueDate", |v| due_date_serde::deserialize(v).is_ok());
    drop_unless(fields, "dueTime", |v| due_time_serde::deserialize(v).is_ok());

    let created = fields.get("createdAt").filter(|v| is_timestamp(v)).cloned();
    let updated = fields.get("updatedAt").filter(|v| is_timestamp(v)).cloned();
    match (created, updated) {
        (Some(created), None) => {
            fields.insert("updatedAt".to_string(), created);
        }
        (None, Some(updated)) => {
            fields.insert("createdAt".to_string(), updated);
        }
        _ => {}
    }
}

fn drop_unless(fields: &mut Map<String, Value>, key: &str, keep: impl Fn(&Value) -> bool) {
    if fields.get(key).is_some_and(|value| !keep(value)) {
        fields.remove(key);
    }
}

fn is_timestamp(value: &Value) -> bool {
    DateTime::<Utc>::deserialize(value).is_ok()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{BACKUP_KEY, STORAGE_KEY, TaskStore};
    use crate::storage::{KeyValueStore, MemoryStorage};
    use crate::task::{NewTask, Priority, TaskPatch};

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
            .single()
            .expect("valid now")
    }

    #[test]
    fn empty_storage_loads_defaults() {
        let store = TaskStore::load(MemoryStorage::new());
        assert!(store.tasks().is_empty());
        assert_eq!(
            store.categories(),
            ["Personal", "Work", "Shopping", "Health", "Other"]
        );
    }

    #[test]
    fn malformed_blob_falls_back_to_defaults() {
        let store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, "{not json"));
        assert!(store.tasks().is_empty());
        assert_eq!(store.categories().len(), 5);
    }

    #[test]
    fn blob_without_categories_gets_defaults() {
        let store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, r#"{"todos":[]}"#));
        assert_eq!(store.categories().len(), 5);
    }

    #[test]
    fn add_prepends_and_persists() {
        let mut store = TaskStore::load(MemoryStorage::new());
        let first = store
            .add(NewTask::titled("first"), now())
            .expect("add first")
            .id
            .clone();
        let second = store
            .add(NewTask::titled("second"), now())
            .expect("add second")
            .id
            .clone();

        assert_ne!(first, second);
        assert_eq!(store.tasks()[0].id, second);
        assert!(store.tasks().iter().all(|t| !t.completed));

        let raw = store
            .storage()
            .get(STORAGE_KEY)
            .expect("get")
            .expect("slot written");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["todos"].as_array().map(Vec::len), Some(2));
        assert_eq!(value["categories"].as_array().map(Vec::len), Some(5));
    }

    #[test]
    fn update_keeps_identity_and_refreshes_updated_at() {
        let mut store = TaskStore::load(MemoryStorage::new());
        let id = store
            .add(NewTask::titled("draft"), now())
            .expect("add")
            .id
            .clone();
        let created = store.get(&id).expect("task").created_at;

        let later = now() + Duration::minutes(3);
        let changed = store
            .update(
                &id,
                TaskPatch {
                    title: Some("final".to_string()),
                    priority: Some(Priority::High),
                    ..TaskPatch::default()
                },
                later,
            )
            .expect("update");
        assert!(changed);

        let task = store.get(&id).expect("task");
        assert_eq!(task.id, id);
        assert_eq!(task.created_at, created);
        assert_eq!(task.updated_at, later);
        assert_eq!(task.title, "final");
        assert_eq!(task.priority, Priority::High);

        // An earlier clock reading never moves updatedAt backwards.
        store
            .update(&id, TaskPatch::default(), now() - Duration::hours(1))
            .expect("update");
        assert_eq!(store.get(&id).expect("task").updated_at, later);
    }

    #[test]
    fn unknown_ids_are_noops() {
        let mut store = TaskStore::load(MemoryStorage::new());
        assert!(!store.update("missing", TaskPatch::default(), now()).expect("update"));
        assert!(!store.remove("missing").expect("remove"));
        assert!(!store.toggle_complete("missing", now()).expect("toggle"));
        assert_eq!(store.storage().get(STORAGE_KEY).expect("get"), None);
    }

    #[test]
    fn toggle_and_remove() {
        let mut store = TaskStore::load(MemoryStorage::new());
        let id = store.add(NewTask::titled("x"), now()).expect("add").id.clone();

        assert!(store.toggle_complete(&id, now()).expect("toggle"));
        assert!(store.get(&id).expect("task").completed);
        assert!(store.toggle_complete(&id, now()).expect("toggle"));
        assert!(!store.get(&id).expect("task").completed);

        assert!(store.remove(&id).expect("remove"));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn add_category_is_exact_match_unique() {
        let mut store = TaskStore::load(MemoryStorage::new());
        assert!(store.add_category("Errands").expect("add"));
        assert!(!store.add_category("Errands").expect("add again"));
        assert!(store.add_category("errands").expect("case differs"));
        assert_eq!(store.categories().last().map(String::as_str), Some("errands"));
    }

    #[test]
    fn one_bad_record_does_not_cost_the_rest() {
        let blob = r#"{"todos":[
            {"id":"good","title":"Keep me","description":"","completed":false,
             "priority":"high","category":"Custom","dueDate":"2024-01-01","dueTime":"09:00",
             "createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"},
            {"id":"odd","title":"Repair me","description":null,"priority":"urgent",
             "category":null,"dueTime":"half past nine",
             "createdAt":"2024-01-01T00:00:00Z"},
            {"id":"lost","title":"No timestamps"}
        ],"categories":["Personal","Work","Custom"]}"#;
        let mut store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, blob));

        assert_eq!(store.tasks().len(), 2);
        let odd = store.get("odd").expect("repaired record");
        assert_eq!(odd.description, "");
        assert_eq!(odd.priority, Priority::Medium);
        assert_eq!(odd.category, "Personal");
        assert_eq!(odd.due_time, None);
        assert_eq!(odd.updated_at, odd.created_at);
        assert!(store.get("lost").is_none());

        store.add(NewTask::titled("new"), now()).expect("add");

        let reloaded = TaskStore::load(store.storage().clone());
        assert!(reloaded.get("good").is_some());
        assert!(reloaded.get("odd").is_some());
        assert_eq!(reloaded.tasks().len(), 3);
        assert_eq!(reloaded.categories(), ["Personal", "Work", "Custom"]);

        let backup = store
            .storage()
            .get(BACKUP_KEY)
            .expect("get backup")
            .expect("backup written");
        assert_eq!(backup, blob);
    }

    #[test]
    fn lenient_fields_are_normalised() {
        let blob = r#"{"todos":[
            {"id":1718000000000,"title":"Numeric id","priority":"HIGH","completed":"yes",
             "updatedAt":"2024-01-01T00:00:00Z"}
        ]}"#;
        let store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, blob));
        let task = store.get("1718000000000").expect("numeric id kept as text");
        assert_eq!(task.priority, Priority::High);
        assert!(!task.completed);
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn clean_load_writes_no_backup() {
        let mut store = TaskStore::load(MemoryStorage::new());
        store.add(NewTask::titled("x"), now()).expect("add");
        let mut store = TaskStore::load(store.storage().clone());
        store.add(NewTask::titled("y"), now()).expect("add");
        assert_eq!(store.storage().get(BACKUP_KEY).expect("get"), None);
    }

    #[test]
    fn unreadable_blob_is_backed_up_once() {
        let mut store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, "{not json"));
        store.add(NewTask::titled("first"), now()).expect("add");
        store.add(NewTask::titled("second"), now()).expect("add");
        assert_eq!(
            store.storage().get(BACKUP_KEY).expect("get").as_deref(),
            Some("{not json")
        );
    }

    #[test]
    fn duplicate_ids_keep_the_first_record() {
        let blob = r#"{"todos":[
            {"id":"a","title":"first","createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"},
            {"id":"a","title":"second","createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"}
        ]}"#;
        let store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, blob));
        assert_eq!(store.tasks().len(), 1);
        assert_eq!(store.tasks()[0].title, "first");
    }

    #[test]
    fn resolve_id_by_prefix() {
        let blob = r#"{"todos":[
            {"id":"abc-1","title":"a","createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"},
            {"id":"abd-2","title":"b","createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"}
        ]}"#;
        let store = TaskStore::load(MemoryStorage::with_slot(STORAGE_KEY, blob));

        assert_eq!(store.resolve_id("abc").expect("unique prefix"), "abc-1");
        assert!(store.resolve_id("ab").is_err());
        assert!(store.resolve_id("zzz").is_err());
    }
}
