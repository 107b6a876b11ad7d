use chrono::{NaiveDate, TimeZone, Utc};
use docket_core::datastore::{STORAGE_KEY, TaskStore};
use docket_core::filter::{FilterState, PriorityFilter, SortBy, SortOrder, StatusFilter, view};
use docket_core::stats::Stats;
use docket_core::storage::{FileStorage, KeyValueStore};
use docket_core::task::{NewTask, Priority, TaskPatch};
use tempfile::tempdir;

#[test]
fn file_store_roundtrip_and_reload() {
    let temp = tempdir().expect("tempdir");
    let storage = FileStorage::open(temp.path()).expect("open storage");
    let mut store = TaskStore::load(storage.clone());

    let now = Utc
        .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .expect("valid instant");

    let mut draft = NewTask::titled("Renew passport");
    draft.priority = Some(Priority::High);
    draft.category = Some("Other".to_string());
    draft.due_date = NaiveDate::from_ymd_opt(2024, 6, 20);
    let id = store.add(draft, now).expect("add task").id.clone();
    store
        .add(NewTask::titled("Water plants"), now)
        .expect("add second task");
    store.add_category("Garden").expect("add category");

    let reloaded = TaskStore::load(storage.clone());
    assert_eq!(reloaded.tasks().len(), 2);
    assert_eq!(reloaded.tasks()[0].title, "Water plants");
    assert!(reloaded.has_category("Garden"));

    let task = reloaded.get(&id).expect("reloaded task");
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2024, 6, 20));
    assert!(task.due_time.is_none());

    let raw = storage
        .get(STORAGE_KEY)
        .expect("read slot")
        .expect("slot present");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert!(value["todos"].is_array());
    assert_eq!(value["todos"][1]["dueDate"], "2024-06-20");
    assert!(value["categories"].is_array());
    assert!(temp.path().join(format!("{STORAGE_KEY}.json")).exists());
}

#[test]
fn malformed_file_falls_back_to_defaults() {
    let temp = tempdir().expect("tempdir");
    std::fs::write(temp.path().join(format!("{STORAGE_KEY}.json")), "{not json")
        .expect("write garbage");

    let storage = FileStorage::open(temp.path()).expect("open storage");
    let mut store = TaskStore::load(storage.clone());
    assert!(store.tasks().is_empty());
    assert_eq!(
        store.categories(),
        ["Personal", "Work", "Shopping", "Health", "Other"]
    );

    store
        .add(NewTask::titled("Start over"), Utc::now())
        .expect("add after fallback");
    assert_eq!(TaskStore::load(storage).tasks().len(), 1);
}

#[test]
fn stored_blob_from_older_writer_loads() {
    let temp = tempdir().expect("tempdir");
    let blob = r#"{
        "todos": [{
            "id": "1718000000000",
            "title": "Call mom",
            "description": "",
            "completed": false,
            "priority": "medium",
            "category": "Personal",
            "dueDate": "2024-06-10",
            "dueTime": "",
            "createdAt": "2024-06-01T09:00:00.000Z",
            "updatedAt": "2024-06-01T09:00:00.000Z"
        }]
    }"#;
    std::fs::write(temp.path().join(format!("{STORAGE_KEY}.json")), blob).expect("write blob");

    let store = TaskStore::load(FileStorage::open(temp.path()).expect("open storage"));
    assert_eq!(store.tasks().len(), 1);
    assert!(store.tasks()[0].due_time.is_none());
    assert_eq!(store.categories().len(), 5);
    assert_eq!(store.resolve_id("1718").expect("prefix"), "1718000000000");
}

#[test]
fn filter_sort_and_stats_over_a_store() {
    let temp = tempdir().expect("tempdir");
    let mut store = TaskStore::load(FileStorage::open(temp.path()).expect("open storage"));

    let base = Utc
        .with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
        .single()
        .expect("valid instant");
    let entries = [
        ("Pay rent", Priority::High, Some(1)),
        ("Book flights", Priority::Medium, Some(15)),
        ("Read novel", Priority::Low, None),
        ("Pay water bill", Priority::High, Some(3)),
    ];
    for (offset, (title, priority, due_day)) in entries.iter().enumerate() {
        let mut draft = NewTask::titled(*title);
        draft.priority = Some(*priority);
        draft.due_date = due_day.and_then(|d| NaiveDate::from_ymd_opt(2024, 6, d));
        store
            .add(draft, base + chrono::Duration::minutes(offset as i64))
            .expect("add task");
    }

    let rent = store.resolve_id(&store.tasks()[3].id).expect("rent id");
    store
        .update(
            &rent,
            TaskPatch {
                completed: Some(true),
                ..TaskPatch::default()
            },
            base,
        )
        .expect("complete rent");

    let filter = FilterState {
        search: "PAY".to_string(),
        priority: PriorityFilter::Only(Priority::High),
        status: StatusFilter::Pending,
        ..FilterState::default()
    };
    let rows = view(store.tasks(), &filter, SortBy::CreatedAt, SortOrder::Desc);
    let titles: Vec<&str> = rows.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(titles, ["Pay water bill"]);

    let by_due = view(
        store.tasks(),
        &FilterState::default(),
        SortBy::DueDate,
        SortOrder::Asc,
    );
    let titles: Vec<&str> = by_due.iter().map(|t| t.title.as_str()).collect();
    assert_eq!(
        titles,
        ["Pay rent", "Pay water bill", "Book flights", "Read novel"]
    );

    let now = NaiveDate::from_ymd_opt(2024, 6, 5)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .expect("valid now");
    let stats = Stats::compute(store.tasks(), now);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.overdue, 1);
    assert_eq!(stats.total, stats.completed + stats.pending);
}
