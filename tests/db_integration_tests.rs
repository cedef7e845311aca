//! Integration tests for the database layer.
//!
//! These tests verify the storage operations using in-memory and on-disk
//! SQLite databases. Tests are organized by module and functionality.

use task_graph_live::db::{Database, seed, tasks};
use task_graph_live::store::TaskStore;
use task_graph_live::types::{
    NewTask, NewUser, PageRequest, Role, SortField, SortOrder, Task, TaskFilter, TaskSort,
    TaskStatus, User,
};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

/// The task row as stored, including soft-deleted rows.
fn stored_row(db: &Database, id: u64) -> Task {
    db.with_conn(|conn| {
        Ok(conn.query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            [id as i64],
            tasks::parse_task_row,
        )?)
    })
    .expect("row remains")
}

fn new_user(name: &str) -> NewUser {
    NewUser {
        username: name.to_string(),
        email: format!("{name}@example.com"),
        password_hash: "not-a-real-hash".to_string(),
        role: Role::User,
        display_name: name.to_uppercase(),
    }
}

fn new_task(title: &str, creator: &User) -> NewTask {
    NewTask {
        parent_id: None,
        title: title.to_string(),
        description: None,
        creator_id: creator.id,
        assignee_id: None,
        status: TaskStatus::Todo,
    }
}

fn insert_user(db: &Database, name: &str) -> User {
    db.atomically(|tx| tx.insert_user(&new_user(name)))
        .expect("Failed to insert user")
}

fn insert_task(db: &Database, task: NewTask) -> Task {
    db.atomically(|tx| tx.insert_task(&task))
        .expect("Failed to insert task")
}

fn soft_delete(db: &Database, task: &Task) -> Task {
    db.atomically(|tx| {
        let mut doomed = task.clone();
        doomed.deleted_at = Some(task_graph_live::db::now_ms());
        tx.update_task(&doomed)
    })
    .expect("Failed to delete task")
}

mod user_tests {
    use super::*;

    #[test]
    fn insert_assigns_ids_and_timestamps() {
        let db = setup_db();

        let alice = insert_user(&db, "alice");
        let bob = insert_user(&db, "bob");

        assert!(alice.id > 0);
        assert!(bob.id > alice.id);
        assert!(alice.created_at > 0);
        assert_eq!(alice.created_at, alice.updated_at);
        assert!(alice.deleted_at.is_none());
        assert_eq!(alice.display_name, "ALICE");
        assert_eq!(alice.role, Role::User);
    }

    #[test]
    fn email_lookup_is_exact() {
        let db = setup_db();
        let alice = insert_user(&db, "alice");

        let found = db.get_user_by_email("alice@example.com").unwrap();
        assert_eq!(found.map(|u| u.id), Some(alice.id));
        assert!(db.get_user_by_email("ALICE@example.com").unwrap().is_none());
        assert!(db.get_user_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn duplicate_email_is_rejected_by_schema() {
        let db = setup_db();
        insert_user(&db, "alice");

        let mut clash = new_user("alice2");
        clash.email = "alice@example.com".to_string();
        let result = db.atomically(|tx| tx.insert_user(&clash));

        assert!(result.is_err());
        assert_eq!(db.count_users().unwrap(), 1);
    }

    #[test]
    fn username_lookup_reflects_inserts() {
        let db = setup_db();
        insert_user(&db, "alice");

        let (taken, free) = db
            .atomically(|tx| -> anyhow::Result<_> {
                Ok((
                    tx.find_user_by_username("alice")?.is_some(),
                    tx.find_user_by_username("bob")?.is_some(),
                ))
            })
            .unwrap();
        assert!(taken);
        assert!(!free);
    }

    #[test]
    fn list_users_orders_by_id() {
        let db = setup_db();
        insert_user(&db, "zed");
        insert_user(&db, "amy");

        let names: Vec<String> = db
            .list_users()
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["zed", "amy"]);
    }
}

mod task_tests {
    use super::*;

    #[test]
    fn insert_and_fetch() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");

        let mut draft = new_task("Write docs", &owner);
        draft.description = Some("all of them".to_string());
        draft.status = TaskStatus::InProgress;
        let task = insert_task(&db, draft);

        let fetched = db.get_task(task.id).unwrap().expect("task should exist");
        assert_eq!(fetched, task);
        assert_eq!(fetched.title, "Write docs");
        assert_eq!(fetched.description.as_deref(), Some("all of them"));
        assert_eq!(fetched.status, TaskStatus::InProgress);
        assert_eq!(fetched.creator_id, owner.id);
        assert!(fetched.is_live());
    }

    #[test]
    fn soft_deleted_tasks_are_hidden_but_kept() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        let task = insert_task(&db, new_task("ephemeral", &owner));

        let deleted = soft_delete(&db, &task);
        assert!(deleted.deleted_at.is_some());

        assert!(db.get_task(task.id).unwrap().is_none());
        let row = stored_row(&db, task.id);
        assert!(!row.is_live());
    }

    #[test]
    fn deleted_tasks_cannot_be_updated() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        let task = insert_task(&db, new_task("gone", &owner));
        let deleted = soft_delete(&db, &task);

        let mut revived = deleted.clone();
        revived.deleted_at = None;
        revived.title = "back".to_string();
        let result = db.atomically(|tx| tx.update_task(&revived));

        assert!(result.is_err());
        assert!(db.get_task(task.id).unwrap().is_none());
    }

    #[test]
    fn update_never_moves_updated_at_backwards() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        let task = insert_task(&db, new_task("clock", &owner));

        let mut future = task.clone();
        future.updated_at = task.updated_at + 60_000;
        let stored = db.atomically(|tx| tx.update_task(&future)).unwrap();

        assert!(stored.updated_at >= future.updated_at);
        assert_eq!(stored.created_at, task.created_at);
    }

    #[test]
    fn children_are_live_and_ordered_by_id() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        let root = insert_task(&db, new_task("root", &owner));

        let mut ids = Vec::new();
        for title in ["c", "b", "a"] {
            let mut child = new_task(title, &owner);
            child.parent_id = Some(root.id);
            ids.push(insert_task(&db, child).id);
        }
        let doomed = db.get_task(ids[1]).unwrap().unwrap();
        soft_delete(&db, &doomed);

        let children: Vec<u64> = db
            .get_children(root.id)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(children, vec![ids[0], ids[2]]);

        let live = db
            .atomically(|tx| tx.count_live_children(root.id))
            .unwrap();
        assert_eq!(live, 2);
    }
}

mod list_tests {
    use super::*;

    fn seed_titles(db: &Database, owner: &User, titles: &[&str]) -> Vec<Task> {
        titles
            .iter()
            .map(|t| insert_task(db, new_task(t, owner)))
            .collect()
    }

    fn sort(field: SortField, order: SortOrder) -> TaskSort {
        TaskSort { field, order }
    }

    #[test]
    fn pages_cover_all_rows_once() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        seed_titles(&db, &owner, &["a", "b", "c", "d", "e"]);

        let mut seen = Vec::new();
        for page in 1..=3 {
            let (tasks, total) = db
                .list_tasks(
                    &TaskFilter::default(),
                    sort(SortField::Id, SortOrder::Asc),
                    PageRequest { page, page_size: 2 },
                )
                .unwrap();
            assert_eq!(total, 5);
            seen.extend(tasks.into_iter().map(|t| t.title));
        }
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn sorts_by_title_in_both_directions() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        seed_titles(&db, &owner, &["beta", "alpha", "gamma"]);

        let titles = |order| {
            db.list_tasks(
                &TaskFilter::default(),
                sort(SortField::Title, order),
                PageRequest::default(),
            )
            .unwrap()
            .0
            .into_iter()
            .map(|t| t.title)
            .collect::<Vec<_>>()
        };
        assert_eq!(titles(SortOrder::Asc), vec!["alpha", "beta", "gamma"]);
        assert_eq!(titles(SortOrder::Desc), vec!["gamma", "beta", "alpha"]);
    }

    #[test]
    fn assignee_filter_and_deleted_rows() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        let other = insert_user(&db, "other");

        let mut mine = new_task("mine", &owner);
        mine.assignee_id = Some(owner.id);
        let mine = insert_task(&db, mine);
        let mut theirs = new_task("theirs", &owner);
        theirs.assignee_id = Some(other.id);
        insert_task(&db, theirs);
        let mut stale = new_task("stale", &owner);
        stale.assignee_id = Some(owner.id);
        let stale = insert_task(&db, stale);
        soft_delete(&db, &stale);

        let (tasks, total) = db
            .list_tasks(
                &TaskFilter {
                    assignee_id: Some(owner.id),
                },
                TaskSort::default(),
                PageRequest::default(),
            )
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, mine.id);
    }

    #[test]
    fn listing_twice_is_identical() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        seed_titles(&db, &owner, &["x", "y", "z", "w"]);

        let request = PageRequest {
            page: 2,
            page_size: 3,
        };
        let first = db
            .list_tasks(&TaskFilter::default(), TaskSort::default(), request)
            .unwrap();
        let second = db
            .list_tasks(&TaskFilter::default(), TaskSort::default(), request)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.0.len(), 1);
    }
}

mod stats_tests {
    use super::*;

    #[test]
    fn counts_exclude_deleted_tasks() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");

        let mut done = new_task("done", &owner);
        done.status = TaskStatus::Done;
        done.assignee_id = Some(owner.id);
        insert_task(&db, done);
        let mut todo = new_task("todo", &owner);
        todo.assignee_id = Some(owner.id);
        insert_task(&db, todo);
        insert_task(&db, new_task("floating", &owner));
        let gone = insert_task(&db, new_task("gone", &owner));
        soft_delete(&db, &gone);

        let report = db.stats_report(None).unwrap();
        let overall = &report.overall_stats;
        assert_eq!(overall.total_tasks, 3);
        assert_eq!(overall.completed_tasks, 1);
        assert_eq!(overall.todo_tasks, 2);
        assert_eq!(overall.unassigned_tasks, 1);
        assert!(report.generated_at > 0);

        assert_eq!(report.user_stats.len(), 1);
        let mine = &report.user_stats[0];
        assert_eq!(mine.user_id, owner.id);
        assert_eq!(mine.total_tasks, 2);
        assert_eq!(mine.completed_tasks, 1);
        assert!((mine.completion_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn per_user_filter_and_idle_users() {
        let db = setup_db();
        let owner = insert_user(&db, "owner");
        let idle = insert_user(&db, "idle");
        insert_task(&db, new_task("a", &owner));

        let report = db.stats_report(Some(idle.id)).unwrap();
        assert_eq!(report.user_stats.len(), 1);
        assert_eq!(report.user_stats[0].user_id, idle.id);
        assert_eq!(report.user_stats[0].total_tasks, 0);
        assert_eq!(report.user_stats[0].completion_rate, 0.0);
        assert_eq!(report.overall_stats.total_tasks, 1);
    }
}

mod persistence_tests {
    use super::*;

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tasks.db");

        let task_id = {
            let db = Database::open(&path).expect("open");
            let owner = insert_user(&db, "owner");
            insert_task(&db, new_task("durable", &owner)).id
        };

        let db = Database::open(&path).expect("reopen runs migrations idempotently");
        let task = db.get_task(task_id).unwrap().expect("task persisted");
        assert_eq!(task.title, "durable");
        assert_eq!(db.count_users().unwrap(), 1);
    }

    #[test]
    fn seeding_populates_a_fresh_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("seeded.db")).expect("open");

        assert!(seed::seed_if_empty(&db).unwrap());
        assert!(!seed::seed_if_empty(&db).unwrap());

        let users = db.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].role, Role::Admin);

        let report = db.stats_report(None).unwrap();
        assert_eq!(report.overall_stats.total_tasks, 3);
        assert_eq!(report.overall_stats.in_progress_tasks, 1);
    }
}
