//! Transactional storage interface used by the service layer.
//!
//! The service never touches SQL directly. Everything it reads in order to
//! validate a mutation and the write itself happen inside one
//! [`TaskStore::atomically`] call, so a validation result can't be stale by
//! the time the write commits.

use crate::db::{Database, tasks, users};
use crate::types::{
    NewTask, NewUser, PageRequest, Task, TaskFilter, TaskId, TaskSort, User, UserId,
};
use anyhow::Result;
use rusqlite::{Connection, TransactionBehavior};

/// Operations available inside a transaction.
pub trait StoreTx {
    /// A live task, or `None` if absent or soft-deleted.
    fn find_task(&self, id: TaskId) -> Result<Option<Task>>;
    /// Number of live tasks whose parent is `parent_id`.
    fn count_live_children(&self, parent_id: TaskId) -> Result<u64>;
    fn insert_task(&self, task: &NewTask) -> Result<Task>;
    /// Write back a modified task. Setting `deleted_at` soft-deletes it.
    fn update_task(&self, task: &Task) -> Result<Task>;
    fn find_user(&self, id: UserId) -> Result<Option<User>>;
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn insert_user(&self, user: &NewUser) -> Result<User>;
    /// Write back a modified user. Setting `deleted_at` soft-deletes it.
    fn update_user(&self, user: &User) -> Result<User>;
    /// Number of live tasks assigned to `user_id`.
    fn count_assigned_tasks(&self, user_id: UserId) -> Result<u64>;
}

/// Durable store for tasks and users.
pub trait TaskStore: Send + Sync + 'static {
    /// Run `f` in a serializable transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    fn atomically<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> std::result::Result<T, E>,
        E: From<anyhow::Error>;

    fn find_task(&self, id: TaskId) -> Result<Option<Task>>;
    fn list_tasks(
        &self,
        filter: &TaskFilter,
        sort: TaskSort,
        page: PageRequest,
    ) -> Result<(Vec<Task>, u64)>;
    fn list_subtasks(&self, parent_id: TaskId) -> Result<Vec<Task>>;
    /// Live children of any of `parent_ids`, ordered by id.
    fn list_subtasks_of(&self, parent_ids: &[TaskId]) -> Result<Vec<Task>>;
    fn find_user(&self, id: UserId) -> Result<Option<User>>;
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn list_users(&self) -> Result<Vec<User>>;
}

/// [`StoreTx`] over an open SQLite transaction.
struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl StoreTx for SqliteTx<'_> {
    fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        tasks::get_task_internal(self.conn, id)
    }

    fn count_live_children(&self, parent_id: TaskId) -> Result<u64> {
        tasks::count_live_children_internal(self.conn, parent_id)
    }

    fn insert_task(&self, task: &NewTask) -> Result<Task> {
        tasks::insert_task_internal(self.conn, task)
    }

    fn update_task(&self, task: &Task) -> Result<Task> {
        tasks::update_task_internal(self.conn, task)
    }

    fn find_user(&self, id: UserId) -> Result<Option<User>> {
        users::get_user_internal(self.conn, id)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        users::get_user_by_email_internal(self.conn, email)
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        users::get_user_by_username_internal(self.conn, username)
    }

    fn insert_user(&self, user: &NewUser) -> Result<User> {
        users::insert_user_internal(self.conn, user)
    }

    fn update_user(&self, user: &User) -> Result<User> {
        users::update_user_internal(self.conn, user)
    }

    fn count_assigned_tasks(&self, user_id: UserId) -> Result<u64> {
        tasks::count_assigned_internal(self.conn, user_id)
    }
}

impl TaskStore for Database {
    fn atomically<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| E::from(anyhow::Error::from(e)))?;
            // Dropping an uncommitted transaction rolls it back.
            let value = f(&SqliteTx { conn: &tx })?;
            tx.commit().map_err(|e| E::from(anyhow::Error::from(e)))?;
            Ok(value)
        })
    }

    fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.get_task(id)
    }

    fn list_tasks(
        &self,
        filter: &TaskFilter,
        sort: TaskSort,
        page: PageRequest,
    ) -> Result<(Vec<Task>, u64)> {
        Database::list_tasks(self, filter, sort, page)
    }

    fn list_subtasks(&self, parent_id: TaskId) -> Result<Vec<Task>> {
        self.get_children(parent_id)
    }

    fn list_subtasks_of(&self, parent_ids: &[TaskId]) -> Result<Vec<Task>> {
        self.get_children_of(parent_ids)
    }

    fn find_user(&self, id: UserId) -> Result<Option<User>> {
        self.get_user(id)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.get_user_by_email(email)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        Database::list_users(self)
    }
}
