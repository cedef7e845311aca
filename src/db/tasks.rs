//! Task queries: lookup, insert, update and paged listing.

use super::{Database, id_from_sql, id_to_sql, now_ms};
use crate::types::{
    NewTask, PageRequest, Task, TaskFilter, TaskId, TaskSort, TaskStatus, UserId,
};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let id: i64 = row.get("id")?;
    let parent_id: Option<i64> = row.get("parent_id")?;
    let creator_id: i64 = row.get("creator_id")?;
    let assignee_id: Option<i64> = row.get("assignee_id")?;
    let status: String = row.get("status")?;

    Ok(Task {
        id: id_from_sql(id),
        parent_id: parent_id.map(id_from_sql),
        title: row.get("title")?,
        description: row.get("description")?,
        creator_id: id_from_sql(creator_id),
        assignee_id: assignee_id.map(id_from_sql),
        status: TaskStatus::from_str(&status).unwrap_or_default(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

/// Get a live task using an existing connection.
pub(crate) fn get_task_internal(conn: &Connection, task_id: TaskId) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1 AND deleted_at IS NULL",
            params![id_to_sql(task_id)],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

pub(crate) fn count_live_children_internal(conn: &Connection, parent_id: TaskId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE parent_id = ?1 AND deleted_at IS NULL",
        params![id_to_sql(parent_id)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Number of live tasks assigned to `user_id`.
pub(crate) fn count_assigned_internal(conn: &Connection, user_id: UserId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE assignee_id = ?1 AND deleted_at IS NULL",
        params![id_to_sql(user_id)],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub(crate) fn insert_task_internal(conn: &Connection, task: &NewTask) -> Result<Task> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO tasks (parent_id, title, description, creator_id, assignee_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            task.parent_id.map(id_to_sql),
            task.title,
            task.description,
            id_to_sql(task.creator_id),
            task.assignee_id.map(id_to_sql),
            task.status.as_str(),
            now,
        ],
    )?;
    let id = id_from_sql(conn.last_insert_rowid());
    get_task_internal(conn, id)?.ok_or_else(|| anyhow!("task {id} vanished after insert"))
}

/// Persist every mutable field of `task` and bump `updated_at`.
///
/// `updated_at` never moves backwards even if the wall clock does.
/// Returns the row as stored, which may be a soft-deleted row.
pub(crate) fn update_task_internal(conn: &Connection, task: &Task) -> Result<Task> {
    let updated_at = now_ms().max(task.updated_at);
    let changed = conn.execute(
        "UPDATE tasks
         SET parent_id = ?1, title = ?2, description = ?3, assignee_id = ?4,
             status = ?5, updated_at = ?6, deleted_at = ?7
         WHERE id = ?8 AND deleted_at IS NULL",
        params![
            task.parent_id.map(id_to_sql),
            task.title,
            task.description,
            task.assignee_id.map(id_to_sql),
            task.status.as_str(),
            updated_at,
            task.deleted_at,
            id_to_sql(task.id),
        ],
    )?;
    if changed == 0 {
        return Err(anyhow!("task {} is not live", task.id));
    }

    let stored = conn.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![id_to_sql(task.id)],
        parse_task_row,
    )?;
    Ok(stored)
}

pub(crate) fn get_children_internal(conn: &Connection, parent_id: TaskId) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tasks WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY id",
    )?;
    let tasks = stmt
        .query_map(params![id_to_sql(parent_id)], parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

/// Live children of any of `parent_ids`, ordered by id.
pub(crate) fn get_children_of_internal(
    conn: &Connection,
    parent_ids: &[TaskId],
) -> Result<Vec<Task>> {
    if parent_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; parent_ids.len()].join(", ");
    let sql = format!(
        "SELECT * FROM tasks WHERE parent_id IN ({placeholders}) AND deleted_at IS NULL ORDER BY id"
    );
    let ids: Vec<i64> = parent_ids.iter().copied().map(id_to_sql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(rusqlite::params_from_iter(ids), parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

pub(crate) fn list_tasks_internal(
    conn: &Connection,
    filter: &TaskFilter,
    sort: TaskSort,
    page: PageRequest,
) -> Result<(Vec<Task>, u64)> {
    let mut where_clause = String::from(" WHERE t.deleted_at IS NULL");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(assignee) = filter.assignee_id {
        where_clause.push_str(" AND t.assignee_id = ?");
        params_vec.push(Box::new(id_to_sql(assignee)));
    }

    let count_sql = format!("SELECT COUNT(*) FROM tasks t{where_clause}");
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let total: i64 = conn.query_row(&count_sql, params_refs.as_slice(), |row| row.get(0))?;

    // Ties broken by id so that paging is stable.
    let sql = format!(
        "SELECT t.* FROM tasks t{where_clause} ORDER BY {} {}, t.id {} LIMIT {} OFFSET {}",
        sort.field.column(),
        sort.order.as_sql(),
        sort.order.as_sql(),
        page.page_size,
        page.offset(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params_refs.as_slice(), parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((tasks, total as u64))
}

impl Database {
    /// Get a live task by id.
    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Direct live children of a task, ordered by id.
    pub fn get_children(&self, parent_id: TaskId) -> Result<Vec<Task>> {
        self.with_conn(|conn| get_children_internal(conn, parent_id))
    }

    /// Live children of several parents at once, ordered by id.
    pub fn get_children_of(&self, parent_ids: &[TaskId]) -> Result<Vec<Task>> {
        self.with_conn(|conn| get_children_of_internal(conn, parent_ids))
    }

    /// One page of live tasks plus the total number of matching rows.
    pub fn list_tasks(
        &self,
        filter: &TaskFilter,
        sort: TaskSort,
        page: PageRequest,
    ) -> Result<(Vec<Task>, u64)> {
        self.with_conn(|conn| list_tasks_internal(conn, filter, sort, page))
    }
}
