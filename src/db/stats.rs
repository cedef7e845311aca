//! Aggregate task statistics.

use super::{Database, id_from_sql, id_to_sql, now_ms};
use crate::types::{OverallStats, StatsReport, UserId, UserStats};
use anyhow::Result;
use rusqlite::Connection;

const OVERALL_SQL: &str = "SELECT
        COUNT(*),
        COALESCE(SUM(status = 'todo'), 0),
        COALESCE(SUM(status = 'in_progress'), 0),
        COALESCE(SUM(status = 'done'), 0),
        COALESCE(SUM(status = 'cancelled'), 0),
        COALESCE(SUM(assignee_id IS NULL), 0)
     FROM tasks WHERE deleted_at IS NULL";

const PER_USER_SQL: &str = "SELECT
        u.id, u.username, u.display_name,
        COUNT(t.id),
        COALESCE(SUM(t.status = 'todo'), 0),
        COALESCE(SUM(t.status = 'in_progress'), 0),
        COALESCE(SUM(t.status = 'done'), 0),
        COALESCE(SUM(t.status = 'cancelled'), 0)
     FROM users u
     LEFT JOIN tasks t ON t.assignee_id = u.id AND t.deleted_at IS NULL
     WHERE u.deleted_at IS NULL";

fn overall_internal(conn: &Connection) -> Result<OverallStats> {
    let stats = conn.query_row(OVERALL_SQL, [], |row| {
        Ok(OverallStats {
            total_tasks: row.get::<_, i64>(0)? as u64,
            todo_tasks: row.get::<_, i64>(1)? as u64,
            in_progress_tasks: row.get::<_, i64>(2)? as u64,
            completed_tasks: row.get::<_, i64>(3)? as u64,
            cancelled_tasks: row.get::<_, i64>(4)? as u64,
            unassigned_tasks: row.get::<_, i64>(5)? as u64,
        })
    })?;
    Ok(stats)
}

fn per_user_internal(conn: &Connection, user_id: Option<UserId>) -> Result<Vec<UserStats>> {
    let mut sql = String::from(PER_USER_SQL);
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(id) = user_id {
        sql.push_str(" AND u.id = ?");
        params_vec.push(Box::new(id_to_sql(id)));
    }
    sql.push_str(" GROUP BY u.id ORDER BY u.id");

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_refs.as_slice(), |row| {
            let total = row.get::<_, i64>(3)? as u64;
            let completed = row.get::<_, i64>(6)? as u64;
            Ok(UserStats {
                user_id: id_from_sql(row.get(0)?),
                username: row.get(1)?,
                display_name: row.get(2)?,
                total_tasks: total,
                todo_tasks: row.get::<_, i64>(4)? as u64,
                in_progress_tasks: row.get::<_, i64>(5)? as u64,
                completed_tasks: completed,
                cancelled_tasks: row.get::<_, i64>(7)? as u64,
                completion_rate: completion_rate(completed, total),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn completion_rate(completed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}

impl Database {
    /// Build a statistics report, optionally narrowed to one user.
    ///
    /// The overall section always covers every live task. Callers are
    /// expected to have checked that `user_id` exists.
    pub fn stats_report(&self, user_id: Option<UserId>) -> Result<StatsReport> {
        self.with_conn(|conn| {
            Ok(StatsReport {
                overall_stats: overall_internal(conn)?,
                user_stats: per_user_internal(conn, user_id)?,
                generated_at: now_ms(),
            })
        })
    }

    pub fn overall_stats(&self) -> Result<OverallStats> {
        self.with_conn(overall_internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tasks::{insert_task_internal, update_task_internal};
    use crate::db::users::insert_user_internal;
    use crate::types::{NewTask, NewUser, Role, TaskStatus};

    fn setup_db() -> Database {
        let db = Database::open_in_memory().expect("Failed to create in-memory database");
        db.with_conn(|conn| {
            for name in ["ann", "ben"] {
                insert_user_internal(
                    conn,
                    &NewUser {
                        username: name.into(),
                        email: format!("{name}@example.com"),
                        password_hash: "hash".into(),
                        role: Role::User,
                        display_name: name.into(),
                    },
                )?;
            }
            Ok(())
        })
        .expect("Failed to create users");
        db
    }

    fn add(db: &Database, assignee: Option<UserId>, status: TaskStatus) {
        db.with_conn(|conn| {
            insert_task_internal(
                conn,
                &NewTask {
                    parent_id: None,
                    title: "t".into(),
                    description: None,
                    creator_id: 1,
                    assignee_id: assignee,
                    status,
                },
            )
        })
        .unwrap();
    }

    #[test]
    fn empty_database_has_zero_counts() {
        let db = setup_db();
        let report = db.stats_report(None).unwrap();
        assert_eq!(report.overall_stats, OverallStats::default());
        assert_eq!(report.user_stats.len(), 2);
        assert_eq!(report.user_stats[0].completion_rate, 0.0);
    }

    #[test]
    fn counts_by_status_and_assignee() {
        let db = setup_db();
        add(&db, Some(1), TaskStatus::Done);
        add(&db, Some(1), TaskStatus::Todo);
        add(&db, Some(2), TaskStatus::InProgress);
        add(&db, None, TaskStatus::Cancelled);

        let report = db.stats_report(None).unwrap();
        let overall = &report.overall_stats;
        assert_eq!(overall.total_tasks, 4);
        assert_eq!(overall.todo_tasks, 1);
        assert_eq!(overall.in_progress_tasks, 1);
        assert_eq!(overall.completed_tasks, 1);
        assert_eq!(overall.cancelled_tasks, 1);
        assert_eq!(overall.unassigned_tasks, 1);

        let ann = &report.user_stats[0];
        assert_eq!(ann.total_tasks, 2);
        assert_eq!(ann.completed_tasks, 1);
        assert_eq!(ann.completion_rate, 50.0);
    }

    #[test]
    fn deleted_tasks_are_not_counted() {
        let db = setup_db();
        add(&db, Some(2), TaskStatus::Todo);
        db.with_conn(|conn| {
            let mut task = crate::db::tasks::get_task_internal(conn, 1)?.unwrap();
            task.deleted_at = Some(now_ms());
            update_task_internal(conn, &task)
        })
        .unwrap();

        let report = db.stats_report(Some(2)).unwrap();
        assert_eq!(report.overall_stats.total_tasks, 0);
        assert_eq!(report.user_stats.len(), 1);
        assert_eq!(report.user_stats[0].user_id, 2);
        assert_eq!(report.user_stats[0].total_tasks, 0);
    }
}
