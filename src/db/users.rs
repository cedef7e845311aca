//! User account queries.

use super::{Database, id_from_sql, id_to_sql, now_ms};
use crate::types::{NewUser, Role, User, UserId};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};

pub fn parse_user_row(row: &Row) -> rusqlite::Result<User> {
    let id: i64 = row.get("id")?;
    let role: String = row.get("role")?;

    Ok(User {
        id: id_from_sql(id),
        username: row.get("username")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        role: Role::from_str(&role).unwrap_or_default(),
        display_name: row.get("display_name")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

/// Look up a live user by id.
pub(crate) fn get_user_internal(conn: &Connection, user_id: UserId) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT * FROM users WHERE id = ?1 AND deleted_at IS NULL",
            params![id_to_sql(user_id)],
            parse_user_row,
        )
        .optional()?;
    Ok(user)
}

/// Look up a live user by email. Comparison is exact.
pub(crate) fn get_user_by_email_internal(conn: &Connection, email: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT * FROM users WHERE email = ?1 AND deleted_at IS NULL",
            params![email],
            parse_user_row,
        )
        .optional()?;
    Ok(user)
}

/// Look up a live user by username.
pub(crate) fn get_user_by_username_internal(
    conn: &Connection,
    username: &str,
) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT * FROM users WHERE username = ?1 AND deleted_at IS NULL",
            params![username],
            parse_user_row,
        )
        .optional()?;
    Ok(user)
}

pub(crate) fn insert_user_internal(conn: &Connection, user: &NewUser) -> Result<User> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO users (username, email, password_hash, role, display_name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            user.username,
            user.email,
            user.password_hash,
            user.role.as_str(),
            user.display_name,
            now,
        ],
    )?;
    let id = id_from_sql(conn.last_insert_rowid());
    get_user_internal(conn, id)?.ok_or_else(|| anyhow!("user {id} vanished after insert"))
}

/// Persist every mutable field of `user` and bump `updated_at`.
///
/// Only live rows are written. Setting `deleted_at` soft-deletes the user,
/// which frees its username and email for reuse.
pub(crate) fn update_user_internal(conn: &Connection, user: &User) -> Result<User> {
    let updated_at = now_ms().max(user.updated_at);
    let changed = conn.execute(
        "UPDATE users
         SET username = ?1, email = ?2, password_hash = ?3, role = ?4, display_name = ?5,
             updated_at = ?6, deleted_at = ?7
         WHERE id = ?8 AND deleted_at IS NULL",
        params![
            user.username,
            user.email,
            user.password_hash,
            user.role.as_str(),
            user.display_name,
            updated_at,
            user.deleted_at,
            id_to_sql(user.id),
        ],
    )?;
    if changed == 0 {
        return Err(anyhow!("user {} is not live", user.id));
    }

    let stored = conn.query_row(
        "SELECT * FROM users WHERE id = ?1",
        params![id_to_sql(user.id)],
        parse_user_row,
    )?;
    Ok(stored)
}

impl Database {
    /// Get a live user by id.
    pub fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        self.with_conn(|conn| get_user_internal(conn, user_id))
    }

    /// Get a live user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.with_conn(|conn| get_user_by_email_internal(conn, email))
    }

    /// List all live users ordered by id.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM users WHERE deleted_at IS NULL ORDER BY id")?;
            let users = stmt
                .query_map([], parse_user_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
    }

    /// Number of live users.
    pub fn count_users(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE deleted_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}
