//! Demo data for development databases.

use super::Database;
use crate::auth::hash_password;
use crate::store::TaskStore;
use crate::types::{NewTask, NewUser, Role, TaskStatus};
use anyhow::Result;
use tracing::info;

/// Password shared by the demo accounts.
pub const DEMO_PASSWORD: &str = "password123";

/// Insert two demo users and a small task tree, unless any user exists.
///
/// Returns `true` if data was inserted.
pub fn seed_if_empty(db: &Database) -> Result<bool> {
    if db.count_users()? > 0 {
        return Ok(false);
    }

    let password_hash = hash_password(DEMO_PASSWORD)?;
    db.atomically(|tx| -> Result<()> {
        let john = tx.insert_user(&NewUser {
            username: "john_doe".into(),
            email: "john@example.com".into(),
            password_hash: password_hash.clone(),
            role: Role::Admin,
            display_name: "John Doe".into(),
        })?;
        let jane = tx.insert_user(&NewUser {
            username: "jane_smith".into(),
            email: "jane@example.com".into(),
            password_hash,
            role: Role::User,
            display_name: "Jane Smith".into(),
        })?;

        let root = tx.insert_task(&NewTask {
            parent_id: None,
            title: "Main Project Setup".into(),
            description: Some("Set up the main project structure".into()),
            creator_id: john.id,
            assignee_id: Some(john.id),
            status: TaskStatus::InProgress,
        })?;
        tx.insert_task(&NewTask {
            parent_id: Some(root.id),
            title: "Database Schema".into(),
            description: Some("Design and implement database schema".into()),
            creator_id: john.id,
            assignee_id: Some(jane.id),
            status: TaskStatus::Todo,
        })?;
        tx.insert_task(&NewTask {
            parent_id: Some(root.id),
            title: "API Endpoints".into(),
            description: Some("Create REST API endpoints".into()),
            creator_id: john.id,
            assignee_id: Some(john.id),
            status: TaskStatus::Done,
        })?;
        Ok(())
    })?;

    info!("seeded demo users and tasks");
    Ok(true)
}
