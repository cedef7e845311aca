//! Task graph rules and change notification.
//!
//! Every mutation validates and writes inside one store transaction. Events
//! are published only after the transaction commits, so a failed request
//! never produces a notification.

use crate::error::{ServiceError, ServiceResult};
use crate::realtime::{ChangeEvent, DeletedTask, EventBus};
use crate::store::{StoreTx, TaskStore};
use crate::types::{
    NewTask, Page, Principal, Task, TaskDraft, TaskDto, TaskFilter, TaskId, TaskListQuery,
    TaskPatch, TaskStatus, User, UserDto, UserId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Validates task mutations and publishes their effects.
pub struct TaskService<S> {
    store: Arc<S>,
    bus: EventBus,
}

impl<S> Clone for TaskService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
        }
    }
}

impl<S: TaskStore> TaskService<S> {
    pub fn new(store: Arc<S>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a task owned by `principal`.
    pub fn create(&self, principal: &Principal, draft: TaskDraft) -> ServiceResult<Task> {
        let title = validate_title(&draft.title)?;
        let status = parse_status(draft.status.as_deref())?.unwrap_or_default();

        let task = self.store.atomically(|tx| -> ServiceResult<Task> {
            if tx.find_user(principal.user_id)?.is_none() {
                return Err(ServiceError::unauthenticated("User no longer exists"));
            }
            if let Some(parent_id) = draft.parent_id {
                if tx.find_task(parent_id)?.is_none() {
                    return Err(ServiceError::invalid_value("parent_id", "Parent task not found"));
                }
            }
            if let Some(assignee_id) = draft.assignee_id {
                require_user(tx, assignee_id)?;
            }

            Ok(tx.insert_task(&NewTask {
                parent_id: draft.parent_id,
                title,
                description: draft.description,
                creator_id: principal.user_id,
                assignee_id: draft.assignee_id,
                status,
            })?)
        })?;

        info!(task_id = task.id, user_id = principal.user_id, "task created");
        self.publish(ChangeEvent::TaskCreated(task.clone()));
        if task.assignee_id.is_some() {
            self.publish(ChangeEvent::TaskAssigned(task.clone()));
        }
        Ok(task)
    }

    /// Apply a partial update.
    ///
    /// `unassigned` is applied after `assignee_id`, so it wins when both are
    /// present. A `parent_id` of zero leaves the parent unchanged.
    pub fn update(
        &self,
        principal: &Principal,
        task_id: TaskId,
        patch: TaskPatch,
    ) -> ServiceResult<Task> {
        let title = patch.title.as_deref().map(validate_title).transpose()?;
        let status = parse_status(patch.status.as_deref())?;

        let (previous_assignee, task) = self.store.atomically(|tx| -> ServiceResult<_> {
            let mut task = tx.find_task(task_id)?.ok_or_else(ServiceError::task_not_found)?;
            let previous_assignee = task.assignee_id;

            if let Some(title) = title {
                task.title = title;
            }
            if let Some(description) = patch.description {
                task.description = Some(description);
            }
            if let Some(status) = status {
                task.status = status;
            }
            if let Some(parent_id) = patch.parent_id.filter(|p| *p != 0) {
                check_reparent(tx, task_id, parent_id)?;
                task.parent_id = Some(parent_id);
            }
            if let Some(assignee_id) = patch.assignee_id {
                require_user(tx, assignee_id)?;
                task.assignee_id = Some(assignee_id);
            }
            if patch.unassigned {
                task.assignee_id = None;
            }

            Ok((previous_assignee, tx.update_task(&task)?))
        })?;

        info!(task_id, user_id = principal.user_id, "task updated");
        self.publish(ChangeEvent::TaskUpdated(task.clone()));
        if task.assignee_id.is_some() && task.assignee_id != previous_assignee {
            self.publish(ChangeEvent::TaskAssigned(task.clone()));
        }
        Ok(task)
    }

    /// Soft-delete a task. Fails while it still has live subtasks.
    pub fn delete(&self, principal: &Principal, task_id: TaskId) -> ServiceResult<()> {
        let task = self.store.atomically(|tx| -> ServiceResult<Task> {
            let mut task = tx.find_task(task_id)?.ok_or_else(ServiceError::task_not_found)?;
            if tx.count_live_children(task_id)? > 0 {
                return Err(ServiceError::bad_request(
                    "Cannot delete task with subtasks",
                ));
            }
            task.deleted_at = Some(crate::db::now_ms());
            Ok(tx.update_task(&task)?)
        })?;

        info!(task_id, user_id = principal.user_id, "task deleted");
        self.publish(ChangeEvent::TaskDeleted(DeletedTask {
            id: task.id,
            assignee_id: task.assignee_id,
        }));
        Ok(())
    }

    /// A live task by id.
    pub fn get(&self, task_id: TaskId) -> ServiceResult<Task> {
        self.store
            .find_task(task_id)?
            .ok_or_else(ServiceError::task_not_found)
    }

    /// A live task with its creator, assignee and direct subtasks resolved.
    pub fn get_detailed(&self, task_id: TaskId) -> ServiceResult<TaskDto> {
        let task = self.get(task_id)?;
        self.hydrate_with_subtasks(vec![task])?
            .pop()
            .ok_or_else(ServiceError::task_not_found)
    }

    /// Live direct children of a live task.
    pub fn subtasks(&self, task_id: TaskId) -> ServiceResult<Vec<Task>> {
        self.get(task_id)?;
        Ok(self.store.list_subtasks(task_id)?)
    }

    /// One page of live tasks.
    pub fn list(&self, principal: &Principal, query: &TaskListQuery) -> ServiceResult<Page<Task>> {
        let filter = TaskFilter {
            assignee_id: query.my_tasks.then_some(principal.user_id),
        };
        let (tasks, total) = self.store.list_tasks(&filter, query.sort, query.page)?;
        debug!(total, page = query.page.page, "tasks listed");
        Ok(Page::new(tasks, total, query.page))
    }

    /// Resolve creator and assignee for each task.
    pub fn hydrate(&self, tasks: Vec<Task>) -> ServiceResult<Vec<TaskDto>> {
        let ids: HashSet<UserId> = tasks
            .iter()
            .flat_map(|t| std::iter::once(t.creator_id).chain(t.assignee_id))
            .collect();
        let mut users: HashMap<UserId, UserDto> = HashMap::new();
        for id in ids {
            if let Some(user) = self.store.find_user(id)? {
                users.insert(id, UserDto::from(&user));
            }
        }

        Ok(tasks
            .into_iter()
            .map(|task| TaskDto {
                creator: users.get(&task.creator_id).cloned(),
                assignee: task.assignee_id.and_then(|id| users.get(&id).cloned()),
                subtasks: None,
                task,
            })
            .collect())
    }

    /// [`Self::hydrate`], plus each task's live direct subtasks.
    pub fn hydrate_with_subtasks(&self, tasks: Vec<Task>) -> ServiceResult<Vec<TaskDto>> {
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let mut children: HashMap<TaskId, Vec<Task>> = HashMap::new();
        for child in self.store.list_subtasks_of(&ids)? {
            if let Some(parent_id) = child.parent_id {
                children.entry(parent_id).or_default().push(child);
            }
        }

        let mut dtos = self.hydrate(tasks)?;
        for dto in &mut dtos {
            dto.subtasks = Some(children.remove(&dto.task.id).unwrap_or_default());
        }
        Ok(dtos)
    }

    fn publish(&self, event: ChangeEvent) {
        if let Err(e) = self.bus.publish(event) {
            warn!(error = %e, "change event dropped");
        }
    }
}

fn validate_title(title: &str) -> ServiceResult<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::invalid_value("title", "Title is required"));
    }
    Ok(trimmed.to_string())
}

fn parse_status(status: Option<&str>) -> ServiceResult<Option<TaskStatus>> {
    match status {
        None | Some("") => Ok(None),
        Some(s) => TaskStatus::from_str(s)
            .map(Some)
            .ok_or_else(|| ServiceError::invalid_value("status", "Invalid status")),
    }
}

fn require_user(tx: &dyn StoreTx, user_id: UserId) -> ServiceResult<User> {
    tx.find_user(user_id)?
        .ok_or_else(|| ServiceError::invalid_value("assignee_id", "Assignee not found"))
}

/// Reject a new parent that is missing or would close a cycle.
///
/// Walks the whole ancestor chain of the proposed parent, so indirect
/// cycles are caught as well as direct ones.
fn check_reparent(tx: &dyn StoreTx, task_id: TaskId, parent_id: TaskId) -> ServiceResult<()> {
    if parent_id == task_id {
        return Err(ServiceError::invalid_value(
            "parent_id",
            "Task cannot be own parent",
        ));
    }
    let parent = tx
        .find_task(parent_id)?
        .ok_or_else(|| ServiceError::invalid_value("parent_id", "Parent task not found"))?;

    let mut seen = HashSet::from([parent.id]);
    let mut next = parent.parent_id;
    while let Some(ancestor_id) = next {
        if ancestor_id == task_id {
            return Err(ServiceError::invalid_value(
                "parent_id",
                "Circular dependency detected",
            ));
        }
        if !seen.insert(ancestor_id) {
            break;
        }
        next = tx.find_task(ancestor_id)?.and_then(|a| a.parent_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_trimmed_and_required() {
        assert_eq!(validate_title("  hello ").unwrap(), "hello");
        assert!(validate_title("   ").is_err());
        assert!(validate_title("").is_err());
    }

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(parse_status(Some("")).unwrap(), None);
        assert_eq!(
            parse_status(Some("in_progress")).unwrap(),
            Some(TaskStatus::InProgress)
        );
        let err = parse_status(Some("paused")).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("status"));
    }
}
