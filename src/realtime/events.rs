//! Change events and how they are routed to rooms.

use crate::types::{Task, TaskId, UserId};
use serde::Serialize;
use std::fmt;

/// Subscriber-visible grouping key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// Receives events about tasks assigned to this user.
    User(UserId),
    /// Receives updates and deletion of one task.
    Task(TaskId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user_{id}"),
            Room::Task(id) => write!(f, "task_{id}"),
        }
    }
}

/// Where a publication is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every connected subscriber.
    Global,
    Room(Room),
}

/// Payload of a deletion event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedTask {
    pub id: TaskId,
    /// Assignee at the time of deletion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<UserId>,
}

/// Notification that the task graph changed.
///
/// Serialized as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted(DeletedTask),
    TaskAssigned(Task),
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::TaskCreated(_) => "task_created",
            ChangeEvent::TaskUpdated(_) => "task_updated",
            ChangeEvent::TaskDeleted(_) => "task_deleted",
            ChangeEvent::TaskAssigned(_) => "task_assigned",
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            ChangeEvent::TaskCreated(t)
            | ChangeEvent::TaskUpdated(t)
            | ChangeEvent::TaskAssigned(t) => t.id,
            ChangeEvent::TaskDeleted(d) => d.id,
        }
    }

    /// Routing targets for this event.
    ///
    /// - created: everyone
    /// - updated: everyone, the task room, and the assignee's room
    /// - deleted: everyone, the task room, and the former assignee's room
    /// - assigned: only the assignee's room
    pub fn targets(&self) -> Vec<Target> {
        match self {
            ChangeEvent::TaskCreated(_) => vec![Target::Global],
            ChangeEvent::TaskUpdated(task) => {
                let mut targets = vec![Target::Global, Target::Room(Room::Task(task.id))];
                if let Some(assignee) = task.assignee_id {
                    targets.push(Target::Room(Room::User(assignee)));
                }
                targets
            }
            ChangeEvent::TaskDeleted(deleted) => {
                let mut targets = vec![Target::Global, Target::Room(Room::Task(deleted.id))];
                if let Some(assignee) = deleted.assignee_id {
                    targets.push(Target::Room(Room::User(assignee)));
                }
                targets
            }
            ChangeEvent::TaskAssigned(task) => task
                .assignee_id
                .map(|a| vec![Target::Room(Room::User(a))])
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    fn task(id: TaskId, assignee: Option<UserId>) -> Task {
        Task {
            id,
            parent_id: None,
            title: "t".into(),
            description: None,
            creator_id: 1,
            assignee_id: assignee,
            status: TaskStatus::Todo,
            created_at: 1,
            updated_at: 1,
            deleted_at: None,
        }
    }

    #[test]
    fn room_names() {
        assert_eq!(Room::User(3).to_string(), "user_3");
        assert_eq!(Room::Task(9).to_string(), "task_9");
    }

    #[test]
    fn update_routes_to_task_and_assignee_rooms() {
        let targets = ChangeEvent::TaskUpdated(task(5, Some(2))).targets();
        assert_eq!(
            targets,
            vec![
                Target::Global,
                Target::Room(Room::Task(5)),
                Target::Room(Room::User(2)),
            ]
        );
    }

    #[test]
    fn assignment_without_assignee_goes_nowhere() {
        assert!(ChangeEvent::TaskAssigned(task(5, None)).targets().is_empty());
        assert_eq!(
            ChangeEvent::TaskAssigned(task(5, Some(4))).targets(),
            vec![Target::Room(Room::User(4))]
        );
    }

    #[test]
    fn created_is_global_only() {
        assert_eq!(
            ChangeEvent::TaskCreated(task(1, Some(2))).targets(),
            vec![Target::Global]
        );
    }

    #[test]
    fn wire_format_is_type_and_payload() {
        let json = serde_json::to_value(ChangeEvent::TaskDeleted(DeletedTask {
            id: 4,
            assignee_id: None,
        }))
        .unwrap();
        assert_eq!(json["type"], "task_deleted");
        assert_eq!(json["payload"]["id"], 4);

        let json = serde_json::to_value(ChangeEvent::TaskCreated(task(1, None))).unwrap();
        assert_eq!(json["type"], "task_created");
        assert_eq!(json["payload"]["title"], "t");
        assert_eq!(json["payload"]["status"], "todo");
    }
}
