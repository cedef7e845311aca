//! Core types for the task graph service.

use serde::{Deserialize, Serialize};

/// Stable user identifier.
pub type UserId = u64;

/// Stable task identifier.
pub type TaskId = u64;

/// Default number of tasks per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page size a client may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(TaskStatus::Todo),
            "in_progress" => Some(TaskStatus::InProgress),
            "done" => Some(TaskStatus::Done),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

/// A stored user account.
///
/// Deliberately not `Serialize`: the password hash must never reach a client.
/// Use [`UserDto`] for anything that leaves the process.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub display_name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDto {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
}

impl From<&User> for UserDto {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
        }
    }
}

/// Input for inserting a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub display_name: String,
}

/// A node in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    pub title: String,
    pub description: Option<String>,
    pub creator_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<UserId>,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl Task {
    /// A task is live until it has been soft-deleted.
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Validated input for inserting a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub parent_id: Option<TaskId>,
    pub title: String,
    pub description: Option<String>,
    pub creator_id: UserId,
    pub assignee_id: Option<UserId>,
    pub status: TaskStatus,
}

/// Client-supplied body for creating a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDraft {
    #[serde(default)]
    pub title: String,
    pub description: Option<String>,
    pub parent_id: Option<TaskId>,
    pub assignee_id: Option<UserId>,
    pub status: Option<String>,
}

/// Client-supplied partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub assignee_id: Option<UserId>,
    /// Zero means "leave unchanged".
    pub parent_id: Option<TaskId>,
    /// Clears the assignee; applied after `assignee_id`.
    #[serde(default)]
    pub unassigned: bool,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub email: String,
}

/// Column a task listing can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    Id,
    Title,
    Status,
    #[default]
    CreatedAt,
    UpdatedAt,
    CreatorId,
    AssigneeId,
}

impl SortField {
    /// Parse a client value, falling back to `created_at` for anything unknown.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("id") => SortField::Id,
            Some("title") => SortField::Title,
            Some("status") => SortField::Status,
            Some("created_at") => SortField::CreatedAt,
            Some("updated_at") => SortField::UpdatedAt,
            Some("creator_id") => SortField::CreatorId,
            Some("assignee_id") => SortField::AssigneeId,
            _ => SortField::CreatedAt,
        }
    }

    /// SQL column for this field. Only ever produces a fixed identifier.
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Id => "t.id",
            SortField::Title => "t.title",
            SortField::Status => "t.status",
            SortField::CreatedAt => "t.created_at",
            SortField::UpdatedAt => "t.updated_at",
            SortField::CreatorId => "t.creator_id",
            SortField::AssigneeId => "t.assignee_id",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Parse a client value, falling back to descending.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Ordering for a task listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskSort {
    pub field: SortField,
    pub order: SortOrder,
}

/// Row filter for a task listing. Soft-deleted tasks are always excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub assignee_id: Option<UserId>,
}

/// One-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

/// Raw query string of `GET /tasks`. Values are kept as strings so that
/// junk input degrades to defaults instead of failing the request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListParams {
    pub page: Option<String>,
    pub page_size: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub my_tasks: Option<String>,
}

/// Normalized task listing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskListQuery {
    pub page: PageRequest,
    pub sort: TaskSort,
    pub my_tasks: bool,
}

impl TaskListParams {
    /// Apply defaults and clamping rules.
    pub fn normalize(&self) -> TaskListQuery {
        let page = self
            .page
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| *p >= 1)
            .unwrap_or(1);

        let page_size = self
            .page_size
            .as_deref()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .filter(|p| (1..=MAX_PAGE_SIZE).contains(p))
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let my_tasks = matches!(self.my_tasks.as_deref(), Some("true") | Some("1"));

        TaskListQuery {
            page: PageRequest { page, page_size },
            sort: TaskSort {
                field: SortField::parse(self.sort_by.as_deref()),
                order: SortOrder::parse(self.sort_order.as_deref()),
            },
            my_tasks,
        }
    }
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            total_pages: total.div_ceil(u64::from(request.page_size)),
        }
    }
}

/// A task with its people resolved, as returned by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDto {
    #[serde(flatten)]
    pub task: Task,
    pub creator: Option<UserDto>,
    pub assignee: Option<UserDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Task>>,
}

/// Task counts across all live tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub total_tasks: u64,
    pub todo_tasks: u64,
    pub in_progress_tasks: u64,
    pub completed_tasks: u64,
    pub cancelled_tasks: u64,
    pub unassigned_tasks: u64,
}

/// Task counts for the tasks assigned to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub total_tasks: u64,
    pub todo_tasks: u64,
    pub in_progress_tasks: u64,
    pub completed_tasks: u64,
    pub cancelled_tasks: u64,
    /// Percentage of assigned tasks that are done, 0-100.
    pub completion_rate: f64,
}

/// Aggregate statistics report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub overall_stats: OverallStats,
    pub user_stats: Vec<UserStats>,
    pub generated_at: i64,
}
