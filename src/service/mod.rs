//! Application services sitting between HTTP handlers and storage.

pub mod accounts;
pub mod tasks;

pub use accounts::{
    AccountService, AuthResponse, CreateUserRequest, LoginRequest, RegisterRequest, UserPatch,
};
pub use tasks::TaskService;
