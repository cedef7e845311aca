//! Registration, login and user management.
//!
//! Everything here may hash or verify a password, which is CPU bound.
//! Async callers run these methods on the blocking pool.

use crate::auth::{self, JwtIdentity};
use crate::error::{ServiceError, ServiceResult};
use crate::store::{StoreTx, TaskStore};
use crate::types::{NewUser, Principal, Role, User, UserDto, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shortest accepted password.
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Account created by an administrator. `role` defaults to `user`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Partial account update. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub username: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
}

/// Token plus the user it was issued for.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub message: String,
    pub token: String,
    pub user: UserDto,
}

pub struct AccountService<S> {
    store: Arc<S>,
    identity: Arc<JwtIdentity>,
}

impl<S> Clone for AccountService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            identity: Arc::clone(&self.identity),
        }
    }
}

impl<S: TaskStore> AccountService<S> {
    pub fn new(store: Arc<S>, identity: Arc<JwtIdentity>) -> Self {
        Self { store, identity }
    }

    /// Create an account and sign it in.
    pub fn register(&self, request: RegisterRequest) -> ServiceResult<AuthResponse> {
        let account = NewAccount::validate(
            &request.username,
            &request.email,
            &request.password,
            &request.display_name,
        )?;
        let user = self.insert_account(account, Role::User, None)?;

        info!(user_id = user.id, "user registered");
        self.sign_in(&user, "User registered successfully")
    }

    /// Exchange email and password for a token.
    ///
    /// Unknown email and wrong password produce the same error.
    pub fn login(&self, request: LoginRequest) -> ServiceResult<AuthResponse> {
        let user = self
            .store
            .find_user_by_email(request.email.trim())?
            .filter(|user| auth::verify_password(&request.password, &user.password_hash))
            .ok_or_else(|| ServiceError::unauthenticated("Invalid credentials"))?;

        info!(user_id = user.id, "user logged in");
        self.sign_in(&user, "Login successful")
    }

    /// The caller's own account.
    pub fn profile(&self, principal: &Principal) -> ServiceResult<UserDto> {
        self.user(principal.user_id)
    }

    pub fn user(&self, user_id: UserId) -> ServiceResult<UserDto> {
        self.store
            .find_user(user_id)?
            .map(|user| UserDto::from(&user))
            .ok_or_else(ServiceError::user_not_found)
    }

    pub fn users(&self) -> ServiceResult<Vec<UserDto>> {
        Ok(self.store.list_users()?.iter().map(UserDto::from).collect())
    }

    /// Create an account on someone else's behalf. Admin only.
    pub fn create_user(
        &self,
        principal: &Principal,
        request: CreateUserRequest,
    ) -> ServiceResult<UserDto> {
        // Checked before hashing and again in the insert transaction.
        self.store.atomically(|tx| require_admin(tx, principal))?;

        let role = parse_role(request.role.as_deref())?.unwrap_or_default();
        let account = NewAccount::validate(
            &request.username,
            &request.email,
            &request.password,
            &request.display_name,
        )?;
        let user = self.insert_account(account, role, Some(principal))?;

        info!(user_id = user.id, admin_id = principal.user_id, "user created");
        Ok(UserDto::from(&user))
    }

    /// Edit an account.
    ///
    /// Users may edit their own account. Editing anyone else, or changing a
    /// role, needs an admin.
    pub fn update_user(
        &self,
        principal: &Principal,
        user_id: UserId,
        patch: UserPatch,
    ) -> ServiceResult<UserDto> {
        let role = parse_role(patch.role.as_deref())?;
        let username = patch
            .username
            .as_deref()
            .map(|v| required(v, "username", "Username is required"))
            .transpose()?;
        let email = patch.email.as_deref().map(valid_email).transpose()?;
        let display_name = patch
            .display_name
            .as_deref()
            .map(|v| required(v, "display_name", "Display name is required"))
            .transpose()?;

        let caller = self
            .store
            .find_user(principal.user_id)?
            .ok_or_else(|| ServiceError::unauthenticated("User no longer exists"))?;
        if caller.role != Role::Admin && (caller.id != user_id || role.is_some()) {
            return Err(ServiceError::forbidden("Admin role required"));
        }
        let password_hash = match patch.password.as_deref() {
            Some(password) => {
                check_password(password)?;
                Some(auth::hash_password(password).map_err(ServiceError::internal)?)
            }
            None => None,
        };

        let user = self.store.atomically(|tx| -> ServiceResult<User> {
            let mut user = tx.find_user(user_id)?.ok_or_else(ServiceError::user_not_found)?;
            check_unique(
                tx,
                username.as_deref().unwrap_or(&user.username),
                email.as_deref().unwrap_or(&user.email),
                Some(user_id),
            )?;

            if let Some(username) = username {
                user.username = username;
            }
            if let Some(email) = email {
                user.email = email;
            }
            if let Some(display_name) = display_name {
                user.display_name = display_name;
            }
            if let Some(role) = role {
                user.role = role;
            }
            if let Some(password_hash) = password_hash {
                user.password_hash = password_hash;
            }
            Ok(tx.update_user(&user)?)
        })?;

        info!(user_id, by = principal.user_id, "user updated");
        Ok(UserDto::from(&user))
    }

    /// Soft-delete an account. Admin only.
    ///
    /// Refused for the caller's own account and while live tasks are still
    /// assigned to the user.
    pub fn delete_user(&self, principal: &Principal, user_id: UserId) -> ServiceResult<()> {
        self.store.atomically(|tx| -> ServiceResult<User> {
            require_admin(tx, principal)?;
            if user_id == principal.user_id {
                return Err(ServiceError::bad_request("Cannot delete own account"));
            }
            let mut user = tx.find_user(user_id)?.ok_or_else(ServiceError::user_not_found)?;
            if tx.count_assigned_tasks(user_id)? > 0 {
                return Err(ServiceError::conflict("User has assigned tasks"));
            }
            user.deleted_at = Some(crate::db::now_ms());
            Ok(tx.update_user(&user)?)
        })?;

        info!(user_id, admin_id = principal.user_id, "user deleted");
        Ok(())
    }

    /// Hash the password and insert the account, re-checking that `admin`
    /// still holds the role when one is given.
    fn insert_account(
        &self,
        account: NewAccount,
        role: Role,
        admin: Option<&Principal>,
    ) -> ServiceResult<User> {
        let password_hash = auth::hash_password(&account.password).map_err(ServiceError::internal)?;
        self.store.atomically(|tx| -> ServiceResult<User> {
            if let Some(admin) = admin {
                require_admin(tx, admin)?;
            }
            check_unique(tx, &account.username, &account.email, None)?;
            Ok(tx.insert_user(&NewUser {
                username: account.username,
                email: account.email,
                password_hash,
                role,
                display_name: account.display_name,
            })?)
        })
    }

    fn sign_in(&self, user: &User, message: &str) -> ServiceResult<AuthResponse> {
        let token = self.identity.issue(user).map_err(ServiceError::internal)?;
        Ok(AuthResponse {
            message: message.to_string(),
            token,
            user: UserDto::from(user),
        })
    }
}

/// Trimmed, validated fields of a new account.
struct NewAccount {
    username: String,
    email: String,
    password: String,
    display_name: String,
}

impl NewAccount {
    fn validate(
        username: &str,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> ServiceResult<Self> {
        let username = required(username, "username", "Username is required")?;
        let email = valid_email(email)?;
        check_password(password)?;
        let display_name = required(display_name, "display_name", "Display name is required")?;
        Ok(Self {
            username,
            email,
            password: password.to_string(),
            display_name,
        })
    }
}

fn required(value: &str, field: &str, message: &str) -> ServiceResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::invalid_value(field, message));
    }
    Ok(trimmed.to_string())
}

fn valid_email(email: &str) -> ServiceResult<String> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ServiceError::invalid_value("email", "A valid email is required"));
    }
    Ok(email.to_string())
}

fn check_password(password: &str) -> ServiceResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ServiceError::invalid_value(
            "password",
            "Password must be at least 6 characters",
        ));
    }
    Ok(())
}

fn parse_role(role: Option<&str>) -> ServiceResult<Option<Role>> {
    match role.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => Role::from_str(s)
            .map(Some)
            .ok_or_else(|| ServiceError::invalid_value("role", "Invalid role")),
    }
}

fn require_admin(tx: &dyn StoreTx, principal: &Principal) -> ServiceResult<()> {
    let caller = tx
        .find_user(principal.user_id)?
        .ok_or_else(|| ServiceError::unauthenticated("User no longer exists"))?;
    if caller.role != Role::Admin {
        return Err(ServiceError::forbidden("Admin role required"));
    }
    Ok(())
}

/// Reject a username or email held by another live account.
fn check_unique(
    tx: &dyn StoreTx,
    username: &str,
    email: &str,
    except: Option<UserId>,
) -> ServiceResult<()> {
    let other = |user: Option<User>| user.is_some_and(|u| Some(u.id) != except);
    if other(tx.find_user_by_email(email)?) {
        return Err(ServiceError::conflict("User with this email already exists"));
    }
    if other(tx.find_user_by_username(username)?) {
        return Err(ServiceError::conflict("Username already taken"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_fields_are_trimmed_and_checked() {
        let account = NewAccount::validate(" ann ", " ann@x.io ", "secret1", " Ann ").unwrap();
        assert_eq!(account.username, "ann");
        assert_eq!(account.email, "ann@x.io");
        assert_eq!(account.display_name, "Ann");

        let err = NewAccount::validate("ann", "nope", "secret1", "Ann").err().unwrap();
        assert_eq!(err.field.as_deref(), Some("email"));
        let err = NewAccount::validate("ann", "ann@x.io", "short", "Ann").err().unwrap();
        assert_eq!(err.field.as_deref(), Some("password"));
    }

    #[test]
    fn role_parsing() {
        assert_eq!(parse_role(None).unwrap(), None);
        assert_eq!(parse_role(Some("admin")).unwrap(), Some(Role::Admin));
        assert_eq!(
            parse_role(Some("root")).unwrap_err().field.as_deref(),
            Some("role")
        );
    }
}
