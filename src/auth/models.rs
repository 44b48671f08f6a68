// Authentication data models and DTOs

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

/// Role assigned to every newly registered user
pub const DEFAULT_ROLE: &str = "user";

/// User database model
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Loaded separately through the user_roles join
    #[sqlx(skip)]
    pub roles: Vec<Role>,
}

/// Role catalog entry with the permissions it grants
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Role {
    #[schema(example = 2)]
    pub id: i32,
    #[schema(example = "user")]
    pub name: String,
    pub description: Option<String>,
    #[sqlx(skip)]
    pub permissions: Vec<Permission>,
}

/// Permission catalog entry
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    #[schema(example = 4)]
    pub id: i32,
    #[schema(example = "read_todos")]
    pub name: String,
    pub description: Option<String>,
    #[schema(example = "todos")]
    pub resource: String,
    #[schema(example = "read")]
    pub action: String,
}

/// Authenticated identity with its flattened authorization data.
///
/// Permissions are the union of every assigned role's permissions, so
/// duplicates across roles collapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i32,
    pub username: String,
    pub email: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
}

impl From<&User> for Identity {
    fn from(user: &User) -> Self {
        let roles = user.roles.iter().map(|role| role.name.clone()).collect();
        let permissions = user
            .roles
            .iter()
            .flat_map(|role| role.permissions.iter().map(|perm| perm.name.clone()))
            .collect();

        Self {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles,
            permissions,
        }
    }
}

/// Refresh token revocation record
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshTokenRecord {
    pub id: i64,
    pub user_id: i32,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Revocation record about to be persisted
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: i32,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// User about to be persisted
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// User response model (excludes password_hash)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    #[schema(example = 1)]
    pub id: i32,
    #[schema(example = "jdoe")]
    pub username: String,
    #[schema(example = "jdoe@example.com")]
    pub email: String,
    pub is_active: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        let identity = Identity::from(&user);
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            is_active: user.is_active,
            roles: identity.roles.into_iter().collect(),
            permissions: identity.permissions.into_iter().collect(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Registration request DTO
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(
        length(min = 3, max = 50, message = "Username must be 3-50 characters"),
        custom = "crate::validation::validate_username"
    )]
    #[schema(example = "jdoe")]
    pub username: String,
    #[validate(email(message = "Email must be a valid address"))]
    #[schema(example = "jdoe@example.com")]
    pub email: String,
    #[validate(length(min = 6, max = 128, message = "Password must be 6-128 characters"))]
    #[schema(example = "s3cretpass")]
    pub password: String,
}

/// Login request DTO
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    #[schema(example = "jdoe")]
    pub username: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

/// Token refresh request DTO
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

/// Logout request DTO
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct LogoutRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

/// Password change request DTO
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,
    #[validate(length(min = 6, max = 128, message = "Password must be 6-128 characters"))]
    pub new_password: String,
}

/// Profile update request DTO
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateProfileRequest {
    #[validate(
        length(min = 3, max = 50, message = "Username must be 3-50 characters"),
        custom = "crate::validation::validate_username"
    )]
    pub username: String,
    #[validate(email(message = "Email must be a valid address"))]
    pub email: String,
}

/// Authentication response DTO
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    /// Access token lifetime in seconds
    #[schema(example = 900)]
    pub expires_in: i64,
}

/// Plain acknowledgement body
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Result of an expired-session sweep
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SweepResponse {
    #[schema(example = 3)]
    pub removed: u64,
}
