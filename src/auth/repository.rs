// Database repositories for users and refresh tokens

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::auth::{
    error::AuthError,
    models::{NewRefreshToken, NewUser, Permission, RefreshTokenRecord, Role, User},
};

/// Hash a token using SHA-256 (hex encoded)
///
/// Only this digest is ever persisted; the signed token string itself never
/// reaches the store.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// User lookup and persistence consumed by the session service
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create a user and assign it the named role in one step
    async fn create_user(&self, user: NewUser, role: &str) -> Result<User, AuthError>;

    /// Find an active user by ID, with roles and permissions
    async fn find_by_id(&self, id: i32) -> Result<Option<User>, AuthError>;

    /// Find an active user by username, with roles and permissions
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError>;

    /// Find an active user by email, with roles and permissions
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;

    async fn update_profile(&self, id: i32, username: &str, email: &str) -> Result<User, AuthError>;

    async fn update_password(&self, id: i32, password_hash: &str) -> Result<(), AuthError>;

    /// Full role catalog with permissions
    async fn list_roles(&self) -> Result<Vec<Role>, AuthError>;

    /// Cheap connectivity probe
    async fn ping(&self) -> Result<(), AuthError>;
}

/// Server-side record of outstanding refresh tokens, keyed by token hash.
///
/// Implementations must be safe under concurrent calls for the same or
/// different users.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn put(&self, token: NewRefreshToken) -> Result<(), AuthError>;

    /// Unexpired record for the hash, if any
    async fn get(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, AuthError>;

    /// Returns whether a record was removed
    async fn delete(&self, token_hash: &str) -> Result<bool, AuthError>;

    /// Returns the number of records removed
    async fn delete_all_for(&self, user_id: i32) -> Result<u64, AuthError>;

    /// Atomically replace `old_hash` with `replacement`.
    ///
    /// Returns `false`, leaving the store untouched, when no unexpired record
    /// for `old_hash` exists. Of several concurrent rotations of the same hash
    /// at most one returns `true`.
    async fn rotate(&self, old_hash: &str, replacement: NewRefreshToken) -> Result<bool, AuthError>;

    /// Delete expired records; returns the number removed
    async fn sweep_expired(&self) -> Result<u64, AuthError>;
}

/// Flat row produced by the role/permission join
#[derive(Debug, FromRow)]
struct RolePermissionRow {
    role_id: i32,
    role_name: String,
    role_description: Option<String>,
    permission_id: Option<i32>,
    permission_name: Option<String>,
    permission_description: Option<String>,
    resource: Option<String>,
    action: Option<String>,
}

/// Group joined rows into roles, preserving role id order
fn collect_roles(rows: Vec<RolePermissionRow>) -> Vec<Role> {
    let mut roles: BTreeMap<i32, Role> = BTreeMap::new();

    for row in rows {
        let role = roles.entry(row.role_id).or_insert_with(|| Role {
            id: row.role_id,
            name: row.role_name.clone(),
            description: row.role_description.clone(),
            permissions: Vec::new(),
        });

        if let (Some(id), Some(name)) = (row.permission_id, row.permission_name) {
            role.permissions.push(Permission {
                id,
                name,
                description: row.permission_description,
                resource: row.resource.unwrap_or_default(),
                action: row.action.unwrap_or_default(),
            });
        }
    }

    roles.into_values().collect()
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, is_active, created_at, updated_at";

const ROLE_PERMISSION_SELECT: &str = r#"
    SELECT r.id AS role_id, r.name AS role_name, r.description AS role_description,
           p.id AS permission_id, p.name AS permission_name,
           p.description AS permission_description, p.resource, p.action
    FROM roles r
    LEFT JOIN role_permissions rp ON r.id = rp.role_id
    LEFT JOIN permissions p ON rp.permission_id = p.id
"#;

/// Postgres-backed user repository
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Create a new PgUserRepository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_roles(&self, mut user: User) -> Result<User, AuthError> {
        let query = format!(
            "{} JOIN user_roles ur ON r.id = ur.role_id WHERE ur.user_id = $1 ORDER BY r.id, p.id",
            ROLE_PERMISSION_SELECT
        );

        let rows = sqlx::query_as::<_, RolePermissionRow>(&query)
            .bind(user.id)
            .fetch_all(&self.pool)
            .await?;

        user.roles = collect_roles(rows);
        Ok(user)
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<User>, AuthError> {
        let query = format!(
            "SELECT {} FROM users WHERE {} = $1 AND is_active = true",
            USER_COLUMNS, column
        );

        let user = sqlx::query_as::<_, User>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        match user {
            Some(user) => Ok(Some(self.load_roles(user).await?)),
            None => Ok(None),
        }
    }
}

/// Map a unique violation on users to the field that collided
fn map_user_write_error(err: sqlx::Error) -> AuthError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            let field = match db_err.constraint() {
                Some(name) if name.contains("email") => "Email",
                _ => "Username",
            };
            return AuthError::DuplicateUser(field);
        }
    }
    AuthError::StorageError(err.to_string())
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create_user(&self, user: NewUser, role: &str) -> Result<User, AuthError> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let query = format!(
            "INSERT INTO users (username, email, password_hash) VALUES ($1, $2, $3) RETURNING {}",
            USER_COLUMNS
        );
        let created = sqlx::query_as::<_, User>(&query)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_user_write_error)?;

        let assigned = sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) SELECT $1, id FROM roles WHERE name = $2",
        )
        .bind(created.id)
        .bind(role)
        .execute(&mut *tx)
        .await?;

        if assigned.rows_affected() == 0 {
            // Dropping tx rolls the user insert back
            return Err(AuthError::StorageError(format!("Role '{}' is not in the catalog", role)));
        }

        tx.commit().await?;

        self.load_roles(created).await
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<User>, AuthError> {
        let query = format!(
            "SELECT {} FROM users WHERE id = $1 AND is_active = true",
            USER_COLUMNS
        );

        let user = sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match user {
            Some(user) => Ok(Some(self.load_roles(user).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        self.find_one("username", username).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        self.find_one("LOWER(email)", &email.to_lowercase()).await
    }

    async fn update_profile(&self, id: i32, username: &str, email: &str) -> Result<User, AuthError> {
        let query = format!(
            "UPDATE users SET username = $1, email = $2, updated_at = NOW() \
             WHERE id = $3 AND is_active = true RETURNING {}",
            USER_COLUMNS
        );

        let user = sqlx::query_as::<_, User>(&query)
            .bind(username)
            .bind(email)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_user_write_error)?
            .ok_or(AuthError::NotFound("User"))?;

        self.load_roles(user).await
    }

    async fn update_password(&self, id: i32, password_hash: &str) -> Result<(), AuthError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2 AND is_active = true",
        )
        .bind(password_hash)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound("User"));
        }
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, AuthError> {
        let query = format!("{} ORDER BY r.id, p.id", ROLE_PERMISSION_SELECT);

        let rows = sqlx::query_as::<_, RolePermissionRow>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(collect_roles(rows))
    }

    async fn ping(&self) -> Result<(), AuthError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Postgres-backed refresh token store
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    /// Create a new PgRefreshTokenStore
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn put(&self, token: NewRefreshToken) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT id, user_id, token_hash, expires_at, created_at
             FROM refresh_tokens
             WHERE token_hash = $1 AND expires_at > NOW()",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete(&self, token_hash: &str) -> Result<bool, AuthError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_for(&self, user_id: i32) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn rotate(&self, old_hash: &str, replacement: NewRefreshToken) -> Result<bool, AuthError> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the old record: concurrent rotations queue here and all
        // but the first see zero rows once it commits
        let deleted = sqlx::query(
            "DELETE FROM refresh_tokens WHERE token_hash = $1 AND expires_at > NOW()",
        )
        .bind(old_hash)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(replacement.user_id)
        .bind(&replacement.token_hash)
        .bind(replacement.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
