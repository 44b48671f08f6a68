// In-process implementations of the auth stores
//
// Used for development mode (no DATABASE_URL) and by the test suite. They
// honour the same contracts as the Postgres implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::auth::{
    error::AuthError,
    models::{NewRefreshToken, NewUser, Permission, RefreshTokenRecord, Role, User},
    repository::{RefreshTokenStore, UserRepository},
};

/// Permission catalog: (id, name, description, resource, action)
const PERMISSIONS: [(i32, &str, &str, &str, &str); 7] = [
    (1, "read_users", "Read user information", "users", "read"),
    (2, "write_users", "Create and update users", "users", "write"),
    (3, "delete_users", "Delete users", "users", "delete"),
    (4, "read_todos", "Read todos", "todos", "read"),
    (5, "write_todos", "Create and update todos", "todos", "write"),
    (6, "delete_todos", "Delete todos", "todos", "delete"),
    (7, "manage_roles", "Manage user roles", "roles", "manage"),
];

/// Role catalog: (id, name, description, permission ids)
const ROLES: [(i32, &str, &str, &[i32]); 3] = [
    (1, "admin", "Administrator with full access", &[1, 2, 3, 4, 5, 6, 7]),
    (2, "user", "Regular user with limited access", &[1, 4, 5]),
    (3, "moderator", "Moderator with intermediate access", &[1, 2, 4, 5, 6]),
];

/// The built-in role catalog, matching the initial migration
pub fn default_roles() -> Vec<Role> {
    ROLES
        .iter()
        .map(|(id, name, description, permission_ids)| Role {
            id: *id,
            name: name.to_string(),
            description: Some(description.to_string()),
            permissions: PERMISSIONS
                .iter()
                .filter(|(pid, ..)| permission_ids.contains(pid))
                .map(|(pid, pname, pdesc, resource, action)| Permission {
                    id: *pid,
                    name: pname.to_string(),
                    description: Some(pdesc.to_string()),
                    resource: resource.to_string(),
                    action: action.to_string(),
                })
                .collect(),
        })
        .collect()
}

#[derive(Default)]
struct UserTable {
    next_id: i32,
    users: HashMap<i32, User>,
}

/// In-memory user repository
pub struct InMemoryUserRepository {
    roles: Vec<Role>,
    table: RwLock<UserTable>,
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self {
            roles: default_roles(),
            table: RwLock::new(UserTable::default()),
        }
    }

    /// Grant an additional catalog role to an existing user
    pub fn assign_role(&self, user_id: i32, role: &str) -> Result<(), AuthError> {
        let role = self.catalog_role(role)?;
        let mut table = self.table.write();
        let user = table.users.get_mut(&user_id).ok_or(AuthError::NotFound("User"))?;
        if !user.roles.iter().any(|r| r.id == role.id) {
            user.roles.push(role);
        }
        Ok(())
    }

    /// Soft-delete a user; it disappears from every lookup
    pub fn deactivate(&self, user_id: i32) {
        if let Some(user) = self.table.write().users.get_mut(&user_id) {
            user.is_active = false;
        }
    }

    fn catalog_role(&self, name: &str) -> Result<Role, AuthError> {
        self.roles
            .iter()
            .find(|role| role.name == name)
            .cloned()
            .ok_or_else(|| AuthError::StorageError(format!("Role '{}' is not in the catalog", name)))
    }

    fn find_active<F>(&self, predicate: F) -> Option<User>
    where
        F: Fn(&User) -> bool,
    {
        self.table
            .read()
            .users
            .values()
            .find(|user| user.is_active && predicate(user))
            .cloned()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create_user(&self, user: NewUser, role: &str) -> Result<User, AuthError> {
        let role = self.catalog_role(role)?;
        let mut table = self.table.write();

        // Uniqueness spans inactive users too, like the table constraints
        for existing in table.users.values() {
            if existing.username == user.username {
                return Err(AuthError::DuplicateUser("Username"));
            }
            if existing.email.eq_ignore_ascii_case(&user.email) {
                return Err(AuthError::DuplicateUser("Email"));
            }
        }

        table.next_id += 1;
        let now = Utc::now();
        let created = User {
            id: table.next_id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            is_active: true,
            created_at: now,
            updated_at: now,
            roles: vec![role],
        };
        table.users.insert(created.id, created.clone());

        Ok(created)
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<User>, AuthError> {
        Ok(self.find_active(|user| user.id == id))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        Ok(self.find_active(|user| user.username == username))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        Ok(self.find_active(|user| user.email.eq_ignore_ascii_case(email)))
    }

    async fn update_profile(&self, id: i32, username: &str, email: &str) -> Result<User, AuthError> {
        let mut table = self.table.write();

        for existing in table.users.values().filter(|user| user.id != id) {
            if existing.username == username {
                return Err(AuthError::DuplicateUser("Username"));
            }
            if existing.email.eq_ignore_ascii_case(email) {
                return Err(AuthError::DuplicateUser("Email"));
            }
        }

        let user = table
            .users
            .get_mut(&id)
            .filter(|user| user.is_active)
            .ok_or(AuthError::NotFound("User"))?;
        user.username = username.to_string();
        user.email = email.to_string();
        user.updated_at = Utc::now();

        Ok(user.clone())
    }

    async fn update_password(&self, id: i32, password_hash: &str) -> Result<(), AuthError> {
        let mut table = self.table.write();
        let user = table
            .users
            .get_mut(&id)
            .filter(|user| user.is_active)
            .ok_or(AuthError::NotFound("User"))?;
        user.password_hash = password_hash.to_string();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, AuthError> {
        Ok(self.roles.clone())
    }

    async fn ping(&self) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Default)]
struct TokenTable {
    next_id: i64,
    records: HashMap<String, RefreshTokenRecord>,
}

impl TokenTable {
    fn insert(&mut self, token: NewRefreshToken) -> Result<(), AuthError> {
        if self.records.contains_key(&token.token_hash) {
            return Err(AuthError::StorageError(
                "duplicate key value violates unique constraint on token_hash".to_string(),
            ));
        }

        self.next_id += 1;
        let record = RefreshTokenRecord {
            id: self.next_id,
            user_id: token.user_id,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            created_at: Utc::now(),
        };
        self.records.insert(record.token_hash.clone(), record);
        Ok(())
    }
}

/// In-memory refresh token store
///
/// A single mutex guards the table; every operation is a short map access,
/// which makes `rotate` trivially atomic.
#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    table: Mutex<TokenTable>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired or not
    pub fn len(&self) -> usize {
        self.table.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn put(&self, token: NewRefreshToken) -> Result<(), AuthError> {
        self.table.lock().insert(token)
    }

    async fn get(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let now = Utc::now();
        Ok(self
            .table
            .lock()
            .records
            .get(token_hash)
            .filter(|record| record.expires_at > now)
            .cloned())
    }

    async fn delete(&self, token_hash: &str) -> Result<bool, AuthError> {
        Ok(self.table.lock().records.remove(token_hash).is_some())
    }

    async fn delete_all_for(&self, user_id: i32) -> Result<u64, AuthError> {
        let mut table = self.table.lock();
        let before = table.records.len();
        table.records.retain(|_, record| record.user_id != user_id);
        Ok((before - table.records.len()) as u64)
    }

    async fn rotate(&self, old_hash: &str, replacement: NewRefreshToken) -> Result<bool, AuthError> {
        let now = Utc::now();
        let mut table = self.table.lock();

        match table.records.get(old_hash) {
            Some(record) if record.expires_at > now => {}
            _ => return Ok(false),
        }

        table.insert(replacement)?;
        table.records.remove(old_hash);
        Ok(true)
    }

    async fn sweep_expired(&self) -> Result<u64, AuthError> {
        let now = Utc::now();
        let mut table = self.table.lock();
        let before = table.records.len();
        table.records.retain(|_, record| record.expires_at > now);
        Ok((before - table.records.len()) as u64)
    }
}
