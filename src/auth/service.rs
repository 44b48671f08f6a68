// Authentication service - business logic layer

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use validator::Validate;

use crate::auth::{
    error::AuthError,
    models::{
        AuthResponse, ChangePasswordRequest, Identity, LoginRequest, NewRefreshToken, NewUser,
        RefreshRequest, RegisterRequest, Role, UpdateProfileRequest, User, UserResponse,
        DEFAULT_ROLE,
    },
    password::PasswordService,
    repository::{hash_token, RefreshTokenStore, UserRepository},
    token::{TokenPair, TokenService},
};

/// Default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Authentication service coordinating all auth operations
///
/// The only component that touches the refresh token store and the password
/// hasher. Refresh tokens are rotated on every use: presenting a token that
/// was already rotated or revoked fails with `RefreshTokenNotFound`.
pub struct AuthService {
    user_repo: Arc<dyn UserRepository>,
    token_store: Arc<dyn RefreshTokenStore>,
    token_service: TokenService,
    store_timeout: Duration,
}

impl AuthService {
    /// Create a new AuthService
    pub fn new(
        user_repo: Arc<dyn UserRepository>,
        token_store: Arc<dyn RefreshTokenStore>,
        token_service: TokenService,
    ) -> Self {
        Self {
            user_repo,
            token_store,
            token_service,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound every store call by `timeout`
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn token_service(&self) -> &TokenService {
        &self.token_service
    }

    /// Run a store call, failing with `Timeout` instead of hanging
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| AuthError::Timeout(operation))?
    }

    /// Register a new user
    pub async fn register(&self, request: RegisterRequest) -> Result<AuthResponse, AuthError> {
        request.validate()?;

        if self
            .bounded("find user", self.user_repo.find_by_username(&request.username))
            .await?
            .is_some()
        {
            return Err(AuthError::DuplicateUser("Username"));
        }
        if self
            .bounded("find user", self.user_repo.find_by_email(&request.email))
            .await?
            .is_some()
        {
            return Err(AuthError::DuplicateUser("Email"));
        }

        let password_hash = PasswordService::hash_password_async(request.password).await?;

        // A concurrent registration can still win the race; the store's
        // uniqueness check reports it as DuplicateUser
        let user = self
            .bounded(
                "create user",
                self.user_repo.create_user(
                    NewUser {
                        username: request.username,
                        email: request.email,
                        password_hash,
                    },
                    DEFAULT_ROLE,
                ),
            )
            .await?;

        info!(user_id = user.id, username = %user.username, "User registered");
        self.start_session(user).await
    }

    /// Login a user
    ///
    /// Unknown usernames and wrong passwords fail identically.
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse, AuthError> {
        request.validate()?;

        let user = match self
            .bounded("find user", self.user_repo.find_by_username(&request.username))
            .await?
        {
            Some(user) => user,
            None => {
                warn!(username = %request.username, "Login failed");
                return Err(AuthError::InvalidCredentials);
            }
        };

        let verified =
            PasswordService::verify_password_async(request.password, user.password_hash.clone())
                .await?;
        if !verified {
            warn!(username = %request.username, "Login failed");
            return Err(AuthError::InvalidCredentials);
        }

        info!(user_id = user.id, "User logged in");
        self.start_session(user).await
    }

    /// Exchange a refresh token for a new token pair, rotating it
    pub async fn refresh_tokens(&self, request: RefreshRequest) -> Result<AuthResponse, AuthError> {
        request.validate()?;

        let claims = self
            .token_service
            .validate_refresh_token(&request.refresh_token)
            .map_err(|_| AuthError::InvalidRefreshToken)?;

        let old_hash = hash_token(&request.refresh_token);
        let record = self
            .bounded("get refresh token", self.token_store.get(&old_hash))
            .await?;

        let record = match record {
            Some(record) if record.user_id == claims.user_id => record,
            _ => {
                // Validly signed but unknown: already rotated or revoked
                warn!(
                    user_id = claims.user_id,
                    jti = %claims.jti,
                    "Refresh token reuse or revoked token presented"
                );
                return Err(AuthError::RefreshTokenNotFound);
            }
        };

        let user = self
            .bounded("find user", self.user_repo.find_by_id(record.user_id))
            .await?
            .ok_or(AuthError::InvalidRefreshToken)?;

        let pair = self.token_service.generate_token_pair(&Identity::from(&user))?;
        let replacement = Self::revocation_record(user.id, &pair);

        let rotated = self
            .bounded("rotate refresh token", self.token_store.rotate(&old_hash, replacement))
            .await?;
        if !rotated {
            warn!(
                user_id = user.id,
                jti = %claims.jti,
                "Refresh token rotated concurrently; rejecting duplicate use"
            );
            return Err(AuthError::RefreshTokenNotFound);
        }

        debug!(user_id = user.id, "Refresh token rotated");
        Ok(self.auth_response(user, pair))
    }

    /// Revoke a single refresh token belonging to `user_id`
    ///
    /// Idempotent: an unknown token is not an error. A token owned by another
    /// user is never deleted.
    pub async fn logout(&self, user_id: i32, refresh_token: &str) -> Result<(), AuthError> {
        let token_hash = hash_token(refresh_token);

        match self
            .bounded("get refresh token", self.token_store.get(&token_hash))
            .await?
        {
            Some(record) if record.user_id != user_id => {
                warn!(user_id, owner = record.user_id, "Logout with another user's refresh token");
                Err(AuthError::RefreshTokenNotFound)
            }
            Some(_) => {
                self.bounded("delete refresh token", self.token_store.delete(&token_hash))
                    .await?;
                info!(user_id, "User logged out");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Revoke every refresh token of `user_id`; returns how many were revoked
    pub async fn logout_all(&self, user_id: i32) -> Result<u64, AuthError> {
        let revoked = self
            .bounded("delete refresh tokens", self.token_store.delete_all_for(user_id))
            .await?;

        info!(user_id, revoked, "All sessions revoked");
        Ok(revoked)
    }

    /// Change a password and revoke every outstanding session
    pub async fn change_password(
        &self,
        user_id: i32,
        request: ChangePasswordRequest,
    ) -> Result<(), AuthError> {
        request.validate()?;

        let user = self.require_user(user_id).await?;

        let verified = PasswordService::verify_password_async(
            request.current_password,
            user.password_hash.clone(),
        )
        .await?;
        if !verified {
            warn!(user_id, "Password change with wrong current password");
            return Err(AuthError::InvalidCredentials);
        }

        let password_hash = PasswordService::hash_password_async(request.new_password).await?;
        self.bounded(
            "update password",
            self.user_repo.update_password(user_id, &password_hash),
        )
        .await?;

        info!(user_id, "Password changed");
        self.logout_all(user_id).await?;
        Ok(())
    }

    /// Get current user information
    pub async fn get_profile(&self, user_id: i32) -> Result<UserResponse, AuthError> {
        Ok(self.require_user(user_id).await?.into())
    }

    /// Update username and email
    pub async fn update_profile(
        &self,
        user_id: i32,
        request: UpdateProfileRequest,
    ) -> Result<UserResponse, AuthError> {
        request.validate()?;

        if let Some(existing) = self
            .bounded("find user", self.user_repo.find_by_username(&request.username))
            .await?
        {
            if existing.id != user_id {
                return Err(AuthError::DuplicateUser("Username"));
            }
        }
        if let Some(existing) = self
            .bounded("find user", self.user_repo.find_by_email(&request.email))
            .await?
        {
            if existing.id != user_id {
                return Err(AuthError::DuplicateUser("Email"));
            }
        }

        let user = self
            .bounded(
                "update profile",
                self.user_repo.update_profile(user_id, &request.username, &request.email),
            )
            .await?;

        info!(user_id, "Profile updated");
        Ok(user.into())
    }

    /// Role catalog with permissions
    pub async fn list_roles(&self) -> Result<Vec<Role>, AuthError> {
        self.bounded("list roles", self.user_repo.list_roles()).await
    }

    /// Remove expired refresh token records
    pub async fn sweep_expired_tokens(&self) -> Result<u64, AuthError> {
        let swept = self
            .bounded("sweep refresh tokens", self.token_store.sweep_expired())
            .await?;
        if swept > 0 {
            debug!(swept, "Expired refresh tokens removed");
        }
        Ok(swept)
    }

    /// Probe the user store
    pub async fn health_check(&self) -> Result<(), AuthError> {
        self.bounded("ping", self.user_repo.ping()).await
    }

    async fn require_user(&self, user_id: i32) -> Result<User, AuthError> {
        self.bounded("find user", self.user_repo.find_by_id(user_id))
            .await?
            .ok_or(AuthError::NotFound("User"))
    }

    /// Issue a token pair for `user` and record its refresh token
    async fn start_session(&self, user: User) -> Result<AuthResponse, AuthError> {
        let pair = self.token_service.generate_token_pair(&Identity::from(&user))?;

        self.bounded(
            "store refresh token",
            self.token_store.put(Self::revocation_record(user.id, &pair)),
        )
        .await?;

        Ok(self.auth_response(user, pair))
    }

    fn revocation_record(user_id: i32, pair: &TokenPair) -> NewRefreshToken {
        NewRefreshToken {
            user_id,
            token_hash: hash_token(&pair.refresh.token),
            expires_at: pair.refresh.expires_at,
        }
    }

    fn auth_response(&self, user: User, pair: TokenPair) -> AuthResponse {
        AuthResponse {
            user: user.into(),
            access_token: pair.access_token,
            refresh_token: pair.refresh.token,
            token_type: "Bearer".to_string(),
            expires_in: self.token_service.access_token_duration().num_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::{InMemoryRefreshTokenStore, InMemoryUserRepository};
    use async_trait::async_trait;
    use crate::auth::models::{NewRefreshToken, RefreshTokenRecord};

    struct Fixture {
        service: Arc<AuthService>,
        users: Arc<InMemoryUserRepository>,
        tokens: Arc<InMemoryRefreshTokenStore>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(InMemoryUserRepository::new());
        let tokens = Arc::new(InMemoryRefreshTokenStore::new());
        let service = Arc::new(AuthService::new(
            users.clone(),
            tokens.clone(),
            TokenService::new("access_secret_for_tests", "refresh_secret_for_tests"),
        ));
        Fixture { service, users, tokens }
    }

    fn register_request(username: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: format!("{}@example.com", username),
            password: "s3cretpass".to_string(),
        }
    }

    fn login_request(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn refresh_request(token: &str) -> RefreshRequest {
        RefreshRequest { refresh_token: token.to_string() }
    }

    #[tokio::test]
    async fn test_register_issues_tokens_with_default_role() {
        let f = fixture();
        let response = f.service.register(register_request("alice")).await.unwrap();

        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 900);
        assert_eq!(response.user.roles, vec!["user".to_string()]);
        assert!(response.user.permissions.contains(&"read_todos".to_string()));

        let claims = f.service.token_service().validate_access_token(&response.access_token).unwrap();
        assert_eq!(claims.user_id, response.user.id);
        assert!(claims.has_role("user"));

        // Exactly one revocation record for the issued refresh token
        assert_eq!(f.tokens.len(), 1);
        assert!(f.tokens.get(&hash_token(&response.refresh_token)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let f = fixture();
        f.service.register(register_request("alice")).await.unwrap();

        let same_username = RegisterRequest {
            email: "different@example.com".to_string(),
            ..register_request("alice")
        };
        assert!(matches!(
            f.service.register(same_username).await,
            Err(AuthError::DuplicateUser("Username"))
        ));

        let same_email = RegisterRequest {
            username: "alice2".to_string(),
            ..register_request("alice")
        };
        assert!(matches!(
            f.service.register(same_email).await,
            Err(AuthError::DuplicateUser("Email"))
        ));
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let f = fixture();
        let request = RegisterRequest {
            password: "123".to_string(),
            ..register_request("alice")
        };

        assert!(matches!(
            f.service.register(request).await,
            Err(AuthError::ValidationError(_))
        ));
        assert!(f.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let f = fixture();
        f.service.register(register_request("alice")).await.unwrap();

        let unknown = f.service.login(login_request("nobody", "s3cretpass")).await.unwrap_err();
        let wrong = f.service.login(login_request("alice", "wrong-password")).await.unwrap_err();

        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert_eq!(unknown.error_message(), wrong.error_message());
    }

    #[tokio::test]
    async fn test_login_success_stores_new_session() {
        let f = fixture();
        f.service.register(register_request("alice")).await.unwrap();

        let response = f.service.login(login_request("alice", "s3cretpass")).await.unwrap();

        assert_eq!(response.user.username, "alice");
        assert_eq!(f.tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_login_rejects_inactive_user() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();
        f.users.deactivate(registered.user.id);

        assert!(matches!(
            f.service.login(login_request("alice", "s3cretpass")).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();
        let old = registered.refresh_token;

        let refreshed = f.service.refresh_tokens(refresh_request(&old)).await.unwrap();
        assert_ne!(refreshed.refresh_token, old);

        // Old token is gone, even though its signature is still valid
        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&old)).await,
            Err(AuthError::RefreshTokenNotFound)
        ));

        // The new one works exactly once
        let again = f
            .service
            .refresh_tokens(refresh_request(&refreshed.refresh_token))
            .await
            .unwrap();
        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&refreshed.refresh_token)).await,
            Err(AuthError::RefreshTokenNotFound)
        ));

        assert!(f.service.refresh_tokens(refresh_request(&again.refresh_token)).await.is_ok());
        assert_eq!(f.tokens.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_bad_tokens() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();

        assert!(matches!(
            f.service.refresh_tokens(refresh_request("garbage")).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        // An access token is not a refresh token
        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&registered.access_token)).await,
            Err(AuthError::InvalidRefreshToken)
        ));
        assert!(matches!(
            f.service.refresh_tokens(refresh_request("")).await,
            Err(AuthError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rejects_expired_token() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();

        let expired = f
            .service
            .token_service()
            .generate_refresh_token_with_ttl(registered.user.id, chrono::Duration::seconds(-1))
            .unwrap();

        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&expired.token)).await,
            Err(AuthError::InvalidRefreshToken)
        ));
    }

    #[tokio::test]
    async fn test_unrecorded_signed_token_is_not_found() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();

        // Correctly signed, but never persisted
        let forged = f
            .service
            .token_service()
            .generate_refresh_token(registered.user.id)
            .unwrap();

        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&forged.token)).await,
            Err(AuthError::RefreshTokenNotFound)
        ));
    }

    #[tokio::test]
    async fn test_logout_revokes_single_session() {
        let f = fixture();
        let first = f.service.register(register_request("alice")).await.unwrap();
        let second = f.service.login(login_request("alice", "s3cretpass")).await.unwrap();

        f.service.logout(first.user.id, &first.refresh_token).await.unwrap();

        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&first.refresh_token)).await,
            Err(AuthError::RefreshTokenNotFound)
        ));
        assert!(f.service.refresh_tokens(refresh_request(&second.refresh_token)).await.is_ok());

        // Logging out twice is harmless
        f.service.logout(first.user.id, &first.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_cannot_revoke_other_users_token() {
        let f = fixture();
        let alice = f.service.register(register_request("alice")).await.unwrap();
        let bob = f.service.register(register_request("bob")).await.unwrap();

        assert!(matches!(
            f.service.logout(bob.user.id, &alice.refresh_token).await,
            Err(AuthError::RefreshTokenNotFound)
        ));
        assert!(f.service.refresh_tokens(refresh_request(&alice.refresh_token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_all_only_affects_one_user() {
        let f = fixture();
        let alice1 = f.service.register(register_request("alice")).await.unwrap();
        let alice2 = f.service.login(login_request("alice", "s3cretpass")).await.unwrap();
        let bob = f.service.register(register_request("bob")).await.unwrap();

        assert_eq!(f.service.logout_all(alice1.user.id).await.unwrap(), 2);

        for token in [&alice1.refresh_token, &alice2.refresh_token] {
            assert!(matches!(
                f.service.refresh_tokens(refresh_request(token)).await,
                Err(AuthError::RefreshTokenNotFound)
            ));
        }
        assert!(f.service.refresh_tokens(refresh_request(&bob.refresh_token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password_revokes_all_sessions() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();
        let user_id = registered.user.id;

        let wrong = ChangePasswordRequest {
            current_password: "not-it".to_string(),
            new_password: "n3wpassword".to_string(),
        };
        assert!(matches!(
            f.service.change_password(user_id, wrong).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert_eq!(f.tokens.len(), 1);

        let request = ChangePasswordRequest {
            current_password: "s3cretpass".to_string(),
            new_password: "n3wpassword".to_string(),
        };
        f.service.change_password(user_id, request).await.unwrap();

        assert!(f.tokens.is_empty());
        assert!(matches!(
            f.service.refresh_tokens(refresh_request(&registered.refresh_token)).await,
            Err(AuthError::RefreshTokenNotFound)
        ));
        assert!(f.service.login(login_request("alice", "s3cretpass")).await.is_err());
        assert!(f.service.login(login_request("alice", "n3wpassword")).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_profile() {
        let f = fixture();
        let alice = f.service.register(register_request("alice")).await.unwrap();
        f.service.register(register_request("bob")).await.unwrap();

        let taken = UpdateProfileRequest {
            username: "bob".to_string(),
            email: "alice@example.com".to_string(),
        };
        assert!(matches!(
            f.service.update_profile(alice.user.id, taken).await,
            Err(AuthError::DuplicateUser("Username"))
        ));

        let update = UpdateProfileRequest {
            username: "alice_new".to_string(),
            email: "alice@example.com".to_string(),
        };
        let updated = f.service.update_profile(alice.user.id, update).await.unwrap();
        assert_eq!(updated.username, "alice_new");

        let profile = f.service.get_profile(alice.user.id).await.unwrap();
        assert_eq!(profile.username, "alice_new");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_has_single_winner() {
        let f = fixture();
        let registered = f.service.register(register_request("alice")).await.unwrap();
        let token = registered.refresh_token;

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let service = f.service.clone();
                let token = token.clone();
                tokio::spawn(async move { service.refresh_tokens(refresh_request(&token)).await })
            })
            .collect();

        let mut successes = 0;
        let mut not_found = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(AuthError::RefreshTokenNotFound) => not_found += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(not_found, 11);
        assert_eq!(f.tokens.len(), 1);
    }

    /// Token store whose calls never complete
    struct StalledStore;

    #[async_trait]
    impl RefreshTokenStore for StalledStore {
        async fn put(&self, _token: NewRefreshToken) -> Result<(), AuthError> {
            std::future::pending().await
        }
        async fn get(&self, _hash: &str) -> Result<Option<RefreshTokenRecord>, AuthError> {
            std::future::pending().await
        }
        async fn delete(&self, _hash: &str) -> Result<bool, AuthError> {
            std::future::pending().await
        }
        async fn delete_all_for(&self, _user_id: i32) -> Result<u64, AuthError> {
            std::future::pending().await
        }
        async fn rotate(&self, _old: &str, _new: NewRefreshToken) -> Result<bool, AuthError> {
            std::future::pending().await
        }
        async fn sweep_expired(&self) -> Result<u64, AuthError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let service = AuthService::new(
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(StalledStore),
            TokenService::new("access_secret_for_tests", "refresh_secret_for_tests"),
        )
        .with_store_timeout(Duration::from_millis(50));

        assert!(matches!(service.logout_all(1).await, Err(AuthError::Timeout(_))));
    }
}
