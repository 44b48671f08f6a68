// JWT token generation and validation service

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{error::AuthError, models::Identity};

/// Default access token lifetime: 15 minutes
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 900;
/// Default refresh token lifetime: 7 days
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 604_800;

/// Access token claims: identity plus authorization data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,     // user_id as string
    pub user_id: i32,
    pub username: String,
    pub email: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub iat: i64,        // issued at timestamp
    pub exp: i64,        // expiration timestamp
}

impl AccessClaims {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|role| self.has_role(role.as_ref()))
    }
}

/// Refresh token claims: identity plus a unique token id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    pub user_id: i32,
    pub jti: String,     // unique per issued token
    pub iat: i64,
    pub exp: i64,
}

/// A signed refresh token together with the data needed to track it
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// Freshly issued access/refresh pair
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh: IssuedRefreshToken,
}

/// Token service for JWT operations
///
/// Access and refresh tokens are HS256-signed with two independent secrets,
/// and their claim shapes differ, so one kind can never be accepted as the
/// other.
#[derive(Clone)]
pub struct TokenService {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_token_duration: Duration,
    refresh_token_duration: Duration,
}

impl TokenService {
    /// Create a new TokenService with default lifetimes
    /// Access tokens expire in 15 minutes, refresh tokens in 7 days
    pub fn new(access_secret: &str, refresh_secret: &str) -> Self {
        Self::with_durations(
            access_secret,
            refresh_secret,
            Duration::seconds(DEFAULT_ACCESS_TTL_SECS),
            Duration::seconds(DEFAULT_REFRESH_TTL_SECS),
        )
    }

    pub fn with_durations(
        access_secret: &str,
        refresh_secret: &str,
        access_token_duration: Duration,
        refresh_token_duration: Duration,
    ) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(refresh_secret.as_bytes()),
            access_token_duration,
            refresh_token_duration,
        }
    }

    pub fn access_token_duration(&self) -> Duration {
        self.access_token_duration
    }

    pub fn refresh_token_duration(&self) -> Duration {
        self.refresh_token_duration
    }

    /// Generate an access token with the configured lifetime
    pub fn generate_access_token(&self, identity: &Identity) -> Result<String, AuthError> {
        self.generate_access_token_with_ttl(identity, self.access_token_duration)
    }

    /// Generate an access token with an explicit lifetime
    pub fn generate_access_token_with_ttl(
        &self,
        identity: &Identity,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();

        let claims = AccessClaims {
            sub: identity.user_id.to_string(),
            user_id: identity.user_id,
            username: identity.username.clone(),
            email: identity.email.clone(),
            roles: identity.roles.clone(),
            permissions: identity.permissions.clone(),
            iat: now,
            exp: now + ttl.num_seconds(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.access_encoding)
            .map_err(|e| AuthError::SigningError(e.to_string()))
    }

    /// Generate a refresh token with the configured lifetime
    pub fn generate_refresh_token(&self, user_id: i32) -> Result<IssuedRefreshToken, AuthError> {
        self.generate_refresh_token_with_ttl(user_id, self.refresh_token_duration)
    }

    /// Generate a refresh token with an explicit lifetime
    ///
    /// The JTI is a v4 UUID (122 random bits), which also makes every issued
    /// refresh token string, and therefore its stored hash, unique.
    pub fn generate_refresh_token_with_ttl(
        &self,
        user_id: i32,
        ttl: Duration,
    ) -> Result<IssuedRefreshToken, AuthError> {
        let now = Utc::now().timestamp();
        let exp = now + ttl.num_seconds();
        let jti = Uuid::new_v4().to_string();

        let claims = RefreshClaims {
            sub: user_id.to_string(),
            user_id,
            jti: jti.clone(),
            iat: now,
            exp,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.refresh_encoding)
            .map_err(|e| AuthError::SigningError(e.to_string()))?;

        let expires_at = Utc
            .timestamp_opt(exp, 0)
            .single()
            .ok_or_else(|| AuthError::SigningError(format!("Invalid expiry timestamp {}", exp)))?;

        Ok(IssuedRefreshToken { token, jti, expires_at })
    }

    /// Generate both access and refresh tokens
    pub fn generate_token_pair(&self, identity: &Identity) -> Result<TokenPair, AuthError> {
        let access_token = self.generate_access_token(identity)?;
        let refresh = self.generate_refresh_token(identity.user_id)?;
        Ok(TokenPair { access_token, refresh })
    }

    /// Validate an access token
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = Self::validate_token(token, &self.access_decoding)?;
        Self::ensure_unexpired(claims.exp)?;
        Ok(claims)
    }

    /// Validate a refresh token
    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        let claims: RefreshClaims = Self::validate_token(token, &self.refresh_decoding)?;
        Self::ensure_unexpired(claims.exp)?;
        Ok(claims)
    }

    /// Internal helper to validate any token
    fn validate_token<T: DeserializeOwned>(token: &str, key: &DecodingKey) -> Result<T, AuthError> {
        // Only HS256 is accepted; "none" and asymmetric algorithms fail here
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        decode::<T>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }

    /// A token is expired once the current time reaches `exp`
    fn ensure_unexpired(exp: i64) -> Result<(), AuthError> {
        if Utc::now().timestamp() >= exp {
            Err(AuthError::TokenExpired)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ACCESS_SECRET: &str = "test_access_secret_for_testing_purposes";
    const REFRESH_SECRET: &str = "test_refresh_secret_for_testing_purposes";

    // Helper to create a test token service
    fn test_token_service() -> TokenService {
        TokenService::new(ACCESS_SECRET, REFRESH_SECRET)
    }

    fn test_identity(user_id: i32, email: &str) -> Identity {
        Identity {
            user_id,
            username: format!("user{}", user_id),
            email: email.to_string(),
            roles: ["user".to_string()].into_iter().collect(),
            permissions: ["read_todos".to_string(), "write_todos".to_string()]
                .into_iter()
                .collect(),
        }
    }

    // Flip one character of a token to another base64url character
    fn tamper(token: &str, index: usize) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        chars[index] = match chars[index] {
            'A' => 'B',
            '.' => 'A',
            _ => 'A',
        };
        chars.into_iter().collect()
    }

    #[test]
    fn test_access_token_expiration_is_15_minutes() {
        let service = test_token_service();
        let token = service.generate_access_token(&test_identity(1, "test@example.com")).unwrap();
        let claims = service.validate_access_token(&token).unwrap();

        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_refresh_token_expiration_is_7_days() {
        let service = test_token_service();
        let issued = service.generate_refresh_token(1).unwrap();
        let claims = service.validate_refresh_token(&issued.token).unwrap();

        assert_eq!(claims.exp - claims.iat, 604800);
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(issued.expires_at.timestamp(), claims.exp);
    }

    #[test]
    fn test_access_claims_round_trip() {
        let service = test_token_service();
        let identity = test_identity(42, "user@example.com");

        let token = service.generate_access_token(&identity).unwrap();
        let claims = service.validate_access_token(&token).unwrap();

        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.username, identity.username);
        assert_eq!(claims.email, identity.email);
        assert_eq!(claims.roles, identity.roles);
        assert_eq!(claims.permissions, identity.permissions);
    }

    #[test]
    fn test_refresh_tokens_have_unique_jti() {
        let service = test_token_service();
        let first = service.generate_refresh_token(1).unwrap();
        let second = service.generate_refresh_token(1).unwrap();

        assert_ne!(first.jti, second.jti);
        assert_ne!(first.token, second.token);
    }

    #[test]
    fn test_expired_access_token_is_rejected() {
        let service = test_token_service();
        let identity = test_identity(1, "test@example.com");

        let expired = service
            .generate_access_token_with_ttl(&identity, Duration::seconds(-10))
            .unwrap();
        assert!(matches!(
            service.validate_access_token(&expired),
            Err(AuthError::TokenExpired)
        ));

        // exp == now counts as expired
        let boundary = service
            .generate_access_token_with_ttl(&identity, Duration::zero())
            .unwrap();
        assert!(matches!(
            service.validate_access_token(&boundary),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn test_expired_refresh_token_is_rejected() {
        let service = test_token_service();
        let issued = service
            .generate_refresh_token_with_ttl(1, Duration::seconds(-60))
            .unwrap();

        assert!(matches!(
            service.validate_refresh_token(&issued.token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn test_malformed_tokens_are_rejected() {
        let service = test_token_service();

        for token in [
            "",
            "not.a.token",
            "invalid_token_format",
            "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9.invalid.signature",
        ] {
            assert!(matches!(
                service.validate_access_token(token),
                Err(AuthError::InvalidToken)
            ));
        }
    }

    #[test]
    fn test_token_signature_verification() {
        let service1 = TokenService::new("secret1", "refresh1");
        let service2 = TokenService::new("secret2", "refresh2");

        let token = service1.generate_access_token(&test_identity(1, "test@example.com")).unwrap();

        assert!(service1.validate_access_token(&token).is_ok());
        assert!(matches!(
            service2.validate_access_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_token_kinds_are_not_interchangeable() {
        let service = test_token_service();
        let pair = service.generate_token_pair(&test_identity(1, "test@example.com")).unwrap();

        assert!(matches!(
            service.validate_access_token(&pair.refresh.token),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            service.validate_refresh_token(&pair.access_token),
            Err(AuthError::InvalidToken)
        ));

        // Even with a shared secret the claim shapes do not parse as each other
        let shared = TokenService::new("same", "same");
        let pair = shared.generate_token_pair(&test_identity(1, "test@example.com")).unwrap();
        assert!(shared.validate_access_token(&pair.refresh.token).is_err());
        assert!(shared.validate_refresh_token(&pair.access_token).is_err());
    }

    #[test]
    fn test_unexpected_algorithm_is_rejected() {
        let service = test_token_service();
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: "1".to_string(),
            user_id: 1,
            username: "user1".to_string(),
            email: "test@example.com".to_string(),
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
            iat: now,
            exp: now + 900,
        };

        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(ACCESS_SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            service.validate_access_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_claim_helpers() {
        let service = test_token_service();
        let token = service.generate_access_token(&test_identity(1, "test@example.com")).unwrap();
        let claims = service.validate_access_token(&token).unwrap();

        assert!(claims.has_permission("read_todos"));
        assert!(!claims.has_permission("delete_todos"));
        assert!(claims.has_role("user"));
        assert!(!claims.has_role("admin"));
        assert!(claims.has_any_role(&["admin", "user"]));
        assert!(!claims.has_any_role(&["admin", "moderator"]));
    }

    proptest! {
        #[test]
        fn prop_access_claims_round_trip(
            user_id in 1i32..1000000,
            email in "[a-z]{3,10}@[a-z]{3,10}\\.(com|org|net)",
            roles in proptest::collection::btree_set("[a-z]{3,10}", 0..4),
            permissions in proptest::collection::btree_set("[a-z_]{3,12}", 0..6)
        ) {
            let service = test_token_service();
            let identity = Identity {
                user_id,
                username: format!("user{}", user_id),
                email: email.clone(),
                roles: roles.clone(),
                permissions: permissions.clone(),
            };

            let token = service.generate_access_token(&identity)?;
            let claims = service.validate_access_token(&token)?;

            prop_assert_eq!(claims.user_id, user_id);
            prop_assert_eq!(claims.email, email);
            prop_assert_eq!(claims.roles, roles);
            prop_assert_eq!(claims.permissions, permissions);
            prop_assert_eq!(claims.exp - claims.iat, 900);
        }

        #[test]
        fn prop_refresh_claims_round_trip(user_id in 1i32..1000000) {
            let service = test_token_service();
            let issued = service.generate_refresh_token(user_id)?;
            let claims = service.validate_refresh_token(&issued.token)?;

            prop_assert_eq!(claims.user_id, user_id);
            prop_assert_eq!(claims.jti, issued.jti);
        }

        #[test]
        fn prop_tampered_tokens_are_rejected(position in 0.0f64..1.0) {
            let service = test_token_service();
            let token = service.generate_access_token(&test_identity(1, "test@example.com"))?;

            // Last character only carries padding bits of the signature; skip it
            let index = ((token.len() - 1) as f64 * position) as usize;
            let tampered = tamper(&token, index);
            prop_assume!(tampered != token);

            let result = service.validate_access_token(&tampered);
            prop_assert!(matches!(result, Err(AuthError::InvalidToken)));
        }

        #[test]
        fn prop_malformed_tokens_rejected(malformed in "[a-zA-Z0-9]{10,50}") {
            let service = test_token_service();
            prop_assert!(service.validate_access_token(&malformed).is_err());
            prop_assert!(service.validate_refresh_token(&malformed).is_err());
        }
    }
}
