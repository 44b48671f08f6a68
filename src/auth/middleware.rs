// Authentication and authorization middleware for protected routes

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use crate::auth::{
    error::AuthError,
    token::{AccessClaims, TokenService},
};

/// Extract the bearer token from an Authorization header
///
/// The header must be exactly `Bearer`, one space, and a non-empty token.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::MalformedAuth)?;

    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) if !token.is_empty() => Ok(token),
        _ => Err(AuthError::MalformedAuth),
    }
}

/// Validate the bearer access token and attach its claims to the request
pub async fn authenticate(
    State(tokens): State<TokenService>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let endpoint = request.uri().path().to_string();

    let claims = bearer_token(request.headers())
        .and_then(|token| tokens.validate_access_token(token))
        .map_err(|e| {
            debug!(endpoint = %endpoint, error = %e, "Authentication failed");
            e
        })?;

    debug!(user_id = claims.user_id, endpoint = %endpoint, "Request authenticated");
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Authenticated caller, available to handlers behind [`authenticate`]
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i32,
    pub claims: AccessClaims,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts
            .extensions
            .get::<AccessClaims>()
            .cloned()
            .ok_or(AuthError::MissingAuth)?;

        Ok(AuthenticatedUser {
            user_id: claims.user_id,
            claims,
        })
    }
}

/// Authorization requirement checked against the attached claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequireAccess {
    Permission(String),
    Role(String),
    AnyRole(Vec<String>),
}

impl RequireAccess {
    pub fn permission(name: &str) -> Self {
        Self::Permission(name.to_string())
    }

    pub fn role(name: &str) -> Self {
        Self::Role(name.to_string())
    }

    pub fn any_role(names: &[&str]) -> Self {
        Self::AnyRole(names.iter().map(|name| name.to_string()).collect())
    }

    /// Check `claims` against this requirement
    pub fn check(&self, claims: &AccessClaims) -> Result<(), AuthError> {
        let satisfied = match self {
            RequireAccess::Permission(name) => claims.has_permission(name),
            RequireAccess::Role(name) => claims.has_role(name),
            RequireAccess::AnyRole(names) => claims.has_any_role(names.as_slice()),
        };

        if satisfied {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                required: self.describe(),
            })
        }
    }

    fn describe(&self) -> String {
        match self {
            RequireAccess::Permission(name) => format!("permission '{}'", name),
            RequireAccess::Role(name) => format!("role '{}'", name),
            RequireAccess::AnyRole(names) => format!("any role of [{}]", names.join(", ")),
        }
    }
}

/// Enforce a [`RequireAccess`] guard; must run after [`authenticate`]
pub async fn enforce(
    State(requirement): State<RequireAccess>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let endpoint = request.uri().path();
    let claims = request
        .extensions()
        .get::<AccessClaims>()
        .ok_or(AuthError::MissingAuth)?;

    if let Err(e) = requirement.check(claims) {
        warn!(
            user_id = claims.user_id,
            endpoint = %endpoint,
            error = %e,
            "Authorization denied"
        );
        return Err(e);
    }

    debug!(user_id = claims.user_id, endpoint = %endpoint, "Authorization granted");
    Ok(next.run(request).await)
}
