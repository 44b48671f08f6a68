// HTTP handlers for authentication and account endpoints

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::auth::{
    error::AuthError,
    middleware::AuthenticatedUser,
    models::{
        AuthResponse, ChangePasswordRequest, LoginRequest, LogoutRequest, MessageResponse,
        RefreshRequest, RegisterRequest, Role, SweepResponse, UpdateProfileRequest, UserResponse,
    },
    service::AuthService,
};

/// JSON body extractor whose rejections use the API error shape
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(Self(value))
    }
}

/// Register a new user
#[utoipa::path(
    post,
    path = "/api/v1/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = AuthResponse),
        (status = 400, description = "Invalid input", body = crate::error::ErrorResponse),
        (status = 409, description = "Username or email taken", body = crate::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn register_handler(
    State(service): State<Arc<AuthService>>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AuthError> {
    let response = service.register(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Login with username and password
#[utoipa::path(
    post,
    path = "/api/v1/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn login_handler(
    State(service): State<Arc<AuthService>>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    Ok(Json(service.login(request).await?))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/api/v1/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens rotated", body = AuthResponse),
        (status = 401, description = "Invalid, expired, rotated or revoked refresh token", body = crate::error::ErrorResponse)
    ),
    tag = "auth"
)]
pub async fn refresh_handler(
    State(service): State<Arc<AuthService>>,
    ApiJson(request): ApiJson<RefreshRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    Ok(Json(service.refresh_tokens(request).await?))
}

/// Revoke one refresh token of the caller
#[utoipa::path(
    post,
    path = "/api/v1/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Unauthenticated", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn logout_handler(
    user: AuthenticatedUser,
    State(service): State<Arc<AuthService>>,
    ApiJson(request): ApiJson<LogoutRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    request.validate()?;
    service.logout(user.user_id, &request.refresh_token).await?;
    Ok(Json(MessageResponse::new("Logged out successfully")))
}

/// Revoke every refresh token of the caller
#[utoipa::path(
    post,
    path = "/api/v1/logout-all",
    responses(
        (status = 200, description = "All sessions revoked", body = MessageResponse),
        (status = 401, description = "Unauthenticated", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn logout_all_handler(
    user: AuthenticatedUser,
    State(service): State<Arc<AuthService>>,
) -> Result<Json<MessageResponse>, AuthError> {
    service.logout_all(user.user_id).await?;
    Ok(Json(MessageResponse::new("Logged out from all devices")))
}

/// Change the caller's password; revokes all sessions
#[utoipa::path(
    post,
    path = "/api/v1/change-password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Invalid input", body = crate::error::ErrorResponse),
        (status = 401, description = "Wrong current password", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "auth"
)]
pub async fn change_password_handler(
    user: AuthenticatedUser,
    State(service): State<Arc<AuthService>>,
    ApiJson(request): ApiJson<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    service.change_password(user.user_id, request).await?;
    Ok(Json(MessageResponse::new(
        "Password changed successfully. Please log in again.",
    )))
}

#[utoipa::path(
    get,
    path = "/api/v1/profile",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Unauthenticated", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn get_profile_handler(
    user: AuthenticatedUser,
    State(service): State<Arc<AuthService>>,
) -> Result<Json<UserResponse>, AuthError> {
    Ok(Json(service.get_profile(user.user_id).await?))
}

#[utoipa::path(
    put,
    path = "/api/v1/profile",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = UserResponse),
        (status = 400, description = "Invalid input", body = crate::error::ErrorResponse),
        (status = 409, description = "Username or email taken", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn update_profile_handler(
    user: AuthenticatedUser,
    State(service): State<Arc<AuthService>>,
    ApiJson(request): ApiJson<UpdateProfileRequest>,
) -> Result<Json<UserResponse>, AuthError> {
    Ok(Json(service.update_profile(user.user_id, request).await?))
}

/// Look up any user; moderators and admins with read_users only
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    params(("id" = i32, Path, description = "User id")),
    responses(
        (status = 200, description = "User found", body = UserResponse),
        (status = 403, description = "Insufficient permissions", body = crate::error::ErrorResponse),
        (status = 404, description = "User not found", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "users"
)]
pub async fn get_user_handler(
    State(service): State<Arc<AuthService>>,
    Path(id): Path<i32>,
) -> Result<Json<UserResponse>, AuthError> {
    Ok(Json(service.get_profile(id).await?))
}

/// Role catalog with permissions
#[utoipa::path(
    get,
    path = "/api/v1/roles",
    responses(
        (status = 200, description = "All roles", body = [Role])
    ),
    tag = "roles"
)]
pub async fn list_roles_handler(
    State(service): State<Arc<AuthService>>,
) -> Result<Json<Vec<Role>>, AuthError> {
    Ok(Json(service.list_roles().await?))
}

/// Remove expired refresh tokens now (admin only)
#[utoipa::path(
    post,
    path = "/api/v1/admin/sessions/sweep",
    responses(
        (status = 200, description = "Expired sessions removed", body = SweepResponse),
        (status = 403, description = "Admin role required", body = crate::error::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn sweep_sessions_handler(
    State(service): State<Arc<AuthService>>,
) -> Result<Json<SweepResponse>, AuthError> {
    let removed = service.sweep_expired_tokens().await?;
    Ok(Json(SweepResponse { removed }))
}
