// Authentication module
// Dual-token sessions with refresh rotation, password hashing and role/permission checks

pub mod error;
pub mod handlers;
pub mod memory;
pub mod middleware;
pub mod models;
pub mod password;
pub mod repository;
pub mod service;
pub mod token;

// Re-export commonly used types
pub use error::AuthError;
pub use middleware::{authenticate, enforce, AuthenticatedUser, RequireAccess};
pub use models::{AuthResponse, Identity, Role, User, UserResponse};
pub use repository::{RefreshTokenStore, UserRepository};
pub use service::AuthService;
pub use token::{AccessClaims, TokenService};
