// Authgate: JWT authentication service with refresh token rotation and RBAC

pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod validation;
