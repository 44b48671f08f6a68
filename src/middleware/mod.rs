// Shared HTTP middleware: per-client rate limiting and GET response caching

pub mod cache;
pub mod rate_limit;

pub use cache::{cache_responses, ResponseCache};
pub use rate_limit::{client_identity, rate_limit, RateLimiter};
