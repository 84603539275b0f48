mod error_handler;
pub mod identity;
pub mod rate_limit;

pub use error_handler::log_errors;
pub use identity::ClientIdentity;
pub use rate_limit::{RateLimitResult, RateLimiter, create_rate_limit_headers, rate_limit};
