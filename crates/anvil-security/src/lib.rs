pub mod abuse;
pub mod rate_limiter;

pub use abuse::{AbuseEvent, AbuseTracker};
pub use rate_limiter::{RateLimitScope, RateLimiter};
