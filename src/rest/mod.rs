pub mod client;
pub mod rate_limit;

pub use client::RestClient;
pub use rate_limit::RateLimiter;
