//! Rate and concurrency limiting.

mod client_key;
mod concurrency;
mod fixed_window;
mod limiter;
mod sliding_window;

pub use client_key::{ClientKey, ClientKeyResolver, RequestOrigin, VerifiedSubject, UNKNOWN_CLIENT};
pub use concurrency::{ConcurrencyLimiter, Lease, CONCURRENCY_NAMESPACE};
pub use fixed_window::FixedWindow;
pub use limiter::{Algorithm, RateLimiter};
pub use sliding_window::SlidingWindowLog;
