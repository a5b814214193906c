//! Rate limiting with pluggable admission algorithms and backpressure.
//!
//! - [`RateAlgorithm`]: decides synchronously whether a request may pass
//! - [`RateLimiter`]: one algorithm plus a [`BackpressureStrategy`] applied when
//!   the algorithm says no
//! - [`RateLimiterPool`]: a global limiter combined with lazily created
//!   per-[`HostKey`] limiters

mod algorithm;
mod config;
pub(crate) mod headers;
mod key;
mod limiter;
mod pool;

pub use algorithm::{AdaptiveRate, LeakyBucket, RateAlgorithm, SlidingWindow, TokenBucket, build};
pub use config::{Algorithm, BackpressureStrategy, RateLimitConfig};
pub use key::HostKey;
pub use limiter::{RateLimitStatus, RateLimiter};
pub use pool::{GLOBAL_KEY, KeyConfigs, RateLimitPermit, RateLimiterPool};
