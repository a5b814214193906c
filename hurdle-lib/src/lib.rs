//! `hurdle` issues large volumes of HTTP requests against sites guarded by
//! an anti-bot edge service. It keeps them within concurrency and rate
//! envelopes and resolves the challenges the edge interposes where that
//! is possible without a browser.
//!
//! "Hello world" example:
//! ```no_run
//! use hurdle_lib::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let response = hurdle_lib::get("https://example.com").await?;
//!   println!("{}", response.response.status);
//!   Ok(())
//! }
//! ```
//!
//! For anything beyond a single request, build a client once with the
//! `ClientBuilder` and share it:
//!
//! ```no_run
//! use hurdle_lib::{ClientBuilder, ClientConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let config = ClientConfig::from_toml_str("requests_per_second = 2.0")?;
//!   let client = ClientBuilder::builder().config(config).build().client()?;
//!   let response = client.get("https://example.com").await?;
//!   if let Some(challenge) = response.challenge {
//!     println!("passed a {} challenge", challenge.challenge_type);
//!   }
//!   println!("{}", client.metrics().to_json().unwrap_or_default());
//!   client.shutdown().await;
//!   Ok(())
//! }
//! ```

mod client;
mod dispatch;
mod retry;
mod types;
mod waiter;

pub mod challenge;
pub mod config;
pub mod monitor;
pub mod ratelimit;
pub mod scheduler;
pub mod transport;
pub mod window;

#[cfg(test)]
pub(crate) mod test_utils;

pub use challenge::{
    ChallengeDetector, ChallengeInfo, ChallengeOrchestrator, ChallengeResult, ChallengeSolver,
    ChallengeType, JsEvaluator,
};
pub use client::{Client, ClientBuilder, ClientMetrics, ClientResponse, RequestSpec, get};
pub use config::{ClientConfig, ConfigError};
pub use dispatch::Dispatcher;
pub use monitor::{Monitor, PerformanceMetrics};
pub use ratelimit::{RateLimiter, RateLimiterPool};
pub use scheduler::TaskScheduler;
pub use transport::{FingerprintProvider, ReqwestTransport, Transport, TransportError};
pub use types::*;
