#![allow(unreachable_pub)]

mod error;
mod request;
mod priority;

pub use error::{Backpressure, ErrorKind};
pub use request::{DEFAULT_REQUEST_TIMEOUT, HttpRequest, HttpResponse};
pub use priority::Priority;

/// The hurdle `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
