use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Scheduling priority of a task.
///
/// Ordering follows importance, so `Critical > High > Normal > Low`.
/// The numeric weight (1 to 4) also feeds the adaptive-delay backpressure
/// formula of the rate limiter.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Priority {
    /// Background work, may starve under sustained load
    Low = 1,
    /// Default priority
    #[default]
    Normal = 2,
    /// Preferred over normal work
    High = 3,
    /// Always scheduled first
    Critical = 4,
}

impl Priority {
    /// Numeric weight of this priority, from 1 (`Low`) to 4 (`Critical`)
    #[must_use]
    pub const fn weight(self) -> u8 {
        self as u8
    }
}
