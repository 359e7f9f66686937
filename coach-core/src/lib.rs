//! Coach Core - Shared Types
//!
//! Query keys, the injectable clock, and the error taxonomy used by every
//! other crate in the workspace. No caching behavior lives here.

pub mod clock;
pub mod error;
pub mod key;

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, CoachError, CoachResult, ConfigError, FetchError};
pub use key::{KeySegment, QueryKey};
