use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned creation time of a record.
///
/// Ordering follows the wrapped instant, which is what the message merge rule
/// relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}
