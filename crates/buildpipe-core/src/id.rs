//! Pipeline entry identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle returned by [`crate::pipeline::Pipeline::attach`].
///
/// `0` is reserved to mean "invalid" — it is returned when attachment is
/// rejected (bad phase flags, or the pipeline has already begun execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(u32);

impl StageId {
    /// The reserved invalid id.
    pub const INVALID: StageId = StageId(0);

    pub(crate) fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
