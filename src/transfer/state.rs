//! Transfer State Definitions
//!
//! State IDs are stored as SMALLINT by the PostgreSQL ledger store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transfer status
///
/// ```text
/// PENDING ──▶ COMPLETED
///    │
///    └──────▶ FAILED
/// ```
///
/// Terminal states: COMPLETED (10), FAILED (-10). No other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransferStatus {
    /// Reserved and being processed; no money has moved yet, or the move is
    /// applied but not yet recorded (recovery resolves which)
    Pending = 0,

    /// Terminal: both sides applied
    Completed = 10,

    /// Terminal: rejected, neither side applied
    Failed = -10,
}

impl TransferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition
    #[inline]
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        *self == TransferStatus::Pending && next.is_terminal()
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferStatus::Pending),
            10 => Some(TransferStatus::Completed),
            -10 => Some(TransferStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferStatus::from_id(value).ok_or(())
    }
}
