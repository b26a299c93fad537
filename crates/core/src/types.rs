//! Request lifecycle types shared across the process boundary
//!
//! Both enums are stored in shared memory as plain `u32` values, so each
//! has a stable discriminant and a checked conversion back from the raw word.

use crate::errors::{Error, Result};
use std::fmt;

/// Lifecycle state of one request slot
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    Empty = 0,
    Pending = 1,
    InProgress = 2,
    Done = 3,
    Error = 4,
}

impl SlotStatus {
    /// Whether moving from `self` to `next` is a legal slot transition.
    ///
    /// The only cycle is EMPTY → PENDING → IN_PROGRESS → {DONE, ERROR} → EMPTY.
    #[must_use]
    pub const fn can_transition_to(self, next: SlotStatus) -> bool {
        matches!(
            (self, next),
            (SlotStatus::Empty, SlotStatus::Pending)
                | (SlotStatus::Pending, SlotStatus::InProgress)
                | (SlotStatus::InProgress, SlotStatus::Done)
                | (SlotStatus::InProgress, SlotStatus::Error)
                | (SlotStatus::Done, SlotStatus::Empty)
                | (SlotStatus::Error, SlotStatus::Empty)
        )
    }

    /// A finished request waiting for the proxy's acknowledgement
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, SlotStatus::Done | SlotStatus::Error)
    }

    /// Decode a status word read from shared memory
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(SlotStatus::Empty),
            1 => Ok(SlotStatus::Pending),
            2 => Ok(SlotStatus::InProgress),
            3 => Ok(SlotStatus::Done),
            4 => Ok(SlotStatus::Error),
            other => Err(Error::protocol(format!("invalid slot status {other}"))),
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotStatus::Empty => "EMPTY",
            SlotStatus::Pending => "PENDING",
            SlotStatus::InProgress => "IN_PROGRESS",
            SlotStatus::Done => "DONE",
            SlotStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Result recorded on a finished slot
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// All `result_size` bytes were delivered
    Ok = 0,
    /// The path is not in the cache index
    NotFound = 1,
    /// Disk read failure or stalled reader
    TransferFailed = 2,
    /// Cut short by daemon shutdown
    Aborted = 3,
}

impl Outcome {
    /// Slot status that records this outcome
    #[must_use]
    pub const fn status(self) -> SlotStatus {
        match self {
            Outcome::Ok => SlotStatus::Done,
            _ => SlotStatus::Error,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Outcome::Ok),
            1 => Ok(Outcome::NotFound),
            2 => Ok(Outcome::TransferFailed),
            3 => Ok(Outcome::Aborted),
            other => Err(Error::protocol(format!("invalid request outcome {other}"))),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Ok => "ok",
            Outcome::NotFound => "not found",
            Outcome::TransferFailed => "transfer failed",
            Outcome::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Final state of a request as observed by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub id: u64,
    pub status: SlotStatus,
    pub outcome: Outcome,
    pub result_size: u64,
}

impl Completion {
    /// Turn a failed completion into the matching error
    pub fn into_result(self, path: &str) -> Result<u64> {
        match self.outcome {
            Outcome::Ok => Ok(self.result_size),
            Outcome::NotFound => Err(Error::not_found(path)),
            Outcome::TransferFailed => Err(Error::transfer(path, "daemon reported a failed transfer")),
            Outcome::Aborted => Err(Error::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SlotStatus; 5] = [
        SlotStatus::Empty,
        SlotStatus::Pending,
        SlotStatus::InProgress,
        SlotStatus::Done,
        SlotStatus::Error,
    ];

    #[test]
    fn test_slot_lifecycle_has_exactly_six_edges() {
        let edges: Vec<_> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(edges.len(), 6);
        assert!(!SlotStatus::Pending.can_transition_to(SlotStatus::Empty));
        assert!(!SlotStatus::InProgress.can_transition_to(SlotStatus::Empty));
        assert!(!SlotStatus::Done.can_transition_to(SlotStatus::Pending));
    }

    #[test]
    fn test_raw_status_words_decode() {
        for status in ALL {
            assert_eq!(SlotStatus::from_raw(status as u32).unwrap(), status);
        }
        assert!(SlotStatus::from_raw(9).is_err());
    }

    #[test]
    fn test_outcome_maps_to_status_and_error() {
        assert_eq!(Outcome::Ok.status(), SlotStatus::Done);
        assert_eq!(Outcome::NotFound.status(), SlotStatus::Error);

        let missing = Completion {
            id: 7,
            status: SlotStatus::Error,
            outcome: Outcome::NotFound,
            result_size: 0,
        };
        assert!(matches!(
            missing.into_result("/nope"),
            Err(Error::NotFound { path }) if path == "/nope"
        ));
    }
}
