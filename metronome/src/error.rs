/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Stable error taxonomy for every public reservation operation.
//!
//! Variants deliberately carry no payload: each error maps one-to-one onto a
//! stable integer code ([`QosError::code`]) so host gateways (ioctl shims,
//! RPC bridges) can forward failures without re-encoding them, exactly like
//! an errno. Context that would otherwise live in a payload (offending
//! parameter values, server ids) is emitted as structured `tracing` fields
//! at the failure site instead.

use thiserror::Error;

/// Result alias used by every fallible reservation operation.
pub type QosResult<T> = Result<T, QosError>;

/// Integer code for a successful operation, for hosts mirroring the wire
/// convention (`code() < 0` on failure).
pub const QOS_OK: i32 = 0;

/// Failure of a reservation, supervisor or facade operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QosError {
    /// Unspecified failure; only produced when no other variant applies.
    #[error("generic failure")]
    Generic,

    /// An allocation was refused by the host allocator.
    #[error("out of memory")]
    NoMemory,

    /// Structurally invalid input: period below the minimum, budget above
    /// the period, negative durations, unknown flag bits.
    #[error("invalid parameter")]
    InvalidParam,

    /// The calling principal may not affect the target task or server, or
    /// requested flags its rule set forbids.
    #[error("operation not authorized")]
    Unauthorized,

    /// Recognised request that this build does not support, e.g. changing
    /// flags through a parameter update.
    #[error("operation not implemented")]
    Unimplemented,

    /// A required collaborator is absent.
    #[error("required component is missing")]
    MissingComponent,

    /// Operation invoked out of order with respect to the component
    /// lifecycle, or against state that contradicts it.
    #[error("inconsistent state for the requested operation")]
    InconsistentState,

    /// An admission test failed: granting the request would push total
    /// guaranteed utilisation past the configured ceiling.
    #[error("admission test failed: system overload")]
    SystemOverload,

    /// Invariant violation inside the scheduler. Should not occur; the
    /// failure site logs full context before returning this.
    #[error("internal invariant violated")]
    Internal,

    /// The referenced server or task is not registered.
    #[error("server or task not found")]
    NotFound,

    /// A bounded container refused a further element.
    #[error("container full")]
    Full,

    /// An extraction was attempted from an empty container.
    #[error("container empty")]
    Empty,
}

impl QosError {
    /// Stable integer code for this error. Never reused or renumbered.
    pub fn code(self) -> i32 {
        match self {
            QosError::Generic => -16,
            QosError::NoMemory => -17,
            QosError::InvalidParam => -18,
            QosError::Unauthorized => -19,
            QosError::Unimplemented => -20,
            QosError::MissingComponent => -21,
            QosError::InconsistentState => -22,
            QosError::SystemOverload => -23,
            QosError::Internal => -24,
            QosError::NotFound => -25,
            QosError::Full => -26,
            QosError::Empty => -27,
        }
    }

    /// Inverse of [`code`](Self::code); `None` for unknown codes (including
    /// [`QOS_OK`], which is not an error).
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -16 => QosError::Generic,
            -17 => QosError::NoMemory,
            -18 => QosError::InvalidParam,
            -19 => QosError::Unauthorized,
            -20 => QosError::Unimplemented,
            -21 => QosError::MissingComponent,
            -22 => QosError::InconsistentState,
            -23 => QosError::SystemOverload,
            -24 => QosError::Internal,
            -25 => QosError::NotFound,
            -26 => QosError::Full,
            -27 => QosError::Empty,
            _ => return None,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [QosError; 12] = [
        QosError::Generic,
        QosError::NoMemory,
        QosError::InvalidParam,
        QosError::Unauthorized,
        QosError::Unimplemented,
        QosError::MissingComponent,
        QosError::InconsistentState,
        QosError::SystemOverload,
        QosError::Internal,
        QosError::NotFound,
        QosError::Full,
        QosError::Empty,
    ];

    #[test]
    fn codes_are_stable_and_contiguous() {
        for (i, e) in ALL.iter().enumerate() {
            assert_eq!(e.code(), -16 - i as i32);
        }
    }

    #[test]
    fn code_round_trips() {
        for e in ALL {
            assert_eq!(QosError::from_code(e.code()), Some(e));
        }
    }

    #[test]
    fn unknown_codes_map_to_none() {
        assert_eq!(QosError::from_code(0), None);
        assert_eq!(QosError::from_code(-1), None);
        assert_eq!(QosError::from_code(-28), None);
        assert_eq!(QosError::from_code(QOS_OK), None);
    }

    #[test]
    fn display_is_human_readable() {
        let msg = QosError::SystemOverload.to_string();
        assert!(msg.contains("overload"), "got: {msg}");
    }
}
