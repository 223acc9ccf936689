//! Lock modes and the static compatibility matrix.
//!
//! Modes are ordered by strength:
//!
//! ```text
//! NL < CR < PR < PW < EX
//! ```
//!
//! Compatibility is looked up in a fixed table rather than derived from the
//! ordering. The table is monotone in the ordering: every mode is compatible
//! with a subset of what any weaker mode is compatible with.
//!
//! |    | NL | CR | PR | PW | EX |
//! |----|----|----|----|----|----|
//! | NL | y  | y  | y  | y  | y  |
//! | CR | y  | y  | y  | y  | n  |
//! | PR | y  | y  | y  | n  | n  |
//! | PW | y  | y  | n  | n  | n  |
//! | EX | y  | n  | n  | n  | n  |

use crate::error::{DlmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The strength of a claim on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Null: holds a place on the resource without restricting anyone.
    #[serde(rename = "NL")]
    NoLock,
    /// Concurrent read.
    #[serde(rename = "CR")]
    ConcurrentRead,
    /// Protected read (shared).
    #[serde(rename = "PR")]
    ProtectedRead,
    /// Protected write.
    #[serde(rename = "PW")]
    ProtectedWrite,
    /// Exclusive.
    #[serde(rename = "EX")]
    Exclusive,
}

const COMPAT: [[bool; 5]; 5] = [
    // NL    CR     PR     PW     EX
    [true, true, true, true, true],     // NL
    [true, true, true, true, false],    // CR
    [true, true, true, false, false],   // PR
    [true, true, false, false, false],  // PW
    [true, false, false, false, false], // EX
];

impl LockMode {
    /// All modes, weakest first.
    pub const ALL: [LockMode; 5] = [
        LockMode::NoLock,
        LockMode::ConcurrentRead,
        LockMode::ProtectedRead,
        LockMode::ProtectedWrite,
        LockMode::Exclusive,
    ];

    /// Whether a holder in `self` may coexist with a holder in `other`.
    pub fn compatible_with(self, other: LockMode) -> bool {
        COMPAT[self.index()][other.index()]
    }

    /// Short DLM mnemonic (`NL`, `CR`, `PR`, `PW`, `EX`).
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::NoLock => "NL",
            LockMode::ConcurrentRead => "CR",
            LockMode::ProtectedRead => "PR",
            LockMode::ProtectedWrite => "PW",
            LockMode::Exclusive => "EX",
        }
    }

    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self.index() as u8
    }

    /// Parse the wire representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| DlmError::Codec(format!("invalid lock mode byte {}", value)))
    }

    fn index(self) -> usize {
        match self {
            LockMode::NoLock => 0,
            LockMode::ConcurrentRead => 1,
            LockMode::ProtectedRead => 2,
            LockMode::ProtectedWrite => 3,
            LockMode::Exclusive => 4,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = DlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NL" | "NOLOCK" => Ok(LockMode::NoLock),
            "CR" | "CONCURRENTREAD" => Ok(LockMode::ConcurrentRead),
            "PR" | "PROTECTEDREAD" => Ok(LockMode::ProtectedRead),
            "PW" | "PROTECTEDWRITE" => Ok(LockMode::ProtectedWrite),
            "EX" | "EXCLUSIVE" => Ok(LockMode::Exclusive),
            _ => Err(DlmError::UserError(format!(
                "unknown lock mode '{}' (expected one of NL, CR, PR, PW, EX)",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_is_symmetric() {
        for a in LockMode::ALL {
            for b in LockMode::ALL {
                assert_eq!(
                    a.compatible_with(b),
                    b.compatible_with(a),
                    "{} vs {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn matrix_is_monotone_in_mode_order() {
        for pair in LockMode::ALL.windows(2) {
            let (weaker, stronger) = (pair[0], pair[1]);
            for other in LockMode::ALL {
                if stronger.compatible_with(other) {
                    assert!(weaker.compatible_with(other), "{} vs {}", weaker, other);
                }
            }
        }
    }

    #[test]
    fn protected_write_admits_only_concurrent_read() {
        assert!(LockMode::ProtectedWrite.compatible_with(LockMode::ConcurrentRead));
        assert!(!LockMode::ProtectedWrite.compatible_with(LockMode::ProtectedRead));
        assert!(!LockMode::ProtectedWrite.compatible_with(LockMode::ProtectedWrite));
        assert!(LockMode::ProtectedWrite.compatible_with(LockMode::NoLock));
    }

    #[test]
    fn shared_modes_coexist() {
        assert!(LockMode::ProtectedRead.compatible_with(LockMode::ProtectedRead));
        assert!(LockMode::ProtectedRead.compatible_with(LockMode::ConcurrentRead));
        assert!(!LockMode::Exclusive.compatible_with(LockMode::ConcurrentRead));
    }

    #[test]
    fn wire_byte_rejects_out_of_range() {
        assert_eq!(LockMode::from_u8(4).unwrap(), LockMode::Exclusive);
        assert!(matches!(LockMode::from_u8(5), Err(DlmError::Codec(_))));
    }

    #[test]
    fn parses_mnemonics_case_insensitively() {
        assert_eq!("ex".parse::<LockMode>().unwrap(), LockMode::Exclusive);
        assert_eq!("PR".parse::<LockMode>().unwrap(), LockMode::ProtectedRead);
        assert!("XX".parse::<LockMode>().is_err());
    }
}
