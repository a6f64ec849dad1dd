//! Finger enumeration and its stable wire/storage encodings.
//!
//! Fingers appear in three encodings that must stay in sync:
//! - the wire name (`"left-thumb"`, ..., with `"any"` accepted for
//!   [`Finger::Unknown`]),
//! - the numeric code used as the single-hex-digit print filename,
//! - the Rust enum used everywhere in-process.

use serde::{Deserialize, Serialize};

/// A finger a print can be bound to.
///
/// `Unknown` doubles as the "any finger" wildcard on operation inputs;
/// operations that require a concrete finger reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Finger {
    Unknown,
    LeftThumb,
    LeftIndexFinger,
    LeftMiddleFinger,
    LeftRingFinger,
    LeftLittleFinger,
    RightThumb,
    RightIndexFinger,
    RightMiddleFinger,
    RightRingFinger,
    RightLittleFinger,
}

/// The ten concrete fingers, in enum (and storage-code) order.
const NAMED: [Finger; 10] = [
    Finger::LeftThumb,
    Finger::LeftIndexFinger,
    Finger::LeftMiddleFinger,
    Finger::LeftRingFinger,
    Finger::LeftLittleFinger,
    Finger::RightThumb,
    Finger::RightIndexFinger,
    Finger::RightMiddleFinger,
    Finger::RightRingFinger,
    Finger::RightLittleFinger,
];

impl Finger {
    /// Parses a wire finger name.
    ///
    /// Empty strings and `"any"` resolve to [`Finger::Unknown`], as do
    /// unrecognized tokens; callers that need a concrete finger must check
    /// with [`Finger::is_named`] and fail with `invalid-fingername`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.is_empty() || name == "any" {
            return Self::Unknown;
        }
        NAMED
            .iter()
            .copied()
            .find(|f| f.name() == name)
            .unwrap_or(Self::Unknown)
    }

    /// The wire name. `Unknown` reports as `"any"`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "any",
            Self::LeftThumb => "left-thumb",
            Self::LeftIndexFinger => "left-index-finger",
            Self::LeftMiddleFinger => "left-middle-finger",
            Self::LeftRingFinger => "left-ring-finger",
            Self::LeftLittleFinger => "left-little-finger",
            Self::RightThumb => "right-thumb",
            Self::RightIndexFinger => "right-index-finger",
            Self::RightMiddleFinger => "right-middle-finger",
            Self::RightRingFinger => "right-ring-finger",
            Self::RightLittleFinger => "right-little-finger",
        }
    }

    /// Numeric storage code (1..=10); `Unknown` is 0 and never stored.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::LeftThumb => 1,
            Self::LeftIndexFinger => 2,
            Self::LeftMiddleFinger => 3,
            Self::LeftRingFinger => 4,
            Self::LeftLittleFinger => 5,
            Self::RightThumb => 6,
            Self::RightIndexFinger => 7,
            Self::RightMiddleFinger => 8,
            Self::RightRingFinger => 9,
            Self::RightLittleFinger => 10,
        }
    }

    /// Reverse of [`Finger::code`] for the valid range.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        NAMED.get(code.checked_sub(1)? as usize).copied()
    }

    /// Lowercase hex digit used as the print filename.
    #[must_use]
    pub fn hex_code(self) -> String {
        format!("{:x}", self.code())
    }

    /// Parses a print filename back into a finger.
    #[must_use]
    pub fn from_hex_code(s: &str) -> Option<Self> {
        if s.len() != 1 {
            return None;
        }
        let code = u8::from_str_radix(s, 16).ok()?;
        Self::from_code(code)
    }

    /// Whether this is one of the ten concrete fingers.
    #[must_use]
    pub fn is_named(self) -> bool {
        self != Self::Unknown
    }

    /// Iterates the ten concrete fingers in enum order.
    pub fn named() -> impl Iterator<Item = Self> {
        NAMED.iter().copied()
    }
}

impl std::fmt::Display for Finger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
