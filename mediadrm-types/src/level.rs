//! Security and output-protection levels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Robustness tier of key management, decode and crypto execution.
///
/// Ordered from weakest to strongest, so `a < b` means `a` is less robust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Level could not be determined. Never valid for opening a session.
    Unknown,
    /// Software-based whitebox crypto.
    SwSecureCrypto,
    /// Software-based whitebox crypto and an obfuscated decoder.
    SwSecureDecode,
    /// Key management and crypto inside a hardware-backed environment.
    HwSecureCrypto,
    /// Key management, crypto and decode inside a hardware-backed environment.
    HwSecureDecode,
    /// Every stage, including compressed and uncompressed buffers, is hardware-backed.
    HwSecureAll,
}

impl SecurityLevel {
    /// Every level that can be assigned to a session, weakest first.
    pub const ALL: [SecurityLevel; 5] = [
        Self::SwSecureCrypto,
        Self::SwSecureDecode,
        Self::HwSecureCrypto,
        Self::HwSecureDecode,
        Self::HwSecureAll,
    ];

    /// Returns the numeric code used on the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::SwSecureCrypto => 1,
            Self::SwSecureDecode => 2,
            Self::HwSecureCrypto => 3,
            Self::HwSecureDecode => 4,
            Self::HwSecureAll => 5,
        }
    }

    /// Parses a numeric level code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::SwSecureCrypto),
            2 => Some(Self::SwSecureDecode),
            3 => Some(Self::HwSecureCrypto),
            4 => Some(Self::HwSecureDecode),
            5 => Some(Self::HwSecureAll),
            _ => None,
        }
    }

    /// Returns true for the hardware-backed tiers.
    #[must_use]
    pub fn is_hardware_backed(self) -> bool {
        self >= Self::HwSecureCrypto
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::SwSecureCrypto => "SW_SECURE_CRYPTO",
            Self::SwSecureDecode => "SW_SECURE_DECODE",
            Self::HwSecureCrypto => "HW_SECURE_CRYPTO",
            Self::HwSecureDecode => "HW_SECURE_DECODE",
            Self::HwSecureAll => "HW_SECURE_ALL",
        };
        f.write_str(name)
    }
}

/// The level a caller asks for when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedLevel {
    /// The scheme's native level.
    #[default]
    Native,
    /// The maximum-level sentinel. Always resolves to the native level.
    Max,
    /// A specific level, subject to the configured fallback policy.
    At(SecurityLevel),
}

impl From<SecurityLevel> for RequestedLevel {
    fn from(level: SecurityLevel) -> Self {
        Self::At(level)
    }
}

/// HDCP level negotiated with (or supported by) downstream outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdcpLevel {
    /// Level is not known.
    #[default]
    Unknown,
    /// Outputs are unprotected.
    None,
    /// HDCP 1.x.
    V1,
    /// HDCP 2.0.
    V2,
    /// HDCP 2.1.
    V2_1,
    /// HDCP 2.2.
    V2_2,
    /// HDCP 2.3.
    V2_3,
    /// No digital output is present.
    NoDigitalOutput,
}
