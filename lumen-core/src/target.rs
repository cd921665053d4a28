//! Device targets: the 6-byte identifier and its 12-hex-char serial form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of bytes in a target.
pub const TARGET_LEN: usize = 6;

/// Device identifier. Equality and hashing use the raw bytes; the serial string
/// is only used at API boundaries.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Target(#[serde(with = "bytes_6")] [u8; TARGET_LEN]);

mod bytes_6 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 6], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 6], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 6 bytes"))
    }
}

impl Target {
    pub const fn new(bytes: [u8; TARGET_LEN]) -> Self {
        Target(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TARGET_LEN] {
        &self.0
    }

    /// Build a target from raw bytes. Longer inputs (e.g. the 8-byte wire
    /// target field) are truncated to the first six bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TargetError> {
        if bytes.len() < TARGET_LEN {
            return Err(TargetError::TooShort(bytes.len()));
        }
        let mut out = [0u8; TARGET_LEN];
        out.copy_from_slice(&bytes[..TARGET_LEN]);
        Ok(Target(out))
    }

    /// Parse a hex serial. Anything past the first 12 hex chars is ignored.
    pub fn parse(serial: &str) -> Result<Self, TargetError> {
        let serial = serial.trim();
        if serial.len() % 2 != 0 || !serial.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TargetError::InvalidHex(serial.to_string()));
        }
        let mut bytes = Vec::with_capacity(serial.len() / 2);
        for i in (0..serial.len()).step_by(2) {
            let pair = serial
                .get(i..i + 2)
                .ok_or_else(|| TargetError::InvalidHex(serial.to_string()))?;
            let b = u8::from_str_radix(pair, 16)
                .map_err(|_| TargetError::InvalidHex(serial.to_string()))?;
            bytes.push(b);
        }
        Self::from_slice(&bytes)
    }

    pub fn serial(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self)
    }
}

/// Parse a comma-separated list of serials, skipping empty entries.
pub fn parse_serials(list: &str) -> Result<Vec<Target>, TargetError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Target::parse)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("serial is not valid hex: {0:?}")]
    InvalidHex(String),
    #[error("target needs at least 6 bytes, got {0}")]
    TooShort(usize),
}
