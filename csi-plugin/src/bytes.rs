//! Byte sizes as written in plugin flags and configs.
//!
//! An integer followed by a unit, e.g. `4GB` or `0B`. Decimal-looking
//! suffixes (`KB`, `MB`, `GB`, `TB`, `PB`) are binary multiples, which is
//! what CSI plugins report capacity in.

use std::fmt::{self, Display};
use std::str::FromStr;

use bytesize::ByteSize;
use thiserror::Error;

/// A size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytes(ByteSize);

impl Bytes {
    pub const fn new(bytes: u64) -> Self {
        Self(ByteSize::b(bytes))
    }

    pub const fn bytes(self) -> u64 {
        self.0.0
    }

    /// Size in (possibly fractional) megabytes, the unit used for disk resources.
    pub fn megabytes(self) -> f64 {
        self.bytes() as f64 / bytesize::MIB as f64
    }
}

impl From<ByteSize> for Bytes {
    fn from(size: ByteSize) -> Self {
        Self(size)
    }
}

impl Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string_as(true))
    }
}

/// Error returned when parsing an invalid byte size.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid byte size '{0}': expected a whole number followed by a unit such as B, MB or GB")]
pub struct BytesParseError(String);

impl FromStr for Bytes {
    type Err = BytesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BytesParseError(s.to_string());

        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (number, unit) = trimmed.split_at(split);
        let number: u64 = number.parse().map_err(|_| invalid())?;
        if !unit.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }

        // `ByteSize` reads `GB` as 10^9; plugins mean GiB.
        let unit = unit.to_ascii_uppercase();
        let multiplier: ByteSize = match unit.as_bytes() {
            b"B" => ByteSize::b(1),
            [prefix, b'B'] => format!("1{}iB", *prefix as char)
                .parse()
                .map_err(|_| invalid())?,
            _ => format!("1{}", unit).parse().map_err(|_| invalid())?,
        };

        number
            .checked_mul(multiplier.as_u64())
            .map(Bytes::new)
            .ok_or_else(invalid)
    }
}
