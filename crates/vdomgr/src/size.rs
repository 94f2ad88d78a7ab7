//! LVM-style size values.
//!
//! Conversions to and from suffixed size strings as used by LVM commands
//! like lvcreate(8): a (possibly fractional) number followed by an optional
//! unit suffix. `B` is bytes, `S` is 512-byte sectors, and `KMGTPE` are
//! kilobytes through exabytes. Suffixes are not case sensitive and denote
//! powers of 1024; the default unit is megabytes. Negative sizes are
//! rejected.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use crate::{Result, VdoError};

pub const SECTOR_SIZE: u64 = 512;
pub const VDO_BLOCK_SIZE: u64 = 4096;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;
pub const TB: u64 = 1 << 40;
pub const PB: u64 = 1 << 50;
pub const EB: u64 = 1 << 60;

/// The SI suffixes, largest first, used for canonical formatting.
const SI_SUFFIXES: [(char, u64); 6] =
    [('E', EB), ('P', PB), ('T', TB), ('G', GB), ('M', MB), ('K', KB)];

/// The size of an object such as a disk partition, kept as a byte count.
///
/// Equality and ordering are on the byte count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeString {
    bytes: u64,
}

impl SizeString {
    pub const ZERO: SizeString = SizeString { bytes: 0 };

    pub const fn from_bytes(bytes: u64) -> Self {
        SizeString { bytes }
    }

    pub const fn from_sectors(sectors: u64) -> Self {
        SizeString { bytes: sectors * SECTOR_SIZE }
    }

    pub const fn from_blocks(blocks: u64) -> Self {
        SizeString { bytes: blocks * VDO_BLOCK_SIZE }
    }

    /// The count of bytes represented by this object.
    pub fn to_bytes(self) -> u64 {
        self.bytes
    }

    /// This object as a count of 512-byte sectors, rounding up.
    pub fn to_sectors(self) -> u64 {
        self.bytes.div_ceil(SECTOR_SIZE)
    }

    /// This object as a count of 4 KiB blocks, rounding down.
    pub fn to_blocks(self) -> u64 {
        self.bytes / VDO_BLOCK_SIZE
    }

    /// Rounds down to a multiple of the 4 KiB block size.
    pub fn round_to_block(self) -> Self {
        SizeString::from_blocks(self.to_blocks())
    }

    pub fn is_zero(self) -> bool {
        self.bytes == 0
    }

    /// Canonical suffixed form without a decimal point, preferring the
    /// largest suffix that keeps the value integral and falling back to
    /// bytes. Zero formats as `0M` (the default unit).
    pub fn as_lvm_text(self) -> String {
        let mut size = self.bytes;
        let mut suffix = 'M';
        if size > 0 {
            suffix = 'B';
            for (letter, divisor) in SI_SUFFIXES {
                if size % divisor == 0 {
                    size /= divisor;
                    suffix = letter;
                    break;
                }
            }
        }
        format!("{size}{suffix}")
    }
}

impl FromStr for SizeString {
    type Err = VdoError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(SizeString::ZERO);
        }

        let invalid = || VdoError::InvalidSize(s.to_string());

        let (number, multiplier) = match trimmed.chars().last() {
            Some(last) if last.is_ascii_alphabetic() => {
                let multiplier = match last.to_ascii_uppercase() {
                    'B' => 1,
                    'S' => SECTOR_SIZE,
                    'K' => KB,
                    'M' => MB,
                    'G' => GB,
                    'T' => TB,
                    'P' => PB,
                    'E' => EB,
                    _ => return Err(invalid()),
                };
                (&trimmed[..trimmed.len() - 1], multiplier)
            }
            _ => (trimmed, MB),
        };

        // Integral values take the exact path; fractional values go through
        // f64 and truncate, as the LVM tools do.
        if let Ok(count) = number.parse::<u64>() {
            let bytes = count.checked_mul(multiplier).ok_or_else(invalid)?;
            return Ok(SizeString { bytes });
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        Ok(SizeString { bytes: (value * multiplier as f64) as u64 })
    }
}

impl fmt::Display for SizeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_lvm_text())
    }
}

impl Add for SizeString {
    type Output = SizeString;

    fn add(self, rhs: SizeString) -> SizeString {
        SizeString { bytes: self.bytes + rhs.bytes }
    }
}

impl AddAssign for SizeString {
    fn add_assign(&mut self, rhs: SizeString) {
        self.bytes += rhs.bytes;
    }
}

impl serde::Serialize for SizeString {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_lvm_text())
    }
}

impl<'de> serde::Deserialize<'de> for SizeString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = SizeString;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an LVM-style size string")
            }

            fn visit_str<E: serde::de::Error>(
                self,
                v: &str,
            ) -> std::result::Result<SizeString, E> {
                v.parse().map_err(|e| E::custom(format!("{e}")))
            }

            fn visit_u64<E: serde::de::Error>(
                self,
                v: u64,
            ) -> std::result::Result<SizeString, E> {
                self.visit_str(&v.to_string())
            }

            fn visit_i64<E: serde::de::Error>(
                self,
                v: i64,
            ) -> std::result::Result<SizeString, E> {
                self.visit_str(&v.to_string())
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> SizeString {
        s.parse().unwrap()
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse("1B").to_bytes(), 1);
        assert_eq!(parse("1S").to_bytes(), 512);
        assert_eq!(parse("1K").to_bytes(), 1024);
        assert_eq!(parse("1m").to_bytes(), MB);
        assert_eq!(parse("2G").to_bytes(), 2 * GB);
        assert_eq!(parse("2T").to_bytes(), 2 * TB);
        assert_eq!(parse("1p").to_bytes(), PB);
        assert_eq!(parse("1E").to_bytes(), EB);
    }

    #[test]
    fn default_unit_is_megabytes() {
        assert_eq!(parse("128").to_bytes(), 128 * MB);
    }

    #[test]
    fn empty_is_zero() {
        assert_eq!(parse("").to_bytes(), 0);
    }

    #[test]
    fn fractional_values_truncate() {
        assert_eq!(parse("1.5K").to_bytes(), 1536);
        assert_eq!(parse("0.25G").to_bytes(), 256 * MB);
    }

    #[test]
    fn rejects_negative_and_garbage() {
        assert!("-1G".parse::<SizeString>().is_err());
        assert!("-0.5".parse::<SizeString>().is_err());
        assert!("12Q".parse::<SizeString>().is_err());
        assert!("foo".parse::<SizeString>().is_err());
    }

    #[test]
    fn sector_rounding_is_up_block_rounding_is_down() {
        let sz = SizeString::from_bytes(513);
        assert_eq!(sz.to_sectors(), 2);
        assert_eq!(sz.to_blocks(), 0);
        let sz = SizeString::from_bytes(4097);
        assert_eq!(sz.to_blocks(), 1);
        assert_eq!(sz.round_to_block().to_bytes(), 4096);
    }

    #[test]
    fn canonical_formatting_prefers_largest_suffix() {
        assert_eq!(parse("2T").as_lvm_text(), "2T");
        assert_eq!(parse("1024M").as_lvm_text(), "1G");
        assert_eq!(SizeString::from_bytes(4096).as_lvm_text(), "4K");
        assert_eq!(SizeString::from_bytes(1000).as_lvm_text(), "1000B");
        assert_eq!(SizeString::ZERO.as_lvm_text(), "0M");
    }

    #[test]
    fn round_trips() {
        for s in ["2T", "128M", "4K", "1000B", "32G"] {
            let sz = parse(s);
            assert_eq!(sz.as_lvm_text(), s);
            assert_eq!(parse(&sz.as_lvm_text()), sz);
        }
    }

    #[test]
    fn ordering_and_addition() {
        assert!(parse("1G") < parse("2G"));
        assert_eq!(parse("1G") + parse("1G"), parse("2G"));
        let mut sz = parse("1G");
        sz += parse("512M");
        assert_eq!(sz, parse("1536M"));
    }
}
