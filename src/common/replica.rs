//! Replica placement codes
//!
//! A placement is written as three digits `xyz`:
//! - `x`: copies in other data centers
//! - `y`: copies in other racks of the same data center
//! - `z`: copies on other nodes of the same rack
//!
//! The total number of copies is `x + y + z + 1`.

use crate::common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Upper bound for a single digit of the code
const MAX_DIGIT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReplicaPlacement {
    pub diff_data_center: u8,
    pub diff_rack: u8,
    pub same_rack: u8,
}

impl ReplicaPlacement {
    pub fn new(diff_data_center: u8, diff_rack: u8, same_rack: u8) -> Result<Self> {
        for digit in [diff_data_center, diff_rack, same_rack] {
            if digit > MAX_DIGIT {
                return Err(Error::InvalidReplicaPlacement(format!(
                    "digit {} out of range",
                    digit
                )));
            }
        }
        Ok(Self {
            diff_data_center,
            diff_rack,
            same_rack,
        })
    }

    /// Total number of copies required
    pub fn copy_count(&self) -> usize {
        (self.diff_data_center + self.diff_rack + self.same_rack) as usize + 1
    }

    /// Whether any copy must leave the primary's data center
    pub fn spans_data_centers(&self) -> bool {
        self.diff_data_center > 0
    }
}

impl fmt::Display for ReplicaPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.diff_data_center, self.diff_rack, self.same_rack
        )
    }
}

impl FromStr for ReplicaPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // Shorter codes are left-padded, so "1" means "001"
        if s.is_empty() || s.len() > 3 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidReplicaPlacement(s.to_string()));
        }
        let padded = format!("{:0>3}", s);
        let digits: Vec<u8> = padded.bytes().map(|b| b - b'0').collect();
        Self::new(digits[0], digits[1], digits[2])
    }
}

impl Serialize for ReplicaPlacement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReplicaPlacement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_codes() {
        let rp: ReplicaPlacement = "010".parse().unwrap();
        assert_eq!(rp.diff_rack, 1);
        assert_eq!(rp.copy_count(), 2);

        let rp: ReplicaPlacement = "100".parse().unwrap();
        assert_eq!(rp.diff_data_center, 1);
        assert_eq!(rp.to_string(), "100");

        let rp: ReplicaPlacement = "1".parse().unwrap();
        assert_eq!(rp.to_string(), "001");
        assert_eq!(rp.copy_count(), 2);
    }

    #[test]
    fn test_invalid_codes() {
        assert!("".parse::<ReplicaPlacement>().is_err());
        assert!("0a0".parse::<ReplicaPlacement>().is_err());
        assert!("1000".parse::<ReplicaPlacement>().is_err());
    }

    #[test]
    fn test_default_is_single_copy() {
        let rp = ReplicaPlacement::default();
        assert_eq!(rp.to_string(), "000");
        assert_eq!(rp.copy_count(), 1);
        assert!(!rp.spans_data_centers());
    }

    #[test]
    fn test_serde_as_string() {
        let rp: ReplicaPlacement = "200".parse().unwrap();
        let json = serde_json::to_string(&rp).unwrap();
        assert_eq!(json, "\"200\"");
        let back: ReplicaPlacement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rp);
    }
}
