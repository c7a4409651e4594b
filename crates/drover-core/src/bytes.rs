// Byte quantities as they appear on the wire.
//
// Task submitters write sizes as human strings ("4Gb", "500 MiB"); everything
// internal works in bytes. Quantities are normalized at ingress and rendered
// back to a human string on serialization.

use std::fmt;
use std::str::FromStr;

use bytesize::ByteSize;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// A byte count parsed from a human-readable size string.
///
/// Accepts both SI ("MB") and IEC ("MiB") units. An empty string parses as
/// zero, matching the optional fields in the wire format where absence and
/// zero mean the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteQuantity(u64);

impl ByteQuantity {
    pub const ZERO: ByteQuantity = ByteQuantity(0);

    pub fn from_bytes(bytes: u64) -> Self {
        ByteQuantity(bytes)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Overflow on byte arithmetic indicates corrupted bookkeeping and is
    /// surfaced to the caller rather than wrapped.
    pub fn checked_add(self, other: ByteQuantity) -> Option<ByteQuantity> {
        self.0.checked_add(other.0).map(ByteQuantity)
    }

    pub fn saturating_sub(self, other: ByteQuantity) -> ByteQuantity {
        ByteQuantity(self.0.saturating_sub(other.0))
    }
}

impl FromStr for ByteQuantity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(ByteQuantity::ZERO);
        }
        // Bare digit strings are taken exactly; the unit parser goes
        // through f64 and cannot represent every byte count.
        if let Ok(bytes) = trimmed.parse::<u64>() {
            return Ok(ByteQuantity(bytes));
        }
        trimmed
            .parse::<ByteSize>()
            .map(|b| ByteQuantity(b.as_u64()))
            .map_err(|_| CoreError::BadByteQuantity {
                text: s.to_string(),
            })
    }
}

impl fmt::Display for ByteQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ByteSize(self.0))
    }
}

impl From<u64> for ByteQuantity {
    fn from(bytes: u64) -> Self {
        ByteQuantity(bytes)
    }
}

impl ByteQuantity {
    /// Wire form: the human string when it is exact, the raw byte count
    /// otherwise. Rounding "6442450944" to "6.4 GB" would corrupt the
    /// quantity on the next parse.
    fn to_wire(self) -> String {
        let human = ByteSize(self.0).to_string();
        match human.parse::<ByteSize>() {
            Ok(parsed) if parsed.as_u64() == self.0 => human,
            _ => self.0.to_string(),
        }
    }
}

impl Serialize for ByteQuantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for ByteQuantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The wire carries sizes as strings, but tolerate raw integers from
        // hand-written payloads.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Count(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Count(n) => Ok(ByteQuantity(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_si_and_iec_units() {
        assert_eq!(
            "500Mb".parse::<ByteQuantity>().unwrap().as_u64(),
            500_000_000
        );
        assert_eq!(
            "4GiB".parse::<ByteQuantity>().unwrap().as_u64(),
            4 * 1024 * 1024 * 1024
        );
        assert_eq!("1 kB".parse::<ByteQuantity>().unwrap().as_u64(), 1_000);
    }

    #[test]
    fn empty_string_is_zero() {
        assert_eq!("".parse::<ByteQuantity>().unwrap(), ByteQuantity::ZERO);
        assert_eq!("  ".parse::<ByteQuantity>().unwrap(), ByteQuantity::ZERO);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("four gigabytes".parse::<ByteQuantity>().is_err());
    }

    #[test]
    fn json_round_trip() {
        let q: ByteQuantity = serde_json::from_str("\"2Gb\"").unwrap();
        assert_eq!(q.as_u64(), 2_000_000_000);
        let back: ByteQuantity = serde_json::from_str(&serde_json::to_string(&q).unwrap()).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn accepts_raw_integers() {
        let q: ByteQuantity = serde_json::from_str("1048576").unwrap();
        assert_eq!(q.as_u64(), 1_048_576);
    }

    #[test]
    fn awkward_quantities_round_trip_exactly() {
        for bytes in [1_234u64, 6_442_450_944, u64::MAX] {
            let q = ByteQuantity::from_bytes(bytes);
            let back: ByteQuantity =
                serde_json::from_str(&serde_json::to_string(&q).unwrap()).unwrap();
            assert_eq!(back, q, "{bytes} bytes did not survive the wire");
        }
    }

    #[test]
    fn checked_add_flags_overflow() {
        let big = ByteQuantity::from_bytes(u64::MAX);
        assert!(big.checked_add(ByteQuantity::from_bytes(1)).is_none());
    }
}
