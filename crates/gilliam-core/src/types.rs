//! Identifier aliases and the capacity vector.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a registered node (`node-000001`).
pub type NodeId = String;

/// Unique identifier for a submitted work unit (`wu-000001`).
pub type WorkUnitId = String;

/// Unique identifier for a lease (`lease-000001`).
pub type LeaseId = String;

/// A point on the scheduler clock. Logical in tests, seconds in the daemon.
pub type Tick = u64;

/// Format a generated identifier (`node-000042`).
pub fn format_id(prefix: &str, seq: u64) -> String {
    format!("{prefix}-{seq:06}")
}

/// Order generated identifiers by creation.
///
/// Padding stops at six digits, so a longer id always has the larger
/// sequence number: compare by length first, then by text.
pub fn cmp_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Parse the sequence number back out of a generated identifier.
pub fn parse_id_seq(prefix: &str, id: &str) -> Option<u64> {
    id.strip_prefix(prefix)?.strip_prefix('-')?.parse().ok()
}

/// Capacity vector: CPU and memory in abstract scheduler units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub memory: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources { cpu: 0, memory: 0 };

    pub const fn new(cpu: u64, memory: u64) -> Self {
        Self { cpu, memory }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0
    }

    /// True when every dimension of `self` is at most the same dimension of `other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu && self.memory <= other.memory
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_add(other.cpu)?,
            memory: self.memory.checked_add(other.memory)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
        }
    }

    /// Iterate `(used, capacity)` pairs per dimension.
    pub fn dimensions(&self, capacity: &Resources) -> [(u64, u64); 2] {
        [(self.cpu, capacity.cpu), (self.memory, capacity.memory)]
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} memory={}", self.cpu, self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let a = format_id("node", 9);
        let b = format_id("node", 10);
        assert_eq!(a, "node-000009");
        assert_eq!(cmp_ids(&a, &b), Ordering::Less);
    }

    #[test]
    fn ids_past_the_padding_still_sort_by_creation() {
        let last_padded = format_id("node", 999_999);
        let first_wide = format_id("node", 1_000_000);
        assert_eq!(first_wide, "node-1000000");
        // Plain string order gets this wrong.
        assert!(first_wide < last_padded);
        assert_eq!(cmp_ids(&last_padded, &first_wide), Ordering::Less);
        assert_eq!(cmp_ids(&first_wide, &first_wide), Ordering::Equal);
    }

    #[test]
    fn parses_sequence_back() {
        assert_eq!(parse_id_seq("wu", "wu-000042"), Some(42));
        assert_eq!(parse_id_seq("wu", "lease-000042"), None);
        assert_eq!(parse_id_seq("wu", "wu-abc"), None);
    }

    #[test]
    fn fits_within_checks_every_dimension() {
        let cap = Resources::new(4, 1024);
        assert!(Resources::new(4, 1024).fits_within(&cap));
        assert!(!Resources::new(5, 0).fits_within(&cap));
        assert!(!Resources::new(0, 2048).fits_within(&cap));
    }

    #[test]
    fn arithmetic_saturates() {
        let a = Resources::new(1, 1);
        let b = Resources::new(3, 0);
        assert_eq!(a.saturating_sub(&b), Resources::new(0, 1));
        assert_eq!(
            Resources::new(u64::MAX, 0).checked_add(&Resources::new(1, 0)),
            None
        );
    }

    #[test]
    fn missing_dimensions_deserialize_as_zero() {
        let r: Resources = toml::from_str("cpu = 3").unwrap();
        assert_eq!(r, Resources::new(3, 0));
    }
}
