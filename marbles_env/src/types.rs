//! Common types for the marbles environment.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A point on a virtual clock, measured in frames since the clock was created.
pub type VirtualTime = u64;

/// Unique identifier for a group (one node of the pipeline graph).
///
/// Names are user-facing and may repeat; the id never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Uuid);

impl GroupId {
    /// Creates a new random GroupId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
    
    /// Creates a deterministic GroupId from a seed (for reproducible harness runs).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
    
    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell groups apart in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_group_id_from_seed_is_stable() {
        assert_eq!(GroupId::from_seed(7), GroupId::from_seed(7));
        assert_ne!(GroupId::from_seed(7), GroupId::from_seed(8));
    }
    
    #[test]
    fn test_group_id_display_is_short() {
        let id = GroupId::from_seed(1);
        assert_eq!(id.to_string().len(), 8);
    }
}
