//! Identity types for the Cadence RTI
//!
//! Federates are numbered densely from zero, so an id doubles as an arena index.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Federate identity, 16 bits on the wire
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FederateId(pub u16);

impl FederateId {
    #[inline]
    pub fn new(id: u16) -> Self {
        FederateId(id)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        FederateId(u16::from_le_bytes(bytes))
    }
}

impl From<usize> for FederateId {
    fn from(index: usize) -> Self {
        FederateId(index as u16)
    }
}

impl fmt::Debug for FederateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fed({})", self.0)
    }
}

impl fmt::Display for FederateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_federate_id_roundtrip() {
        let id = FederateId::new(0xBEEF);
        assert_eq!(FederateId::from_bytes(id.to_bytes()), id);
        assert_eq!(id.to_bytes(), [0xEF, 0xBE]);
    }

    #[test]
    fn test_federate_id_index() {
        assert_eq!(FederateId::from(7usize).index(), 7);
        assert_eq!(format!("{:?}", FederateId::new(3)), "Fed(3)");
    }
}
