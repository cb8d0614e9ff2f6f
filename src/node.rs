//! 160-bit node identifiers and the XOR distance metric.

use crate::error::BencodeError;
use rand::RngCore;
use std::fmt;

/// Number of bytes in a DHT node id / info_hash (SHA-1 width).
pub const ID_LEN: usize = 20;

/// A 160-bit Kademlia node identifier, also reused for info_hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> NodeId {
        NodeId(bytes)
    }

    /// Parses a node id out of an arbitrary byte slice, failing if it isn't
    /// exactly [`ID_LEN`] bytes long.
    pub fn from_slice(field: &'static str, slice: &[u8]) -> Result<NodeId, BencodeError> {
        if slice.len() != ID_LEN {
            return Err(BencodeError::TypeMismatch {
                field,
                expected: "20-byte string",
            });
        }
        let mut buf = [0u8; ID_LEN];
        buf.copy_from_slice(slice);
        Ok(NodeId(buf))
    }

    /// Generates a random id from a cryptographically strong source.
    pub fn random() -> NodeId {
        let mut buf = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut buf);
        NodeId(buf)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }

    /// `self XOR other`, as a 160-bit big-endian unsigned integer.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// An XOR distance between two [`NodeId`]s. Ordered numerically (big-endian
/// byte comparison is equivalent to numeric comparison here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    /// Index (0..=159, most significant first) of the leading 1 bit, or
    /// `None` if the distance is zero (i.e. the two ids are identical).
    pub fn leading_bit(&self) -> Option<usize> {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = byte.leading_zeros() as usize;
                return Some(byte_idx * 8 + bit_in_byte);
            }
        }
        None
    }
}
