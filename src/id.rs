use rand;
use sha3::{Digest, Sha3_256};
use std::fmt::{Debug, Formatter, Result};
use std::ops::{BitAnd, BitOr, BitXor, Shr};

use crate::ID_LENGTH;

/// A 160-bit identifier for nodes and network/content keys.
///
/// Closeness between two IDs is defined as the XOR of the IDs interpreted as
/// an unsigned big-endian integer, which is what the derived lexicographic
/// ordering computes.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Default, Copy)]
pub struct NodeId(pub [u8; ID_LENGTH]);

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl NodeId {
    /// Constructs a new `NodeId` from a byte array.
    pub fn new(data: [u8; ID_LENGTH]) -> Self {
        NodeId(data)
    }

    /// Constructs a new, random `NodeId`.
    pub fn rand() -> Self {
        let mut ret = NodeId([0; ID_LENGTH]);
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        ret
    }

    /// Derives a `NodeId` from an application-level network key by truncating
    /// its SHA3-256 digest.
    pub fn from_network_key(key: &str) -> Self {
        let digest = Sha3_256::digest(key.as_bytes());
        let mut ret = [0; ID_LENGTH];
        ret.copy_from_slice(&digest[..ID_LENGTH]);
        NodeId(ret)
    }

    /// Constructs a random `NodeId` that agrees with `prefix` on the first
    /// `depth` bits. Used to refresh a bucket by looking up an ID inside its
    /// slice of the address space.
    pub(crate) fn rand_with_prefix(prefix: NodeId, depth: usize) -> Self {
        let suffix_mask = NodeId::max_value() >> depth;
        let random = NodeId::rand();
        // selects `random` where the mask is set and `prefix` elsewhere
        let suffix = prefix.xor(&random) & suffix_mask;
        prefix ^ suffix
    }

    /// Returns the ID with all bits set.
    pub fn max_value() -> Self {
        NodeId([0xFF; ID_LENGTH])
    }

    /// Returns the XOR distance between `self` and `id`.
    pub fn xor(&self, id: &NodeId) -> NodeId {
        let mut ret = [0; ID_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ id.0[i];
        }
        NodeId(ret)
    }

    /// Returns bit `index` counting from the most significant bit.
    pub(crate) fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_LENGTH * 8);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns the ID with only bit `index` set, counting from the most
    /// significant bit.
    pub(crate) fn bit_mask(index: usize) -> Self {
        debug_assert!(index < ID_LENGTH * 8);
        let mut ret = [0; ID_LENGTH];
        ret[index / 8] = 0x80 >> (index % 8);
        NodeId(ret)
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: NodeId) -> NodeId {
        self.xor(&rhs)
    }
}

impl BitAnd for NodeId {
    type Output = NodeId;

    fn bitand(self, rhs: NodeId) -> NodeId {
        let mut ret = [0; ID_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] & rhs.0[i];
        }
        NodeId(ret)
    }
}

impl BitOr for NodeId {
    type Output = NodeId;

    fn bitor(self, rhs: NodeId) -> NodeId {
        let mut ret = [0; ID_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] | rhs.0[i];
        }
        NodeId(ret)
    }
}

impl Shr<usize> for NodeId {
    type Output = NodeId;

    /// Shifts the ID right by `shift` bits, filling with zeros.
    fn shr(self, shift: usize) -> NodeId {
        let mut ret = [0; ID_LENGTH];
        let byte_shift = shift / 8;
        let bit_shift = shift % 8;
        for i in byte_shift..ID_LENGTH {
            let mut byte = self.0[i - byte_shift] >> bit_shift;
            if bit_shift > 0 && i > byte_shift {
                byte |= self.0[i - byte_shift - 1] << (8 - bit_shift);
            }
            ret[i] = byte;
        }
        NodeId(ret)
    }
}
