//! Node identity and distance metric.
//!
//! 160-bit identifiers with the XOR distance metric. Closeness in the
//! keyspace is the magnitude of `a XOR b` taken as an unsigned 160-bit
//! integer; the common-prefix length of two ids selects the k-bucket a
//! peer lands in.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 160-bit node identifier.
///
/// Identifiers are compared and bucketed through the XOR metric, which is
/// symmetric and satisfies the triangle inequality, the two properties the
/// routing table relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 20]);

/// XOR distance between two identifiers, ordered by magnitude.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Distance([u8; 20]);

impl NodeId {
    /// Number of bits in a NodeId.
    pub const BITS: usize = 160;

    /// Number of bytes in a NodeId.
    pub const LEN: usize = 20;

    /// Generate a random NodeId.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel_dht::NodeId;
    ///
    /// let id = NodeId::random();
    /// assert_eq!(id.as_bytes().len(), 20);
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; Self::LEN];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Generate a random NodeId whose common-prefix length with `local`
    /// is exactly `index` bits.
    ///
    /// Used by bucket refresh: a lookup toward such an id routes through
    /// bucket `index` of `local`'s table.
    ///
    /// # Panics
    ///
    /// Panics if `index >= 160` (debug assertion).
    #[must_use]
    pub fn random_within_bucket(local: &NodeId, index: usize) -> Self {
        debug_assert!(index < Self::BITS);

        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; Self::LEN];
        rng.fill(&mut bytes[..]);

        // Copy the shared prefix from the local id, whole bytes first.
        let byte = index / 8;
        let bit = index % 8;
        bytes[..byte].copy_from_slice(&local.0[..byte]);

        // In the boundary byte: keep local's bits above the index bit,
        // force the index bit to differ, leave lower bits random.
        let high_mask: u8 = !(0xFF >> bit);
        let diff_bit: u8 = 0x80 >> bit;
        bytes[byte] = (local.0[byte] & high_mask) | ((local.0[byte] ^ diff_bit) & diff_bit)
            | (bytes[byte] & !(high_mask | diff_bit));

        Self(bytes)
    }

    /// XOR distance to another id.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel_dht::NodeId;
    ///
    /// let a = NodeId::from_bytes([1u8; 20]);
    /// let b = NodeId::from_bytes([2u8; 20]);
    /// assert_eq!(a.distance(&b).as_bytes()[0], 3); // 1 XOR 2 = 3
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; Self::LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Count of leading bits on which `self` and `other` agree (0..=160).
    ///
    /// Equal ids agree on all 160 bits.
    #[must_use]
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Bucket index of `self` relative to `local`: the common-prefix
    /// length, in `0..160`.
    ///
    /// Returns `None` when the ids are identical; the local id never has
    /// a bucket and callers must exclude that case.
    ///
    /// # Examples
    ///
    /// ```
    /// use kestrel_dht::NodeId;
    ///
    /// let local = NodeId::from_bytes([0u8; 20]);
    /// let mut bytes = [0u8; 20];
    /// bytes[0] = 0b1000_0000; // first bit differs
    /// let remote = NodeId::from_bytes(bytes);
    /// assert_eq!(remote.bucket_index(&local), Some(0));
    /// assert_eq!(local.bucket_index(&local), None);
    /// ```
    #[must_use]
    pub fn bucket_index(&self, local: &NodeId) -> Option<usize> {
        let prefix = self.common_prefix_len(local);
        if prefix == Self::BITS { None } else { Some(prefix) }
    }

    /// Raw bytes of the id.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Create a NodeId from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl Distance {
    /// Count of leading zero bits (0..=160). A zero distance has 160.
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count.min(NodeId::BITS)
    }

    /// Whether the distance is zero (identical ids).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Raw big-endian bytes of the distance.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        // Big-endian byte order is magnitude order.
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0))
    }
}

/// Helper module for hex encoding (simplified).
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
