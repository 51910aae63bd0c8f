use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-width bitmap indexed by node (or core) position.
///
/// All binary operations require equally sized operands; the cluster node
/// count is fixed for the lifetime of a table and rebuilt on reconfig.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBitmap {
    bits: BitVec,
}

impl NodeBitmap {
    pub fn new(size: usize) -> NodeBitmap {
        NodeBitmap { bits: bitvec![0; size] }
    }

    pub fn full(size: usize) -> NodeBitmap {
        NodeBitmap { bits: bitvec![1; size] }
    }

    pub fn from_indices(size: usize, indices: &[usize]) -> NodeBitmap {
        let mut map = NodeBitmap::new(size);
        for &i in indices {
            map.set(i);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    pub fn clear(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn or_assign(&mut self, other: &NodeBitmap) {
        debug_assert_eq!(self.len(), other.len());
        for i in other.bits.iter_ones() {
            self.bits.set(i, true);
        }
    }

    pub fn and_assign(&mut self, other: &NodeBitmap) {
        debug_assert_eq!(self.len(), other.len());
        let to_clear: Vec<usize> = self.bits.iter_ones().filter(|&i| !other.test(i)).collect();
        for i in to_clear {
            self.bits.set(i, false);
        }
    }

    /// Clears every bit of `self` that is set in `other`.
    pub fn and_not_assign(&mut self, other: &NodeBitmap) {
        debug_assert_eq!(self.len(), other.len());
        for i in other.bits.iter_ones() {
            self.bits.set(i, false);
        }
    }

    pub fn overlap_any(&self, other: &NodeBitmap) -> bool {
        self.bits.iter_ones().any(|i| other.test(i))
    }

    pub fn overlap_count(&self, other: &NodeBitmap) -> usize {
        self.bits.iter_ones().filter(|&i| other.test(i)).count()
    }

    /// True if every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &NodeBitmap) -> bool {
        self.bits.iter_ones().all(|i| other.test(i))
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }

    pub fn set_range(&mut self, start: usize, end_inclusive: usize) {
        for i in start..=end_inclusive {
            self.bits.set(i, true);
        }
    }
}

impl fmt::Debug for NodeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ones: Vec<usize> = self.bits.iter_ones().collect();
        write!(f, "NodeBitmap({}/{} set: {:?})", ones.len(), self.bits.len(), ones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_and_subset() {
        let a = NodeBitmap::from_indices(8, &[0, 1, 2]);
        let b = NodeBitmap::from_indices(8, &[2, 3]);
        let c = NodeBitmap::from_indices(8, &[1, 2]);

        assert!(a.overlap_any(&b));
        assert_eq!(a.overlap_count(&b), 1);
        assert!(c.is_subset_of(&a));
        assert!(!b.is_subset_of(&a));
    }

    #[test]
    fn test_and_not_removes_masked_bits() {
        let mut avail = NodeBitmap::full(4);
        let reserved = NodeBitmap::from_indices(4, &[1, 3]);
        avail.and_not_assign(&reserved);

        assert!(avail.test(0));
        assert!(!avail.test(1));
        assert!(avail.test(2));
        assert!(!avail.test(3));
    }
}
