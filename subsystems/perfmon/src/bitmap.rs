//! # Register and Processor Bitmaps
//!
//! Fixed-capacity bitsets used everywhere a set of register indices or
//! processor numbers travels through the subsystem. They are `Copy`, never
//! allocate, and are therefore safe to build and pass around on the
//! overflow interrupt path.

use core::fmt;

// =============================================================================
// BITMAP
// =============================================================================

/// Fixed-capacity bitset of `WORDS * 64` bits
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bitmap<const WORDS: usize> {
    words: [u64; WORDS],
}

/// Set of register indices (control or data registers)
pub type RegMask = Bitmap<4>;

/// Set of processor numbers
pub type CpuMask = Bitmap<4>;

impl<const WORDS: usize> Bitmap<WORDS> {
    /// Number of bits the bitmap can hold
    pub const CAPACITY: usize = WORDS * 64;

    /// Empty bitmap
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Bitmap with bits `0..n` set
    pub fn first_n(n: usize) -> Self {
        let mut map = Self::new();
        for bit in 0..n.min(Self::CAPACITY) {
            map.set(bit);
        }
        map
    }

    /// Bitmap from a list of bit indices
    pub fn from_bits(bits: &[usize]) -> Self {
        let mut map = Self::new();
        for &bit in bits {
            map.set(bit);
        }
        map
    }

    /// Set a bit. Out-of-range indices are ignored.
    #[inline]
    pub fn set(&mut self, bit: usize) {
        if bit < Self::CAPACITY {
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    /// Clear a bit
    #[inline]
    pub fn clear(&mut self, bit: usize) {
        if bit < Self::CAPACITY {
            self.words[bit / 64] &= !(1u64 << (bit % 64));
        }
    }

    /// Test a bit
    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        bit < Self::CAPACITY && self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Clear every bit
    #[inline]
    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    /// True if no bit is set
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of bits set
    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest set bit
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Union
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        out.union_with(other);
        out
    }

    /// In-place union
    #[inline]
    pub fn union_with(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
    }

    /// Intersection
    #[inline]
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = *self;
        for (a, b) in out.words.iter_mut().zip(other.words.iter()) {
            *a &= *b;
        }
        out
    }

    /// Bits of `self` not in `other`
    #[inline]
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = *self;
        for (a, b) in out.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
        out
    }

    /// True if every bit of `self` is also set in `other`
    #[inline]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.difference(other).is_empty()
    }

    /// Ascending iterator over set bits
    pub fn iter(&self) -> BitIter<'_, WORDS> {
        BitIter {
            map: self,
            word: 0,
            cur: self.words[0],
        }
    }
}

impl<const WORDS: usize> Default for Bitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> fmt::Debug for Bitmap<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Iterator over the set bits of a [`Bitmap`], lowest first
#[derive(Debug)]
pub struct BitIter<'a, const WORDS: usize> {
    map: &'a Bitmap<WORDS>,
    word: usize,
    cur: u64,
}

impl<const WORDS: usize> Iterator for BitIter<'_, WORDS> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.cur != 0 {
                let bit = self.cur.trailing_zeros() as usize;
                self.cur &= self.cur - 1;
                return Some(self.word * 64 + bit);
            }
            self.word += 1;
            if self.word >= WORDS {
                return None;
            }
            self.cur = self.map.words[self.word];
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_test_clear() {
        let mut m = RegMask::new();
        m.set(3);
        m.set(64);
        m.set(255);
        assert!(m.test(3) && m.test(64) && m.test(255));
        assert!(!m.test(4));
        assert_eq!(m.count(), 3);
        m.clear(64);
        assert!(!m.test(64));
        m.set(256);
        assert!(!m.test(256));
    }

    #[test]
    fn test_iter_ascending_across_words() {
        let m = RegMask::from_bits(&[130, 2, 64, 63]);
        let bits: std::vec::Vec<usize> = m.iter().collect();
        assert_eq!(bits, [2, 63, 64, 130]);
        assert_eq!(m.first(), Some(2));
    }

    #[test]
    fn test_set_algebra() {
        let a = RegMask::first_n(4);
        let b = RegMask::from_bits(&[2, 3, 9]);
        assert_eq!(a.intersect(&b), RegMask::from_bits(&[2, 3]));
        assert_eq!(a.difference(&b), RegMask::from_bits(&[0, 1]));
        assert_eq!(a.union(&b).count(), 5);
        assert!(RegMask::from_bits(&[1, 2]).is_subset(&a));
        assert!(!b.is_subset(&a));
        assert!(RegMask::new().is_empty());
    }
}
