//! # Bitset
//!
//! A fixed-capacity bit array over borrowed `u32` words: bit `i` lives in
//! word `i / 32` at position `i % 32`. Frame bitmaps are carved out of
//! early-mapped memory, so the storage is a plain slice rather than an
//! owned buffer.

/// Bits per storage word.
pub const WORD_BITS: usize = u32::BITS as usize;

/// Number of words needed for `bits` bits.
#[inline]
#[must_use]
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

pub struct Bitset<'a> {
    words: &'a mut [u32],
    len: usize,
}

impl<'a> Bitset<'a> {
    /// Wraps `words` as a bitset of `len` bits, all clear.
    ///
    /// # Panics
    /// If `words` is too short for `len` bits.
    pub fn new(words: &'a mut [u32], len: usize) -> Self {
        assert!(words.len() >= words_for(len), "bitset storage too small");
        words.fill(0);
        Self { words, len }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether bit `index` is set. Out of range reads as set.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return true;
        }
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set bit `index`. Out of range is ignored.
    #[inline]
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    /// Clear bit `index`. Out of range is ignored.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    /// Index of the lowest clear bit.
    ///
    /// Full words are skipped whole; inside a word the answer is the count
    /// of trailing ones.
    #[must_use]
    pub fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|&(_, &w)| w != u32::MAX)
            .map(|(i, w)| i * WORD_BITS + w.trailing_ones() as usize)
            .filter(|&index| index < self.len)
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i)).count()
    }

    #[must_use]
    pub fn count_clear(&self) -> usize {
        self.len - self.count_set()
    }
}
