use crate::types::InternalIndex;

const WORD_BITS: usize = 64;

// IndexBitset
/// One bit per InternalIndex. Grows on demand when setting bits; reading
/// past the current capacity yields false.
#[derive(Clone, Debug, Default)]
pub struct IndexBitset {
    words: Vec<u64>,
}

impl IndexBitset {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn with_bit_capacity(bits: u32) -> Self {
        let word_count = (bits as usize).div_ceil(WORD_BITS);
        Self {
            words: vec![0; word_count],
        }
    }

    pub fn bit_capacity(&self) -> u32 {
        (self.words.len() * WORD_BITS) as u32
    }

    pub fn ensure_bit_capacity(&mut self, bits: u32) {
        let word_count = (bits as usize).div_ceil(WORD_BITS);
        if word_count > self.words.len() {
            self.words.resize(word_count, 0);
        }
    }

    pub fn set_bit(&mut self, index: InternalIndex) {
        // widen before adding one; index == u32::MAX must not overflow
        let word = index as usize / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index as usize % WORD_BITS);
    }

    pub fn clear_bit(&mut self, index: InternalIndex) {
        let word = index as usize / WORD_BITS;
        if word < self.words.len() {
            self.words[word] &= !(1u64 << (index as usize % WORD_BITS));
        }
    }

    pub fn get_bit(&self, index: InternalIndex) -> bool {
        let word = index as usize / WORD_BITS;
        if word >= self.words.len() {
            return false;
        }
        self.words[word] & (1u64 << (index as usize % WORD_BITS)) != 0
    }

    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn count_set_bits(&self) -> u32 {
        self.words.iter().map(|word| word.count_ones()).sum()
    }

    pub fn clear_all(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
    }

    pub fn copy_from(&mut self, other: &IndexBitset) {
        self.words.clear();
        self.words.extend_from_slice(&other.words);
    }

    /// self |= other
    pub fn or(&mut self, other: &IndexBitset) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
    }

    /// self &= other
    pub fn and(&mut self, other: &IndexBitset) {
        for (i, dst) in self.words.iter_mut().enumerate() {
            *dst &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    /// self &= !other
    pub fn and_not(&mut self, other: &IndexBitset) {
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst &= !*src;
        }
    }

    pub fn for_each_set_bit(&self, mut func: impl FnMut(InternalIndex)) {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                func((word_index * WORD_BITS + bit) as InternalIndex);
                bits &= bits - 1;
            }
        }
    }

    /// Visits every index set in `self & other`.
    pub fn for_each_set_bit_and(&self, other: &IndexBitset, mut func: impl FnMut(InternalIndex)) {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = *word & other.words.get(word_index).copied().unwrap_or(0);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                func((word_index * WORD_BITS + bit) as InternalIndex);
                bits &= bits - 1;
            }
        }
    }

    /// Visits every index set in `self & !other`.
    pub fn for_each_set_bit_and_not(
        &self,
        other: &IndexBitset,
        mut func: impl FnMut(InternalIndex),
    ) {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = *word & !other.words.get(word_index).copied().unwrap_or(0);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                func((word_index * WORD_BITS + bit) as InternalIndex);
                bits &= bits - 1;
            }
        }
    }

    pub fn intersects(&self, other: &IndexBitset) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Drops any bit at or above `ceiling`, so that indices assigned after a
    /// snapshot was taken cannot leak into it.
    pub fn truncate_bits(&mut self, ceiling: u32) {
        let full_words = ceiling as usize / WORD_BITS;
        let rem = ceiling as usize % WORD_BITS;
        for (i, word) in self.words.iter_mut().enumerate() {
            if i > full_words || (i == full_words && rem == 0) {
                *word = 0;
            } else if i == full_words {
                *word &= (1u64 << rem) - 1;
            }
        }
    }
}
