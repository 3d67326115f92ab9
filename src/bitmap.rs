//! Region occupancy for a run.
//!
//! A set bit means the region is allocated. Allocation always takes the
//! lowest clear bit so active memory stays packed at the start of a run.

/// Fixed-capacity occupancy bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
  words: Box<[u64]>,
  bits: usize,
  set: usize,
  /// No clear bit exists below this word.
  hint: usize,
}

impl Bitmap {
  pub fn new(bits: usize) -> Self {
    assert!(bits > 0, "bitmap needs at least one bit");
    let nwords = bits.div_ceil(64);
    let mut words = vec![0u64; nwords].into_boxed_slice();
    // Bits past the end stay permanently set so the scan never returns them.
    let tail = bits % 64;
    if tail != 0 {
      words[nwords - 1] = !0u64 << tail;
    }
    Self {
      words,
      bits,
      set: 0,
      hint: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.bits
  }

  /// Regions currently allocated.
  pub fn count(&self) -> usize {
    self.set
  }

  pub fn is_full(&self) -> bool {
    self.set == self.bits
  }

  pub fn is_empty(&self) -> bool {
    self.set == 0
  }

  pub fn is_set(&self, bit: usize) -> bool {
    bit < self.bits && self.words[bit / 64] & (1 << (bit % 64)) != 0
  }

  /// Claims the lowest free region. `None` when the run is full.
  #[inline]
  pub fn acquire(&mut self) -> Option<usize> {
    if self.is_full() {
      return None;
    }
    for idx in self.hint..self.words.len() {
      let word = self.words[idx];
      if word != !0 {
        let bit = (!word).trailing_zeros() as usize;
        self.words[idx] = word | (1 << bit);
        self.set += 1;
        self.hint = idx;
        return Some(idx * 64 + bit);
      }
    }
    None
  }

  /// Frees `bit`. Returns `false`, leaving the bitmap untouched, if the bit
  /// was already clear or out of range: the caller is releasing twice.
  #[inline]
  #[must_use]
  pub fn release(&mut self, bit: usize) -> bool {
    if !self.is_set(bit) {
      return false;
    }
    let idx = bit / 64;
    self.words[idx] &= !(1 << (bit % 64));
    self.set -= 1;
    self.hint = self.hint.min(idx);
    true
  }

  /// Population count straight from the words, for consistency checks.
  pub fn popcount(&self) -> usize {
    let padding = self.words.len() * 64 - self.bits;
    self.words.iter().map(|w| w.count_ones() as usize).sum::<usize>() - padding
  }
}
