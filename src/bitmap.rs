/// Fixed-size allocation bitmap. A set bit marks a segment that is not
/// free. Callers serialize access through their own lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    num_bits: u32,
    num_set: u32,
    // where the next search for a clear bit starts
    cursor: u32,
}

impl Bitmap {
    pub fn new(num_bits: u32) -> Bitmap {
        let words = (num_bits as usize).div_ceil(64);
        Bitmap { words: vec![0; words], num_bits, num_set: 0, cursor: 0 }
    }

    pub const fn num_bits(&self) -> u32 {
        self.num_bits
    }

    pub const fn num_set(&self) -> u32 {
        self.num_set
    }

    pub const fn num_clear(&self) -> u32 {
        self.num_bits - self.num_set
    }

    pub fn is_set(&self, bit: u32) -> bool {
        assert!(bit < self.num_bits, "bit {} out of range {}", bit, self.num_bits);
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Returns `true` if the bit was previously clear.
    pub fn set(&mut self, bit: u32) -> bool {
        if self.is_set(bit) {
            return false;
        }
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        self.num_set += 1;
        true
    }

    /// Returns `true` if the bit was previously set.
    pub fn clear(&mut self, bit: u32) -> bool {
        if !self.is_set(bit) {
            return false;
        }
        self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
        self.num_set -= 1;
        true
    }

    /// Sets the first clear bit at or after the cursor, wrapping around,
    /// that `accept` agrees to take.
    pub fn set_next_clear_bit<F>(&mut self, mut accept: F) -> Option<u32>
    where
        F: FnMut(u32) -> bool,
    {
        if self.num_clear() == 0 {
            return None;
        }
        for step in 0..self.num_bits {
            let bit = (self.cursor + step) % self.num_bits;
            if !self.is_set(bit) && accept(bit) {
                self.set(bit);
                self.cursor = (bit + 1) % self.num_bits;
                return Some(bit);
            }
        }
        None
    }

    pub fn set_bits(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_bits).filter(move |bit| self.is_set(*bit))
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.num_set = 0;
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let mut bitmap = Bitmap::new(70);
        assert!(bitmap.set(65));
        assert!(!bitmap.set(65));
        assert!(bitmap.is_set(65));
        assert_eq!(bitmap.num_set(), 1);
        assert!(bitmap.clear(65));
        assert!(!bitmap.clear(65));
        assert_eq!(bitmap.num_clear(), 70);
    }

    #[test]
    fn next_clear_bit_wraps_and_skips() {
        let mut bitmap = Bitmap::new(4);
        assert_eq!(bitmap.set_next_clear_bit(|_| true), Some(0));
        assert_eq!(bitmap.set_next_clear_bit(|bit| bit != 1), Some(2));
        assert_eq!(bitmap.set_next_clear_bit(|_| true), Some(3));
        assert_eq!(bitmap.set_next_clear_bit(|_| true), Some(1));
        assert_eq!(bitmap.set_next_clear_bit(|_| true), None);

        bitmap.clear(0);
        assert_eq!(bitmap.set_next_clear_bit(|_| false), None);
        assert_eq!(bitmap.set_bits().collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
