//! A fixed bit array supporting constant-time first-set-bit scans, used to
//! track the non-empty priority buckets of the task ready queue.
use core::fmt;

use super::{ctz::trailing_zeros, Init};
use crate::cfg::PRIORITY_LEVELS;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;
const SECOND_LEN: usize = (PRIORITY_LEVELS + WORD_LEN - 1) / WORD_LEN;

/// A two-level bit array of [`PRIORITY_LEVELS`] bits.
///
/// The first level holds one bit per second-level word. Scanning is two
/// trailing-zeros operations regardless of the bit count.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedPrioBitmap {
    /// Invariant: `first` bit `i` is set iff `second[i] != 0`.
    first: Word,
    second: [Word; SECOND_LEN],
}

impl Init for FixedPrioBitmap {
    const INIT: Self = Self {
        first: 0,
        second: [0; SECOND_LEN],
    };
}

impl FixedPrioBitmap {
    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIORITY_LEVELS);
        self.second[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIORITY_LEVELS);
        self.second[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.first |= 1 << (i / WORD_LEN);
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIORITY_LEVELS);
        let group = &mut self.second[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.first &= !(1 << (i / WORD_LEN));
        }
    }

    /// Get the position of the first (lowest-index) set bit.
    pub fn find_set(&self) -> Option<usize> {
        let group_i = trailing_zeros(self.first) as usize;
        if group_i >= SECOND_LEN {
            return None;
        }
        let subgroup_i = trailing_zeros(self.second[group_i]) as usize;
        debug_assert_ne!(subgroup_i, WORD_LEN);
        Some(group_i * WORD_LEN + subgroup_i)
    }
}

impl fmt::Debug for FixedPrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..PRIORITY_LEVELS).filter(|&i| self.get(i)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next().cloned()
        }
    }

    /// A modifying operation on a bitmap.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % PRIORITY_LEVELS;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &FixedPrioBitmap) -> Vec<usize> {
        (0..PRIORITY_LEVELS).filter(|&i| bitmap.get(i)).collect()
    }

    #[quickcheck]
    fn matches_reference_model(bytecode: Vec<u8>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut subject = FixedPrioBitmap::INIT;
        let mut reference = BTreePrioBitmap::new();

        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(enum_set_bits(&subject), reference.enum_set_bits());
    }

    #[test]
    fn empty() {
        assert_eq!(FixedPrioBitmap::INIT.find_set(), None);
    }

    #[test]
    fn extremes() {
        let mut bitmap = FixedPrioBitmap::INIT;
        bitmap.set(PRIORITY_LEVELS - 1);
        assert_eq!(bitmap.find_set(), Some(PRIORITY_LEVELS - 1));
        bitmap.set(0);
        assert_eq!(bitmap.find_set(), Some(0));
        bitmap.clear(0);
        assert_eq!(bitmap.find_set(), Some(PRIORITY_LEVELS - 1));
        bitmap.clear(PRIORITY_LEVELS - 1);
        assert_eq!(bitmap.find_set(), None);
    }
}
