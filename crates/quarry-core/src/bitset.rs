//! Dense bitsets over arena ids.
//!
//! Table sets, column sets and memo keys are all sets of small dense ids, so
//! a word-packed bitset beats hash sets for the set algebra the search does
//! on every recursion step. Equality and hashing ignore trailing zero words
//! so a set compares equal regardless of the capacity it grew to.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::id::RawId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdSet {
    words: Vec<u64>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I: RawId>(ids: impl IntoIterator<Item = I>) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id);
        }
        set
    }

    fn significant_words(&self) -> &[u64] {
        let mut n = self.words.len();
        while n > 0 && self.words[n - 1] == 0 {
            n -= 1;
        }
        &self.words[..n]
    }

    pub fn insert<I: RawId>(&mut self, id: I) -> bool {
        let (word, bit) = (id.raw() as usize / 64, id.raw() % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let prev = self.words[word];
        self.words[word] |= 1 << bit;
        prev != self.words[word]
    }

    pub fn remove<I: RawId>(&mut self, id: I) {
        let (word, bit) = (id.raw() as usize / 64, id.raw() % 64);
        if word < self.words.len() {
            self.words[word] &= !(1 << bit);
        }
    }

    pub fn contains<I: RawId>(&self, id: I) -> bool {
        let (word, bit) = (id.raw() as usize / 64, id.raw() % 64);
        word < self.words.len() && self.words[word] & (1 << bit) != 0
    }

    pub fn union_with(&mut self, other: &IdSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
    }

    pub fn intersect_with(&mut self, other: &IdSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    pub fn difference_with(&mut self, other: &IdSet) {
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !*o;
        }
    }

    pub fn is_subset_of(&self, other: &IdSet) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, w)| *w & !other.words.get(i).copied().unwrap_or(0) == 0)
    }

    pub fn intersects(&self, other: &IdSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(w, o)| w & o != 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn iter_raw(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            (0..64).filter_map(move |bit| {
                if w & (1u64 << bit) != 0 {
                    Some((i * 64 + bit) as u32)
                } else {
                    None
                }
            })
        })
    }

    pub fn iter<'a, I: RawId + 'a>(&'a self) -> impl Iterator<Item = I> + 'a {
        self.iter_raw().map(I::from_raw)
    }
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for IdSet {}

impl Hash for IdSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TableId;

    #[test]
    fn set_algebra() {
        let mut a = IdSet::from_ids([TableId::new(1), TableId::new(3), TableId::new(90)]);
        let b = IdSet::from_ids([TableId::new(3), TableId::new(4)]);

        assert!(a.contains(TableId::new(90)));
        assert!(!a.contains(TableId::new(4)));
        assert!(a.intersects(&b));
        assert_eq!(a.len(), 3);

        a.union_with(&b);
        assert_eq!(a.len(), 4);
        assert!(b.is_subset_of(&a));

        a.difference_with(&b);
        assert!(!a.contains(TableId::new(3)));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn equality_ignores_capacity() {
        let mut a = IdSet::new();
        a.insert(TableId::new(1));
        let mut b = IdSet::new();
        b.insert(TableId::new(200));
        b.insert(TableId::new(1));
        b.remove(TableId::new(200));
        assert_eq!(a, b);

        use std::collections::hash_map::DefaultHasher;
        let hash = |s: &IdSet| {
            let mut h = DefaultHasher::new();
            s.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn iter_round_trips() {
        let ids = [TableId::new(0), TableId::new(63), TableId::new(64)];
        let set = IdSet::from_ids(ids);
        let back: Vec<TableId> = set.iter().collect();
        assert_eq!(back, ids);
    }
}
