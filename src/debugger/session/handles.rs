//! Generation tagged handles.
//!
//! A handle packs the arena generation and the item index: `generation << 20 | index + 1`.
//! Invalidation bumps the generation, so a handle of an earlier stop is detected in O(1)
//! and never resolves to an item minted later.

const INDEX_BITS: u32 = 20;
const INDEX_MASK: i64 = (1 << INDEX_BITS) - 1;
/// Keeps handles below 2^31, some clients store them as 32-bit integers.
const MAX_GENERATION: u32 = (1 << (31 - INDEX_BITS)) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Handle of an earlier generation.
    Stale,
    Unknown,
}

pub struct HandleArena<T> {
    generation: u32,
    items: Vec<T>,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self {
            generation: 1,
            items: vec![],
        }
    }
}

impl<T> HandleArena<T> {
    pub fn insert(&mut self, item: T) -> i64 {
        if self.items.len() as i64 >= INDEX_MASK {
            log::warn!(target: "session", "handle arena is full, handles are recycled");
            self.invalidate();
        }
        self.items.push(item);
        ((self.generation as i64) << INDEX_BITS) | self.items.len() as i64
    }

    pub fn get(&self, handle: i64) -> Result<&T, Lookup> {
        let generation = handle >> INDEX_BITS;
        let index = handle & INDEX_MASK;
        if handle <= 0 || index == 0 {
            return Err(Lookup::Unknown);
        }
        if generation != self.generation as i64 {
            return if generation >= 1 && generation <= MAX_GENERATION as i64 {
                Err(Lookup::Stale)
            } else {
                Err(Lookup::Unknown)
            };
        }
        self.items.get(index as usize - 1).ok_or(Lookup::Unknown)
    }

    /// Drop all items, handles minted so far become stale.
    pub fn invalidate(&mut self) {
        self.items.clear();
        self.generation = self.generation % MAX_GENERATION + 1;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
