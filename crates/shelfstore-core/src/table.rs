//! Slot table: the in-memory hash table behind a store.
//!
//! Records live in a dense `Vec` of slots; a SwissTable maps each key to its
//! slot index. Removal swaps the last slot into the hole, so slot order is
//! stable only while the key set is unchanged. That is exactly the window
//! in which an iterator is allowed to walk it by position.

use hashbrown::HashMap;

pub(crate) struct Slot<V> {
    pub key: Vec<u8>,
    pub value: V,
}

pub(crate) struct SlotTable<V> {
    index: HashMap<Vec<u8>, usize>,
    slots: Vec<Slot<V>>,
}

impl<V> SlotTable<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.index.get(key).map(|&i| &self.slots[i].value)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        match self.index.get(key) {
            Some(&i) => Some(&mut self.slots[i].value),
            None => None,
        }
    }

    /// Insert or replace. Returns true when the key is new.
    pub fn upsert(&mut self, key: &[u8], value: V) -> bool {
        if let Some(slot) = self.get_mut(key) {
            *slot = value;
            return false;
        }
        self.index.insert(key.to_vec(), self.slots.len());
        self.slots.push(Slot { key: key.to_vec(), value });
        true
    }

    /// Remove a key, moving the last slot into its place.
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let i = self.index.remove(key)?;
        let removed = self.slots.swap_remove(i);
        if let Some(moved) = self.slots.get(i) {
            if let Some(pos) = self.index.get_mut(moved.key.as_slice()) {
                *pos = i;
            }
        }
        Some(removed.value)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
    }

    /// Slot at `position`, in table order.
    pub fn slot(&self, position: usize) -> Option<&Slot<V>> {
        self.slots.get(position)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot<V>> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_reports_new_keys() {
        let mut table = SlotTable::with_capacity(4);
        assert!(table.upsert(b"a", 1));
        assert!(table.upsert(b"b", 2));
        assert!(!table.upsert(b"a", 3));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b"a"), Some(&3));
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut table = SlotTable::with_capacity(4);
        for (i, k) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            table.upsert(*k, i);
        }
        assert_eq!(table.remove(b"a"), Some(0));
        assert_eq!(table.remove(b"a"), None);
        // "d" moved into slot 0
        assert_eq!(table.slot(0).map(|s| s.key.as_slice()), Some(&b"d"[..]));
        assert_eq!(table.get(b"d"), Some(&3));
        assert_eq!(table.remove(b"d"), Some(3));
        assert_eq!(table.get(b"b"), Some(&1));
        assert_eq!(table.get(b"c"), Some(&2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_last_slot() {
        let mut table = SlotTable::with_capacity(2);
        table.upsert(b"x", ());
        table.upsert(b"y", ());
        table.remove(b"y");
        assert!(table.contains(b"x"));
        assert!(table.slot(1).is_none());
    }

    #[test]
    fn test_clear() {
        let mut table = SlotTable::with_capacity(2);
        table.upsert(b"x", 1);
        table.clear();
        assert_eq!(table.len(), 0);
        assert!(!table.contains(b"x"));
    }
}
