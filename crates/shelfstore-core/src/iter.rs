//! Version-checked iteration.
//!
//! An iterator captures the source's mutation version when it is created
//! and hands it back on every step. The source compares it with its current
//! version while holding whatever makes the read consistent (the store's
//! read lock, or the server's), and answers `ShelfError::Stale` on mismatch.
//! Once stale, an iterator stays stale.
//!
//! Positions index the source's slot order, which only changes on a
//! structural mutation, i.e. exactly when the version moves.

use crate::error::{ShelfError, ShelfResult};
use crate::value::{FieldMap, RecordValue};

/// Positional access used by [`StoreIter`]. Implemented by every store flavor.
pub trait CursorSource {
    type Value: RecordValue;

    /// Current mutation version.
    fn cursor_version(&self) -> ShelfResult<u64>;

    /// Key at `position`, or `None` past the end. Fails `Stale` if the
    /// version is no longer `version`.
    fn key_at(&self, version: u64, position: usize) -> ShelfResult<Option<Vec<u8>>>;

    /// Key and value at `position`, same contract as [`key_at`](CursorSource::key_at).
    fn entry_at(&self, version: u64, position: usize) -> ShelfResult<Option<(Vec<u8>, Self::Value)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Open,
    Exhausted,
    Stale { current: u64 },
}

/// Lazy cursor over a store's keys.
pub struct StoreIter<'a, S: ?Sized> {
    source: &'a S,
    version: u64,
    position: usize,
    state: IterState,
}

impl<'a, S: CursorSource + ?Sized> StoreIter<'a, S> {
    /// Snapshot the source's version; the cursor starts before the first key.
    pub fn new(source: &'a S) -> ShelfResult<Self> {
        let version = source.cursor_version()?;
        Ok(Self {
            source,
            version,
            position: 0,
            state: IterState::Open,
        })
    }

    /// Next key, `Ok(None)` at the end, `Err(Stale)` after a structural mutation.
    pub fn advance(&mut self) -> ShelfResult<Option<Vec<u8>>> {
        self.step(|source, version, position| source.key_at(version, position))
    }

    /// Like [`advance`](StoreIter::advance) but also returns the value.
    pub fn advance_entry(&mut self) -> ShelfResult<Option<(Vec<u8>, S::Value)>> {
        self.step(|source, version, position| source.entry_at(version, position))
    }

    fn step<T>(
        &mut self,
        fetch: impl FnOnce(&S, u64, usize) -> ShelfResult<Option<T>>,
    ) -> ShelfResult<Option<T>> {
        if let IterState::Stale { current } = self.state {
            return Err(ShelfError::Stale { expected: self.version, current });
        }
        match fetch(self.source, self.version, self.position) {
            Ok(Some(item)) => {
                self.position += 1;
                Ok(Some(item))
            }
            Ok(None) => {
                self.state = IterState::Exhausted;
                Ok(None)
            }
            Err(ShelfError::Stale { current, .. }) => {
                self.state = IterState::Stale { current };
                Err(ShelfError::Stale { expected: self.version, current })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `key` is among the keys not consumed yet. Does not move the cursor.
    pub fn remaining_contains(&self, key: &[u8]) -> ShelfResult<bool> {
        if let IterState::Stale { current } = self.state {
            return Err(ShelfError::Stale { expected: self.version, current });
        }
        let mut position = self.position;
        while let Some(candidate) = self.source.key_at(self.version, position)? {
            if candidate == key {
                return Ok(true);
            }
            position += 1;
        }
        Ok(false)
    }

    /// Keys consumed so far.
    pub fn consumed(&self) -> usize {
        self.position
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == IterState::Exhausted
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.state, IterState::Stale { .. })
    }

    /// Project the rest of this cursor onto values.
    pub fn into_values(self) -> Values<'a, S> {
        Values { inner: self }
    }

    /// Project the rest of this cursor onto (key, value) pairs.
    pub fn into_items(self) -> Items<'a, S> {
        Items { inner: self }
    }
}

impl<'a, S: CursorSource<Value = FieldMap> + ?Sized> StoreIter<'a, S> {
    /// Project the rest of this cursor onto each record's field names.
    pub fn into_value_keys(self) -> ValueKeys<'a, S> {
        ValueKeys { inner: self }
    }

    /// Project the rest of this cursor onto each record's field values.
    pub fn into_value_vals(self) -> ValueVals<'a, S> {
        ValueVals { inner: self }
    }
}

impl<'a, S: CursorSource + ?Sized> Iterator for StoreIter<'a, S> {
    type Item = ShelfResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Key-only view; the raw cursor already yields keys.
pub type Keys<'a, S> = StoreIter<'a, S>;

/// Value view in the order the keys are produced.
pub struct Values<'a, S: ?Sized> {
    inner: StoreIter<'a, S>,
}

impl<'a, S: CursorSource + ?Sized> Iterator for Values<'a, S> {
    type Item = ShelfResult<S::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .advance_entry()
            .map(|entry| entry.map(|(_, value)| value))
            .transpose()
    }
}

/// Paired (key, value) view.
pub struct Items<'a, S: ?Sized> {
    inner: StoreIter<'a, S>,
}

impl<'a, S: CursorSource + ?Sized> Iterator for Items<'a, S> {
    type Item = ShelfResult<(Vec<u8>, S::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.advance_entry().transpose()
    }
}

/// Field names of each record, in field order.
pub struct ValueKeys<'a, S: ?Sized> {
    inner: StoreIter<'a, S>,
}

impl<'a, S: CursorSource<Value = FieldMap> + ?Sized> Iterator for ValueKeys<'a, S> {
    type Item = ShelfResult<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .advance_entry()
            .map(|entry| entry.map(|(_, fields)| fields.into_iter().map(|(name, _)| name).collect()))
            .transpose()
    }
}

/// Field values of each record, in field order.
pub struct ValueVals<'a, S: ?Sized> {
    inner: StoreIter<'a, S>,
}

impl<'a, S: CursorSource<Value = FieldMap> + ?Sized> Iterator for ValueVals<'a, S> {
    type Item = ShelfResult<Vec<Vec<u8>>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .advance_entry()
            .map(|entry| entry.map(|(_, fields)| fields.into_iter().map(|(_, value)| value).collect()))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Fixed key list whose version can be bumped by hand.
    struct Scripted {
        keys: Vec<Vec<u8>>,
        version: Cell<u64>,
    }

    impl CursorSource for Scripted {
        type Value = Vec<u8>;

        fn cursor_version(&self) -> ShelfResult<u64> {
            Ok(self.version.get())
        }

        fn key_at(&self, version: u64, position: usize) -> ShelfResult<Option<Vec<u8>>> {
            if version != self.version.get() {
                return Err(ShelfError::Stale { expected: version, current: self.version.get() });
            }
            Ok(self.keys.get(position).cloned())
        }

        fn entry_at(&self, version: u64, position: usize) -> ShelfResult<Option<(Vec<u8>, Vec<u8>)>> {
            Ok(self.key_at(version, position)?.map(|k| {
                let v = k.iter().rev().copied().collect();
                (k, v)
            }))
        }
    }

    fn scripted() -> Scripted {
        Scripted {
            keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
            version: Cell::new(7),
        }
    }

    #[test]
    fn test_drain_then_end() {
        let source = scripted();
        let mut it = StoreIter::new(&source).unwrap();
        assert_eq!(it.advance().unwrap(), Some(b"a".to_vec()));
        assert_eq!(it.advance().unwrap(), Some(b"b".to_vec()));
        assert_eq!(it.advance().unwrap(), Some(b"c".to_vec()));
        assert_eq!(it.advance().unwrap(), None);
        assert!(it.is_exhausted());
        assert_eq!(it.advance().unwrap(), None);
    }

    #[test]
    fn test_stale_is_sticky() {
        let source = scripted();
        let mut it = StoreIter::new(&source).unwrap();
        it.advance().unwrap();
        source.version.set(8);
        assert!(matches!(it.advance(), Err(ShelfError::Stale { expected: 7, current: 8 })));
        // even if the version came back, the iterator stays dead
        source.version.set(7);
        assert!(matches!(it.advance(), Err(ShelfError::Stale { .. })));
        assert!(it.is_stale());
    }

    #[test]
    fn test_remaining_contains_does_not_consume() {
        let source = scripted();
        let mut it = StoreIter::new(&source).unwrap();
        assert!(it.remaining_contains(b"a").unwrap());
        assert_eq!(it.advance().unwrap(), Some(b"a".to_vec()));
        assert!(!it.remaining_contains(b"a").unwrap());
        assert!(it.remaining_contains(b"c").unwrap());
        assert_eq!(it.consumed(), 1);
    }

    #[test]
    fn test_views_follow_key_order() {
        let source = scripted();
        let values: Vec<Vec<u8>> = StoreIter::new(&source)
            .unwrap()
            .into_values()
            .collect::<ShelfResult<_>>()
            .unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let mut items = StoreIter::new(&source).unwrap().into_items();
        assert_eq!(items.next().unwrap().unwrap().0, b"a".to_vec());
    }
}
