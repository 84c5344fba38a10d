//! The mapping contract shared by local and remote stores.

use std::collections::HashSet;

use crate::error::{ShelfError, ShelfResult};
use crate::iter::{CursorSource, Items, Keys, StoreIter, ValueKeys, ValueVals, Values};
use crate::value::FieldMap;

/// Dictionary-style access to a record store.
///
/// Every method takes `&self`; implementations serialize internally.
/// Keys are arbitrary bytes without NUL. Mutations that add or remove a key
/// (or clear) move the store's version and invalidate live iterators;
/// overwriting an existing key does not.
pub trait KvStore: CursorSource {
    /// Whether `key` is present.
    fn contains(&self, key: &[u8]) -> ShelfResult<bool>;

    /// Value for `key`, or `None` when absent.
    fn lookup(&self, key: &[u8]) -> ShelfResult<Option<Self::Value>>;

    /// Value for `key`; a missing key is `NotFound`.
    fn get(&self, key: &[u8]) -> ShelfResult<Self::Value> {
        self.lookup(key)?
            .ok_or_else(|| ShelfError::NotFound { key: key.to_vec() })
    }

    /// Insert or overwrite.
    fn put(&self, key: &[u8], value: Self::Value) -> ShelfResult<()>;

    /// Insert only if absent; otherwise `AlreadyExists` and nothing changes.
    fn putkeep(&self, key: &[u8], value: Self::Value) -> ShelfResult<()>;

    /// Append to the existing value, or insert when absent.
    fn putcat(&self, key: &[u8], value: Self::Value) -> ShelfResult<()>;

    /// Remove `key`; a missing key is `NotFound`.
    fn remove(&self, key: &[u8]) -> ShelfResult<()>;

    /// Remove every record. Always invalidates live iterators.
    fn clear(&self) -> ShelfResult<()>;

    fn len(&self) -> ShelfResult<usize>;

    fn is_empty(&self) -> ShelfResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys starting with `prefix`, at most `limit` of them (all when `None`).
    fn search_keys(&self, prefix: &[u8], limit: Option<usize>) -> ShelfResult<HashSet<Vec<u8>>>;

    /// Fresh cursor over the keys.
    fn iter(&self) -> ShelfResult<StoreIter<'_, Self>> {
        StoreIter::new(self)
    }

    fn keys(&self) -> ShelfResult<Keys<'_, Self>> {
        StoreIter::new(self)
    }

    fn values(&self) -> ShelfResult<Values<'_, Self>> {
        Ok(StoreIter::new(self)?.into_values())
    }

    fn items(&self) -> ShelfResult<Items<'_, Self>> {
        Ok(StoreIter::new(self)?.into_items())
    }

    /// Field names of every record.
    fn value_keys(&self) -> ShelfResult<ValueKeys<'_, Self>>
    where
        Self: CursorSource<Value = FieldMap>,
    {
        Ok(StoreIter::new(self)?.into_value_keys())
    }

    /// Field values of every record.
    fn value_vals(&self) -> ShelfResult<ValueVals<'_, Self>>
    where
        Self: CursorSource<Value = FieldMap>,
    {
        Ok(StoreIter::new(self)?.into_value_vals())
    }
}
