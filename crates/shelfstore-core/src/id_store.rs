//! Id-keyed text store.
//!
//! A thin layer over a flat [`Store`]: ids are positive integers stored as
//! their decimal form, values are UTF-8 text without NUL.

use std::path::Path;

use crate::config::{Config, OpenFlags};
use crate::error::{ShelfError, ShelfResult};
use crate::iter::{Items, StoreIter, Values};
use crate::kv::KvStore;
use crate::store::{FlatStore, Store};

pub struct IdStore {
    inner: FlatStore,
}

impl IdStore {
    pub fn memory() -> Self {
        Self { inner: Store::memory() }
    }

    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> ShelfResult<Self> {
        Ok(Self { inner: Store::open(path, flags)? })
    }

    pub fn open_with<P: AsRef<Path>>(path: P, flags: OpenFlags, config: Config) -> ShelfResult<Self> {
        Ok(Self { inner: Store::open_with(path, flags, config)? })
    }

    pub fn contains(&self, id: u64) -> ShelfResult<bool> {
        self.inner.contains(&encode_id(id)?)
    }

    pub fn get(&self, id: u64) -> ShelfResult<String> {
        decode_text(self.inner.get(&encode_id(id)?)?)
    }

    pub fn lookup(&self, id: u64) -> ShelfResult<Option<String>> {
        self.inner.lookup(&encode_id(id)?)?.map(decode_text).transpose()
    }

    pub fn put(&self, id: u64, text: &str) -> ShelfResult<()> {
        let key = encode_id(id)?;
        if text.as_bytes().contains(&0) {
            return Err(ShelfError::invalid("text contains a NUL byte"));
        }
        self.inner.put(&key, text.as_bytes().to_vec())
    }

    pub fn remove(&self, id: u64) -> ShelfResult<()> {
        self.inner.remove(&encode_id(id)?)
    }

    pub fn clear(&self) -> ShelfResult<()> {
        self.inner.clear()
    }

    pub fn len(&self) -> ShelfResult<usize> {
        self.inner.len()
    }

    pub fn is_empty(&self) -> ShelfResult<bool> {
        self.inner.is_empty()
    }

    /// Version-checked cursor over the ids.
    pub fn ids(&self) -> ShelfResult<IdIter<'_>> {
        Ok(IdIter { inner: self.inner.iter()? })
    }

    /// Texts in id order of the cursor.
    pub fn values(&self) -> ShelfResult<IdValues<'_>> {
        Ok(IdValues { inner: self.inner.iter()?.into_values() })
    }

    /// (id, text) pairs.
    pub fn items(&self) -> ShelfResult<IdItems<'_>> {
        Ok(IdItems { inner: self.inner.iter()?.into_items() })
    }

    pub fn sync(&self) -> ShelfResult<()> {
        self.inner.sync()
    }

    pub fn byte_size(&self) -> ShelfResult<u64> {
        self.inner.byte_size()
    }

    pub fn close(&self) -> ShelfResult<()> {
        self.inner.close()
    }

    /// The flat store underneath.
    pub fn as_store(&self) -> &FlatStore {
        &self.inner
    }
}

/// Ids in store order; goes stale like any other cursor.
pub struct IdIter<'a> {
    inner: StoreIter<'a, FlatStore>,
}

impl IdIter<'_> {
    pub fn remaining_contains(&self, id: u64) -> ShelfResult<bool> {
        self.inner.remaining_contains(&encode_id(id)?)
    }
}

impl Iterator for IdIter<'_> {
    type Item = ShelfResult<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.advance() {
            Ok(Some(key)) => Some(decode_id(&key)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

pub struct IdValues<'a> {
    inner: Values<'a, FlatStore>,
}

impl Iterator for IdValues<'_> {
    type Item = ShelfResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|value| value.and_then(decode_text))
    }
}

pub struct IdItems<'a> {
    inner: Items<'a, FlatStore>,
}

impl Iterator for IdItems<'_> {
    type Item = ShelfResult<(u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|entry| entry.and_then(|(key, value)| Ok((decode_id(&key)?, decode_text(value)?))))
    }
}

fn encode_id(id: u64) -> ShelfResult<Vec<u8>> {
    if id == 0 {
        return Err(ShelfError::invalid("ids start at 1"));
    }
    Ok(id.to_string().into_bytes())
}

fn decode_id(key: &[u8]) -> ShelfResult<u64> {
    std::str::from_utf8(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&id| id > 0)
        .ok_or_else(|| ShelfError::invalid(format!("key {:?} is not an id", String::from_utf8_lossy(key))))
}

fn decode_text(bytes: Vec<u8>) -> ShelfResult<String> {
    String::from_utf8(bytes).map_err(|_| ShelfError::invalid("stored text is not valid UTF-8"))
}
