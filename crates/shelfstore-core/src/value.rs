//! Record value shapes.
//!
//! A store holds either flat byte strings (`Vec<u8>`) or multi-field records
//! (`FieldMap`). The shape is fixed per store through the `RecordValue` type
//! parameter and recorded in the backing file as a [`ValueShape`] tag.

use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::error::{ShelfError, ShelfResult};

/// Value shape tag written into the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueShape {
    /// One opaque byte string per key
    Flat = 1,
    /// A map of named sub-values per key
    Fields = 2,
}

impl ValueShape {
    /// Decode the header byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ValueShape::Flat),
            2 => Some(ValueShape::Fields),
            _ => None,
        }
    }

    /// Name used in errors and statistics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueShape::Flat => "flat",
            ValueShape::Fields => "fields",
        }
    }
}

/// Behavior a value type needs to live in a [`Store`](crate::Store).
pub trait RecordValue: Clone + Send + Sync + 'static {
    /// Shape tag for the backing file.
    const SHAPE: ValueShape;

    /// Reject malformed values before they reach the log.
    fn validate(&self) -> ShelfResult<()>;

    /// Serialize for the record log and the wire.
    fn encode(&self) -> Vec<u8>;

    /// Inverse of [`encode`](RecordValue::encode).
    fn decode(bytes: &[u8]) -> ShelfResult<Self>;

    /// Fold `tail` into `self` for putcat.
    fn concat(&mut self, tail: Self);

    /// Bytes accounted to this value in an in-memory store.
    fn byte_len(&self) -> usize;
}

impl RecordValue for Vec<u8> {
    const SHAPE: ValueShape = ValueShape::Flat;

    fn validate(&self) -> ShelfResult<()> {
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> ShelfResult<Self> {
        Ok(bytes.to_vec())
    }

    fn concat(&mut self, tail: Self) {
        self.extend_from_slice(&tail);
    }

    fn byte_len(&self) -> usize {
        self.len()
    }
}

/// Multi-field record: sub-key to binary sub-value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<String, Vec<u8>>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, returning the previous sub-value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        self.fields.insert(name.into(), value.into())
    }

    /// Builder form of [`insert`](FieldMap::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        self.fields.remove(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in sub-key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<u8>> {
        self.fields.iter()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = FieldMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

impl IntoIterator for FieldMap {
    type Item = (String, Vec<u8>);
    type IntoIter = btree_map::IntoIter<String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a FieldMap {
    type Item = (&'a String, &'a Vec<u8>);
    type IntoIter = btree_map::Iter<'a, String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// Encoding: `count u32 | (name_len u16 | name | value_len u32 | value)*`, all LE.
impl RecordValue for FieldMap {
    const SHAPE: ValueShape = ValueShape::Fields;

    fn validate(&self) -> ShelfResult<()> {
        for name in self.fields.keys() {
            if name.is_empty() {
                return Err(ShelfError::invalid("field names must not be empty"));
            }
            if name.len() > u16::MAX as usize {
                return Err(ShelfError::invalid(format!(
                    "field name of {} bytes exceeds {}",
                    name.len(),
                    u16::MAX
                )));
            }
        }
        Ok(())
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.byte_len() + self.fields.len() * 6);
        buf.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for (name, value) in &self.fields {
            buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        buf
    }

    fn decode(bytes: &[u8]) -> ShelfResult<Self> {
        let mut rest = bytes;
        let count = take_u32(&mut rest)? as usize;
        let mut fields = BTreeMap::new();
        for _ in 0..count {
            let name_len = take_u16(&mut rest)? as usize;
            let name = take_slice(&mut rest, name_len)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| ShelfError::invalid("field name is not valid UTF-8"))?;
            let value_len = take_u32(&mut rest)? as usize;
            let value = take_slice(&mut rest, value_len)?.to_vec();
            fields.insert(name, value);
        }
        if !rest.is_empty() {
            return Err(ShelfError::invalid(format!(
                "{} trailing bytes after field map",
                rest.len()
            )));
        }
        Ok(FieldMap { fields })
    }

    /// Existing sub-values win; only new sub-keys are added.
    fn concat(&mut self, tail: Self) {
        for (name, value) in tail.fields {
            self.fields.entry(name).or_insert(value);
        }
    }

    fn byte_len(&self) -> usize {
        self.fields.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

fn take_slice<'a>(rest: &mut &'a [u8], len: usize) -> ShelfResult<&'a [u8]> {
    if rest.len() < len {
        return Err(ShelfError::invalid(format!(
            "field map truncated: need {} bytes, have {}",
            len,
            rest.len()
        )));
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    Ok(head)
}

fn take_u16(rest: &mut &[u8]) -> ShelfResult<u16> {
    let b = take_slice(rest, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn take_u32(rest: &mut &[u8]) -> ShelfResult<u32> {
    let b = take_slice(rest, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Keys (and search prefixes) must not carry an embedded NUL byte.
pub fn validate_key(key: &[u8]) -> ShelfResult<()> {
    if let Some(pos) = key.iter().position(|&b| b == 0) {
        return Err(ShelfError::invalid(format!(
            "key contains a NUL byte at position {}",
            pos
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_concat_keeps_nul_bytes() {
        let mut v = b"ab".to_vec();
        v.concat(b"c\0d".to_vec());
        assert_eq!(v, b"abc\0d");
    }

    #[test]
    fn test_field_map_encode_decode() {
        let map = FieldMap::new().with("test", b"c\0d".to_vec()).with("n", b"".to_vec());
        let decoded = FieldMap::decode(&map.encode()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_field_map_concat_keeps_existing() {
        let mut map = FieldMap::new().with("test", b"a".to_vec());
        map.concat(FieldMap::new().with("test", b"b".to_vec()).with("test2", b"c".to_vec()));
        assert_eq!(map.get("test"), Some(&b"a"[..]));
        assert_eq!(map.get("test2"), Some(&b"c"[..]));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_empty_field_name_rejected() {
        let map = FieldMap::new().with("", b"a".to_vec());
        assert!(matches!(map.validate(), Err(ShelfError::InvalidArgument { .. })));
    }

    #[test]
    fn test_truncated_field_map_rejected() {
        let mut bytes = FieldMap::new().with("k", b"value".to_vec()).encode();
        bytes.truncate(bytes.len() - 2);
        assert!(FieldMap::decode(&bytes).is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key(b"abc").is_ok());
        assert!(validate_key(b"").is_ok());
        assert!(validate_key(b"b\0c").is_err());
    }
}
