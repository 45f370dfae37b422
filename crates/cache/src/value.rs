/// Opaque cached record: caller-supplied key and value bytes.
///
/// The cache never interprets the contents; only the key bytes participate
/// in equality checks (the hash alone is not collision-safe). Records are
/// shared via `Arc`: a bucket holds one reference while the record is
/// resident, and `find` hands additional references to callers, so a record
/// stays readable even after it is evicted underneath them.
#[derive(Debug)]
pub struct CachedValue {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

impl CachedValue {
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Exact key comparison; used after the hash pre-filter.
    pub fn matches(&self, key: &[u8]) -> bool {
        *self.key == *key
    }

    /// Memory accounting estimate for this record, including the fixed
    /// per-record overhead of the two heap allocations and the header.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.len() + 16
    }
}
