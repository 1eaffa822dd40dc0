mod multipart;
mod request;
mod response;

use std::collections::HashMap;

use bytes::Bytes;

pub use multipart::UploadedFile;
pub use request::Request;
pub use response::{Response, SendError};

/// First position of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Progress of an incrementally parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    AwaitingRequestLine,
    AwaitingHeader,
    AwaitingBody,
    Complete,
    Aborted,
}

impl RequestStatus {
    /// True while the parser still wants bytes from the socket.
    pub fn is_receiving(self) -> bool {
        !matches!(self, RequestStatus::Complete | RequestStatus::Aborted)
    }
}

/// Multi-valued byte-string map. Values for a repeated key keep arrival
/// order; single-value lookup returns the most recently inserted value.
#[derive(Debug, Clone, Default)]
pub struct ByteMultiMap {
    inner: HashMap<Bytes, Vec<Bytes>>,
}

impl ByteMultiMap {
    pub(crate) fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.inner.entry(key.into()).or_default().push(value.into());
    }

    /// Append `extra` to the most recent value of `key`, joined by a single
    /// space. No-op if the key is absent.
    pub(crate) fn fold_into_last(&mut self, key: &[u8], extra: &[u8]) {
        if let Some(last) = self.inner.get_mut(key).and_then(|values| values.last_mut()) {
            let mut folded = Vec::with_capacity(last.len() + 1 + extra.len());
            folded.extend_from_slice(last);
            folded.push(b' ');
            folded.extend_from_slice(extra);
            *last = Bytes::from(folded);
        }
    }

    pub(crate) fn remove(&mut self, key: &[u8]) {
        self.inner.remove(key);
    }

    /// Most recently inserted value for `key`.
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.inner.get(key).and_then(|values| values.last())
    }

    /// All values for `key`, in arrival order.
    pub fn get_all(&self, key: &[u8]) -> &[Bytes] {
        self.inner.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &[Bytes])> {
        self.inner.iter().map(|(key, values)| (key, values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.inner.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimap_ordering() {
        let mut map = ByteMultiMap::default();
        map.insert(&b"k"[..], &b"1"[..]);
        map.insert(&b"k"[..], &b"2"[..]);
        map.insert(&b"other"[..], &b"x"[..]);

        assert_eq!(map.get(b"k").unwrap(), &Bytes::from_static(b"2"));
        let all: Vec<_> = map.get_all(b"k").iter().map(|v| &v[..]).collect();
        assert_eq!(all, vec![&b"1"[..], &b"2"[..]]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn multimap_folding() {
        let mut map = ByteMultiMap::default();
        map.insert(&b"k"[..], &b"one"[..]);
        map.fold_into_last(b"k", b"two");
        assert_eq!(&map.get(b"k").unwrap()[..], b"one two");
        // folding an absent key is a no-op
        map.fold_into_last(b"missing", b"x");
        assert!(!map.contains_key(b"missing"));
    }
}
