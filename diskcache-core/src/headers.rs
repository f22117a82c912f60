//! The small header bag preserved alongside each cache entry.
//!
//! Only the client-supplied hints are stored here (`Content-Type`,
//! `Content-Encoding`, `Cache-Control`, plus any opaque passthrough pairs);
//! `Content-Length`, `Etag` and `Last-Modified` are always derived from the
//! entry's `size`, `digest` and `store_time` and are never duplicated into
//! the serialized bag. Serialization is a hand-rolled binary format with a
//! leading version byte so a future format change can be detected instead
//! of silently misread.

use std::collections::BTreeMap;

const HEADER_BAG_VERSION: u8 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    /// Any other recognized-but-opaque header hints the facade wants to
    /// round-trip (currently unused by the HTTP facade but kept so the
    /// format doesn't need to change if a new passthrough header shows up).
    pub passthrough: BTreeMap<String, String>,
}

impl HeaderBag {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(HEADER_BAG_VERSION);
        write_opt(&mut buf, &self.content_type);
        write_opt(&mut buf, &self.content_encoding);
        write_opt(&mut buf, &self.cache_control);
        write_u32(&mut buf, self.passthrough.len() as u32);
        for (k, v) in &self.passthrough {
            write_str(&mut buf, k);
            write_str(&mut buf, v);
        }
        buf
    }

    /// Parses a serialized bag. An empty slice (never-written tag) decodes
    /// to the default bag rather than an error, since `rowid`-less fresh
    /// inserts always supply one, but defensive readers of old rows should
    /// not fail a lookup over it.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return Some(Self::default());
        }
        let mut cur = Cursor { data, pos: 0 };
        let version = cur.read_u8()?;
        if version != HEADER_BAG_VERSION {
            return None;
        }
        let content_type = read_opt(&mut cur)?;
        let content_encoding = read_opt(&mut cur)?;
        let cache_control = read_opt(&mut cur)?;
        let count = cur.read_u32()?;
        let mut passthrough = BTreeMap::new();
        for _ in 0..count {
            let k = cur.read_str()?;
            let v = cur.read_str()?;
            passthrough.insert(k, v);
        }
        Some(Self {
            content_type,
            content_encoding,
            cache_control,
            passthrough,
        })
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_opt(buf: &mut Vec<u8>, v: &Option<String>) {
    match v {
        Some(s) => {
            buf.push(1);
            write_str(buf, s);
        }
        None => buf.push(0),
    }
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn read_str(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

fn read_opt(cur: &mut Cursor) -> Option<Option<String>> {
    match cur.read_u8()? {
        0 => Some(None),
        1 => Some(Some(cur.read_str()?)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_full_bag() {
        let mut bag = HeaderBag {
            content_type: Some("text/plain".to_string()),
            content_encoding: Some("gzip".to_string()),
            cache_control: Some("public, must-revalidate".to_string()),
            passthrough: BTreeMap::new(),
        };
        bag.passthrough.insert("x-custom".to_string(), "value".to_string());

        let bytes = bag.to_bytes();
        let decoded = HeaderBag::from_bytes(&bytes).unwrap();
        assert_eq!(bag, decoded);
    }

    #[test]
    fn round_trips_empty_bag() {
        let bag = HeaderBag::default();
        let decoded = HeaderBag::from_bytes(&bag.to_bytes()).unwrap();
        assert_eq!(bag, decoded);
    }

    #[test]
    fn empty_slice_decodes_to_default() {
        assert_eq!(HeaderBag::from_bytes(&[]).unwrap(), HeaderBag::default());
    }

    #[test]
    fn rejects_unknown_version() {
        let bytes = vec![99u8, 0, 0, 0, 0, 0, 0, 0];
        assert!(HeaderBag::from_bytes(&bytes).is_none());
    }
}
