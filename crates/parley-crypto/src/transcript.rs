//! Canonical byte strings for AEAD associated data.
//!
//! Fields are appended as (tag, len, bytes) tuples so the same logical
//! inputs always produce the same bytes on every platform, and no two
//! different field sequences can collide.

use bytes::{BufMut, BytesMut};

/// Tag constants for the fields this crate binds into AAD.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const VERSION: u32 = 1;
    pub const CONVERSATION: u32 = 2;
    pub const RECIPIENT_KEY: u32 = 3;
    pub const EPHEMERAL_KEY: u32 = 4;
}

#[derive(Clone, Debug, Default)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    /// Create a new transcript with the given domain separator.
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self {
            buf: BytesMut::with_capacity(128),
        };
        t.append_str(tags::DOMAIN, domain);
        t
    }

    /// Append raw bytes with a tag.
    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        // tag (u32 be) + len (u32 be) + data
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(8);
        self.buf.put_u64(v);
        self
    }

    pub fn append_str(&mut self, tag: u32, s: &str) -> &mut Self {
        self.append_bytes(tag, s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}
