//! Length-prefixed header block codec.
//!
//! Header blocks carried in HEADERS/CONTINUATION frames use a simple
//! literal encoding instead of HPACK:
//!
//! ```text
//! count: u16 BE
//! repeated `count` times:
//!     name_len: u16 BE | name bytes | value_len: u16 BE | value bytes
//! ```
//!
//! There is no dynamic table and no Huffman coding, so blocks produced here
//! are not understood by HPACK-only peers.

use bytes::BufMut;

use crate::error::H2Error;

/// Per-entry overhead counted against SETTINGS_MAX_HEADER_LIST_SIZE
/// (RFC 7540 Section 6.5.2).
const ENTRY_OVERHEAD: usize = 32;

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether this is a pseudo-header (`:status`, `:path`, ...).
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    fn list_size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// Encode `fields` into `buf`.
///
/// Fails without writing anything if there are more than 65535 fields or a
/// name or value is longer than 65535 bytes.
pub fn encode(fields: &[HeaderField], buf: &mut Vec<u8>) -> Result<(), H2Error> {
    let count = u16::try_from(fields.len()).map_err(|_| H2Error::HeaderBlock("too many fields"))?;
    if fields
        .iter()
        .any(|f| f.name.len() > usize::from(u16::MAX) || f.value.len() > usize::from(u16::MAX))
    {
        return Err(H2Error::HeaderBlock("field too long"));
    }

    let size: usize = fields.iter().map(|f| 4 + f.name.len() + f.value.len()).sum();
    buf.reserve(2 + size);
    buf.put_u16(count);
    for field in fields {
        buf.put_u16(field.name.len() as u16);
        buf.extend_from_slice(&field.name);
        buf.put_u16(field.value.len() as u16);
        buf.extend_from_slice(&field.value);
    }
    Ok(())
}

/// Decode a complete header block.
///
/// The block must contain exactly `count` entries and nothing after them.
/// When `max_list_size` is set, the decoded list is bounded by it.
pub fn decode(block: &[u8], max_list_size: Option<u32>) -> Result<Vec<HeaderField>, H2Error> {
    let mut cursor = Cursor { buf: block };
    let count = cursor.u16()?;
    let mut fields = Vec::with_capacity(usize::from(count).min(64));
    let mut list_size = 0usize;

    for _ in 0..count {
        let name_len = cursor.u16()?;
        let name = cursor.take(usize::from(name_len))?;
        let value_len = cursor.u16()?;
        let value = cursor.take(usize::from(value_len))?;
        let field = HeaderField::new(name, value);

        list_size += field.list_size();
        if let Some(max) = max_list_size
            && list_size > max as usize
        {
            return Err(H2Error::HeaderBlock("header list too large"));
        }
        fields.push(field);
    }

    if !cursor.buf.is_empty() {
        return Err(H2Error::HeaderBlock("trailing bytes after last field"));
    }
    Ok(fields)
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], H2Error> {
        if self.buf.len() < n {
            return Err(H2Error::HeaderBlock("truncated block"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, H2Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
