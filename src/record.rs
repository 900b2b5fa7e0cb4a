//! Off-heap layout of a stored chain
//!
//! A chain occupies one contiguous page:
//!
//! ```text
//! [header][len0 (u32)][bytes0 ...][len1 (u32)][bytes1 ...] ... [unused capacity]
//! ```
//!
//! Header layout with validation feature:
//! ```text
//! [0..4]  count: number of elements
//! [4..8]  used: bytes in use, header included
//! [8]     MAGIC0 (0xC4)
//! [9]     MAGIC1 (0x1A)
//! [10]    checksum
//! [11]    reserved
//! ```
//!
//! Header layout without validation:
//! ```text
//! [0..4]  count: number of elements
//! [4..8]  used: bytes in use, header included
//! ```

use crate::chain::{Chain, Element};
use bytes::Bytes;

/// Header at the start of every stored chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChainHeader {
    count: u32,
    used: u32,
}

impl ChainHeader {
    /// Magic bytes to detect valid headers ("CHAIN"-ish)
    #[cfg(feature = "validation")]
    pub const MAGIC0: u8 = 0xC4;
    #[cfg(feature = "validation")]
    pub const MAGIC1: u8 = 0x1A;

    #[cfg(feature = "validation")]
    pub const SIZE: usize = 12;

    #[cfg(not(feature = "validation"))]
    pub const SIZE: usize = 8;

    /// Length prefix written before every element
    pub const ELEMENT_HEADER_SIZE: usize = 4;

    pub fn new(count: u32, used: u32) -> Self {
        Self { count, used }
    }

    #[cfg(feature = "validation")]
    fn compute_checksum(count: u32, used: u32) -> u8 {
        let mut checksum = Self::MAGIC0 ^ Self::MAGIC1;
        for byte in count.to_ne_bytes().into_iter().chain(used.to_ne_bytes()) {
            checksum ^= byte;
        }
        checksum
    }

    /// Try to parse a header, returning None if validation fails.
    pub fn try_from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let count = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        let used = u32::from_ne_bytes([data[4], data[5], data[6], data[7]]);

        #[cfg(feature = "validation")]
        {
            if data[8] != Self::MAGIC0 || data[9] != Self::MAGIC1 {
                return None;
            }
            if data[10] != Self::compute_checksum(count, used) {
                return None;
            }
        }

        if (used as usize) < Self::SIZE || used as usize > data.len() {
            return None;
        }

        Some(Self { count, used })
    }

    /// Parse a header, panicking with context if it is corrupt. Stored chains
    /// are only ever written by this crate, so a bad header is a bug.
    pub fn from_bytes_with_context(data: &[u8], key: u64, operation: &str) -> Self {
        match Self::try_from_bytes(data) {
            Some(header) => header,
            None => panic!(
                "CORRUPTION in {}: invalid chain header for key {}. Raw header bytes: {:02X?}",
                operation,
                key,
                &data[..Self::SIZE.min(data.len())]
            ),
        }
    }

    pub fn to_bytes(&self, data: &mut [u8]) {
        debug_assert!(data.len() >= Self::SIZE);

        data[0..4].copy_from_slice(&self.count.to_ne_bytes());
        data[4..8].copy_from_slice(&self.used.to_ne_bytes());

        #[cfg(feature = "validation")]
        {
            data[8] = Self::MAGIC0;
            data[9] = Self::MAGIC1;
            data[10] = Self::compute_checksum(self.count, self.used);
            data[11] = 0;
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn used(&self) -> usize {
        self.used as usize
    }
}

/// Bytes taken by one element of `len` payload bytes
pub(crate) fn element_size(len: usize) -> usize {
    ChainHeader::ELEMENT_HEADER_SIZE + len
}

/// Bytes taken by a chain holding the given payloads
pub(crate) fn encoded_len<'a, I>(payloads: I) -> usize
where
    I: IntoIterator<Item = &'a [u8]>,
{
    payloads
        .into_iter()
        .fold(ChainHeader::SIZE, |total, payload| total + element_size(payload.len()))
}

/// Write one element at `at`, returning the offset just past it.
pub(crate) fn write_element(data: &mut [u8], at: usize, payload: &[u8]) -> usize {
    let len = u32::try_from(payload.len()).expect("element larger than u32::MAX bytes");
    let start = at + ChainHeader::ELEMENT_HEADER_SIZE;
    let end = start + payload.len();
    assert!(
        end <= data.len(),
        "element write (len={}) would exceed region of {} bytes",
        payload.len(),
        data.len()
    );
    data[at..start].copy_from_slice(&len.to_ne_bytes());
    data[start..end].copy_from_slice(payload);
    end
}

/// Encode a whole chain into a freshly allocated buffer.
pub(crate) fn encode<'a, I>(payloads: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]> + Clone,
{
    let used = encoded_len(payloads.clone());
    let mut data = vec![0u8; used];
    let mut offset = ChainHeader::SIZE;
    let mut count = 0u32;
    for payload in payloads {
        offset = write_element(&mut data, offset, payload);
        count += 1;
    }
    debug_assert_eq!(offset, used);
    ChainHeader::new(count, used as u32).to_bytes(&mut data);
    data
}

/// Iterator over the element payloads of a stored chain
pub(crate) struct Elements<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for Elements<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        let start = self.offset + ChainHeader::ELEMENT_HEADER_SIZE;
        let len_bytes = self.data.get(self.offset..start)?;
        let len = u32::from_ne_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let end = start + len as usize;
        let payload = self.data.get(start..end)?;
        self.offset = end;
        self.remaining -= 1;
        Some(payload)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// Borrow the element payloads of a stored chain.
///
/// `data` must start with a valid header; the iterator never reads past the
/// header's `used` mark.
pub(crate) fn elements(data: &[u8], header: ChainHeader) -> Elements<'_> {
    Elements {
        data: &data[..header.used()],
        offset: ChainHeader::SIZE,
        remaining: header.count(),
    }
}

/// Materialize a stored chain.
///
/// The used bytes are copied once; every element is a slice of that copy.
pub(crate) fn decode(data: &[u8], header: ChainHeader) -> Chain {
    let copy = Bytes::copy_from_slice(&data[..header.used()]);
    let mut result = Vec::with_capacity(header.count() as usize);
    let mut offset = ChainHeader::SIZE;
    for payload in elements(data, header) {
        let start = offset + ChainHeader::ELEMENT_HEADER_SIZE;
        let end = start + payload.len();
        result.push(Element::new(copy.slice(start..end)));
        offset = end;
    }
    assert_eq!(
        result.len(),
        header.count() as usize,
        "CORRUPTION in decode: header claims {} elements, found {}",
        header.count(),
        result.len()
    );
    Chain::from_elements(result)
}
