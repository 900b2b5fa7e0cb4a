//! Chains and their elements
//!
//! A chain is the write history of one key: an ordered list of immutable
//! byte payloads. Elements are `Bytes` views, so a chain read out of a
//! segment is one contiguous copy sliced into elements, and cloning a chain
//! never copies payload bytes.

use bytes::Bytes;
use std::ops::Deref;

/// One immutable payload within a chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element(Bytes);

impl Element {
    pub fn new(payload: Bytes) -> Self {
        Self(payload)
    }

    /// The payload as a shared byte view
    pub fn payload(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

}

impl Deref for Element {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Element {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Element {
    fn from(payload: Bytes) -> Self {
        Self(payload)
    }
}

impl From<Vec<u8>> for Element {
    fn from(payload: Vec<u8>) -> Self {
        Self(Bytes::from(payload))
    }
}

impl From<&'static [u8]> for Element {
    fn from(payload: &'static [u8]) -> Self {
        Self(Bytes::from_static(payload))
    }
}

impl From<&'static str> for Element {
    fn from(payload: &'static str) -> Self {
        Self(Bytes::from_static(payload.as_bytes()))
    }
}

/// An ordered, immutable sequence of elements.
///
/// Equality is structural: two chains are equal when they hold the same
/// element bytes in the same order. The default value is the empty chain,
/// which is what reading an absent key yields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Chain {
    elements: Vec<Element>,
}

impl Chain {
    /// The chain of an absent key
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a chain from byte buffers, in order.
    ///
    /// Each buffer's readable bytes become one element. Buffers are only
    /// borrowed: the caller's views are cloned (a reference count bump), never
    /// advanced.
    pub fn build<'a, I>(buffers: I) -> Self
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        Self {
            elements: buffers.into_iter().cloned().map(Element).collect(),
        }
    }

    pub(crate) fn from_elements(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    /// Iterate the elements from oldest to newest.
    ///
    /// The iterator borrows the chain and can be recreated any number of times.
    pub fn elements(&self) -> std::slice::Iter<'_, Element> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns true if the first `self.len()` elements of `other` equal this
    /// chain's elements byte for byte. The empty chain prefixes every chain.
    pub fn is_prefix_of(&self, other: &Chain) -> bool {
        other.elements.starts_with(&self.elements)
    }

}

impl FromIterator<Element> for Chain {
    fn from_iter<T: IntoIterator<Item = Element>>(iter: T) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<Element>> for Chain {
    fn from(elements: Vec<Element>) -> Self {
        Self { elements }
    }
}

impl<'a> IntoIterator for &'a Chain {
    type Item = &'a Element;
    type IntoIter = std::slice::Iter<'a, Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}
