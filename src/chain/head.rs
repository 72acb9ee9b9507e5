//! Chain heads linked to their parents

use super::BlockHeader;

use ethers::types::H256;
use std::sync::Arc;

/// A canonical head and the chain of parents the tracker still holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub parent: Option<Arc<Head>>,
}

impl Head {
    pub fn new(number: u64, hash: H256, parent_hash: H256) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            parent: None,
        }
    }

    /// Builds a head from headers ordered newest first
    pub fn from_headers(headers: &[BlockHeader]) -> Option<Self> {
        let mut parent: Option<Arc<Head>> = None;
        for header in headers.iter().rev() {
            parent = Some(Arc::new(Head {
                number: header.number,
                hash: header.hash,
                parent_hash: header.parent_hash,
                parent,
            }));
        }
        parent.map(|head| Arc::try_unwrap(head).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn iter(&self) -> HeadIter<'_> {
        HeadIter { next: Some(self) }
    }

    /// Number of heads in the chain including this one
    pub fn chain_length(&self) -> u64 {
        self.iter().count() as u64
    }

    /// Oldest head still linked into the chain
    pub fn earliest_in_chain(&self) -> &Head {
        let mut earliest = self;
        for head in self.iter() {
            earliest = head;
        }
        earliest
    }

    pub fn hash_at_height(&self, number: u64) -> Option<H256> {
        self.iter().find(|h| h.number == number).map(|h| h.hash)
    }

    pub fn is_in_chain(&self, hash: H256, number: u64) -> bool {
        self.iter().any(|h| h.hash == hash && h.number == number)
    }
}

pub struct HeadIter<'a> {
    next: Option<&'a Head>,
}

impl<'a> Iterator for HeadIter<'a> {
    type Item = &'a Head;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent.as_deref();
        Some(current)
    }
}
