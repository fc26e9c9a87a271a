//! Append-only table of packed node records.
//!
//! The store is the single source of truth for a graph. Records are only ever appended,
//! so an issued [`NodeIndex`] stays valid for the lifetime of the store. Distinct logical
//! functions are simply disjoint (or overlapping) index ranges of the same table; nothing
//! is deduplicated.

use crate::errors::DecodeError;
use crate::node::{Node, NodeIndex, PackedNode, Tag};

/// Growable arena of [`PackedNode`] records.
#[derive(Debug, Clone, Default)]
pub struct NodeStore {
    records: Vec<PackedNode>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reserves one zero-initialized record and returns its index.
    ///
    /// # Panics
    /// Panics once the table holds `u32::MAX` records.
    pub fn allocate(&mut self) -> NodeIndex {
        let index = u32::try_from(self.records.len())
            .ok()
            .filter(|&i| i != u32::MAX)
            .expect("node store exhausted the 32-bit index space");
        self.records.push(PackedNode::zeroed());
        NodeIndex::new(index)
    }

    /// Appends a node and returns its index.
    ///
    /// # Panics
    /// Panics if the node references a child that does not precede it.
    pub fn push(&mut self, node: Node) -> NodeIndex {
        let next = self.records.len();
        for child in node.children() {
            assert!(
                child.as_usize() < next,
                "node {next} references child {child} that was not allocated before it"
            );
        }
        let index = self.allocate();
        self.records[index.as_usize()] = PackedNode::encode(&node);
        index
    }

    /// Decoded view of a record.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn node(&self, index: NodeIndex) -> Node {
        self.record(index).decode()
    }

    /// Raw 10-byte record at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn record(&self, index: NodeIndex) -> &PackedNode {
        &self.records[index.as_usize()]
    }

    /// Mutable access to a record's fields. Changing an operand index to point at or past
    /// the record itself breaks the ordering every backend relies on.
    pub fn record_mut(&mut self, index: NodeIndex) -> &mut PackedNode {
        &mut self.records[index.as_usize()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, Node)> + '_ {
        self.records
            .iter()
            .enumerate()
            .map(|(i, record)| (NodeIndex::new(i as u32), record.decode()))
    }

    /// Serializes the table as concatenated 10 byte records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.records.len() * PackedNode::SIZE);
        for record in &self.records {
            bytes.extend_from_slice(record.as_bytes());
        }
        bytes
    }

    /// Rebuilds a table from [`NodeStore::to_bytes`] output.
    ///
    /// Unknown tags and codes are accepted (they evaluate to NaN); references that do not
    /// point strictly backwards are rejected.
    ///
    /// # Arguments
    /// * `bytes` - Concatenated records, a multiple of 10 bytes long
    ///
    /// # Errors
    /// Returns a [`DecodeError`] if the length is not a whole number of records or a record
    /// references a child at or after its own index.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() % PackedNode::SIZE != 0 {
            return Err(DecodeError::TruncatedRecord {
                len: bytes.len(),
                record_size: PackedNode::SIZE,
            });
        }
        if bytes.len() / PackedNode::SIZE > u32::MAX as usize {
            return Err(DecodeError::TooManyRecords(bytes.len() / PackedNode::SIZE));
        }

        let mut records = Vec::with_capacity(bytes.len() / PackedNode::SIZE);
        for (i, chunk) in bytes.chunks_exact(PackedNode::SIZE).enumerate() {
            let mut raw = [0u8; PackedNode::SIZE];
            raw.copy_from_slice(chunk);
            let record = PackedNode::from_bytes(raw);

            let children = match record.tag() {
                Some(Tag::Operation) => vec![record.lhs(), record.rhs()],
                Some(Tag::Function) => vec![record.argument()],
                _ => Vec::new(),
            };
            if let Some(child) = children.into_iter().find(|c| c.as_usize() >= i) {
                return Err(DecodeError::ForwardReference {
                    index: i as u32,
                    child: child.get(),
                });
            }
            records.push(record);
        }
        Ok(Self { records })
    }
}
