//! Public shape of the data-layer query objects.
//!
//! A query is defined against an application-thread connection, queued
//! toward a peer, and driven to completion by reply handlers. Only the
//! value model lives here; dispatch and cursor logic belong to the
//! runtime layer.

use serde::{Deserialize, Serialize};

use crate::types::{ClusterId, NodeId};

/// Lock taken by a keyed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadLockMode {
    ReadCommitted,
    Shared,
    Exclusive,
}

/// The kinds of keyed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    /// Insert or overwrite.
    Write,
    Delete,
}

/// One field read or written by a query, referencing the user buffer by
/// offset rather than by pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub field_id: u32,
    /// Offset of the value inside the user-supplied buffer, in words.
    pub buffer_offset: u32,
    /// Bit position of the field's null indicator.
    pub null_bit: u32,
}

/// Comparator of a where-condition leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A pushed-down filter evaluated by the data server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhereCondition {
    Compare {
        field_id: u32,
        comparator: Comparator,
        /// Constant operand, already encoded into words.
        operand: Vec<u32>,
    },
    And(Vec<WhereCondition>),
    Or(Vec<WhereCondition>),
    Not(Box<WhereCondition>),
}

/// Bound of a scan range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeBound {
    Unbounded,
    Inclusive(Vec<u32>),
    Exclusive(Vec<u32>),
}

/// One key range of an ordered scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCondition {
    pub index_id: u32,
    pub lower: RangeBound,
    pub upper: RangeBound,
}

/// The three query kinds, as a tagged variant rather than an overlapping
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    ReadKey {
        lock_mode: ReadLockMode,
    },
    WriteKey {
        write_kind: WriteKind,
    },
    Scan {
        ranges: Vec<RangeCondition>,
        /// Rows fetched per scan batch.
        batch_size: u32,
    },
}

/// A fully defined query, ready for queueing toward its cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApidQuery {
    pub cluster_id: ClusterId,
    /// Peer the query is dispatched to; zero lets the router choose.
    pub node_id: NodeId,
    pub table_id: u32,
    pub kind: QueryKind,
    pub fields: Vec<FieldRef>,
    pub key_fields: Vec<FieldRef>,
    pub where_condition: Option<WhereCondition>,
    /// Opaque value handed back with every result of this query.
    pub user_reference: u64,
}

impl ApidQuery {
    /// A keyed read of the given fields.
    #[must_use]
    pub fn read_key(
        cluster_id: ClusterId,
        table_id: u32,
        lock_mode: ReadLockMode,
    ) -> ApidQuery {
        ApidQuery {
            cluster_id,
            node_id: 0,
            table_id,
            kind: QueryKind::ReadKey { lock_mode },
            fields: Vec::new(),
            key_fields: Vec::new(),
            where_condition: None,
            user_reference: 0,
        }
    }

    /// A keyed write.
    #[must_use]
    pub fn write_key(cluster_id: ClusterId, table_id: u32, write_kind: WriteKind) -> ApidQuery {
        ApidQuery {
            cluster_id,
            node_id: 0,
            table_id,
            kind: QueryKind::WriteKey { write_kind },
            fields: Vec::new(),
            key_fields: Vec::new(),
            where_condition: None,
            user_reference: 0,
        }
    }

    /// An ordered scan over the given ranges.
    #[must_use]
    pub fn scan(
        cluster_id: ClusterId,
        table_id: u32,
        ranges: Vec<RangeCondition>,
        batch_size: u32,
    ) -> ApidQuery {
        ApidQuery {
            cluster_id,
            node_id: 0,
            table_id,
            kind: QueryKind::Scan { ranges, batch_size },
            fields: Vec::new(),
            key_fields: Vec::new(),
            where_condition: None,
            user_reference: 0,
        }
    }

    /// True when the query carries everything its kind requires: reads
    /// and writes need key fields, scans need at least one range.
    #[must_use]
    pub fn is_fully_defined(&self) -> bool {
        match &self.kind {
            QueryKind::ReadKey { .. } => !self.key_fields.is_empty() && !self.fields.is_empty(),
            QueryKind::WriteKey { write_kind } => {
                !self.key_fields.is_empty()
                    && (*write_kind == WriteKind::Delete || !self.fields.is_empty())
            }
            QueryKind::Scan { ranges, .. } => !ranges.is_empty() && !self.fields.is_empty(),
        }
    }
}
