//! Query lifecycle tracking for an application-thread connection.
//!
//! A query moves through four lists: defined when the application has
//! filled it in, executing once dispatch framed its messages into the
//! send path, executed when the final reply arrived, and completed when
//! the application has consumed the result. The execution itself (frame
//! layout of the keyed and scan protocols) is carried out by the
//! dispatchers registered on the handler table.

use std::collections::VecDeque;

use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::query::ApidQuery;
use parking_lot::Mutex;

/// Position of a query inside the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Defined,
    Executing,
    Executed,
    Completed,
}

/// Handle returned when a query is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

struct TrackedQuery {
    id: QueryId,
    query: ApidQuery,
    state: QueryState,
}

#[derive(Default)]
struct TrackerInner {
    queries: Vec<TrackedQuery>,
    /// Defined queries in submission order, feeding the dispatcher.
    defined_order: VecDeque<QueryId>,
    next_id: u64,
}

/// Per-connection query lists.
#[derive(Default)]
pub struct QueryTracker {
    inner: Mutex<TrackerInner>,
}

impl QueryTracker {
    #[must_use]
    pub fn new() -> QueryTracker {
        QueryTracker::default()
    }

    /// Accepts a fully defined query onto the defined list.
    pub fn define(&self, query: ApidQuery) -> IcResult<QueryId> {
        if !query.is_fully_defined() {
            return Err(IcError::InconsistentData {
                detail: "query is not fully defined",
            });
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = QueryId(inner.next_id);
        inner.queries.push(TrackedQuery {
            id,
            query,
            state: QueryState::Defined,
        });
        inner.defined_order.push_back(id);
        Ok(id)
    }

    /// Takes the oldest defined query for dispatch, moving it to the
    /// executing list.
    pub fn take_for_dispatch(&self) -> Option<(QueryId, ApidQuery)> {
        let mut inner = self.inner.lock();
        let id = inner.defined_order.pop_front()?;
        let tracked = inner.queries.iter_mut().find(|t| t.id == id)?;
        tracked.state = QueryState::Executing;
        Some((id, tracked.query.clone()))
    }

    /// Marks a query's final reply as received.
    pub fn mark_executed(&self, id: QueryId) -> IcResult<()> {
        self.transition(id, QueryState::Executing, QueryState::Executed)
    }

    /// Marks the result as consumed and drops the query.
    pub fn complete(&self, id: QueryId) -> IcResult<()> {
        self.transition(id, QueryState::Executed, QueryState::Completed)?;
        self.inner.lock().queries.retain(|t| t.id != id);
        Ok(())
    }

    fn transition(&self, id: QueryId, from: QueryState, to: QueryState) -> IcResult<()> {
        let mut inner = self.inner.lock();
        let tracked = inner
            .queries
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(IcError::TranslationIndexOutOfBound)?;
        if tracked.state != from {
            return Err(IcError::InconsistentData {
                detail: "query state transition out of order",
            });
        }
        tracked.state = to;
        Ok(())
    }

    /// Current state of a query, `None` once completed and dropped.
    #[must_use]
    pub fn state(&self, id: QueryId) -> Option<QueryState> {
        self.inner
            .lock()
            .queries
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.state)
    }

    /// Queries on each list, as (defined, executing, executed).
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        let count = |state: QueryState| {
            inner
                .queries
                .iter()
                .filter(|t| t.state == state)
                .count()
        };
        (
            count(QueryState::Defined),
            count(QueryState::Executing),
            count(QueryState::Executed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iclaustron_core::query::{FieldRef, ReadLockMode, WriteKind};

    fn defined_query() -> ApidQuery {
        let mut query = ApidQuery::read_key(0, 7, ReadLockMode::ReadCommitted);
        query.key_fields.push(FieldRef {
            field_id: 0,
            buffer_offset: 0,
            null_bit: 0,
        });
        query.fields.push(FieldRef {
            field_id: 1,
            buffer_offset: 2,
            null_bit: 1,
        });
        query
    }

    #[test]
    fn lifecycle_walks_all_four_lists() {
        let tracker = QueryTracker::new();
        let id = tracker.define(defined_query()).unwrap();
        assert_eq!(tracker.state(id), Some(QueryState::Defined));
        assert_eq!(tracker.counts(), (1, 0, 0));

        let (taken, query) = tracker.take_for_dispatch().unwrap();
        assert_eq!(taken, id);
        assert_eq!(query.table_id, 7);
        assert_eq!(tracker.state(id), Some(QueryState::Executing));

        tracker.mark_executed(id).unwrap();
        assert_eq!(tracker.state(id), Some(QueryState::Executed));

        tracker.complete(id).unwrap();
        assert_eq!(tracker.state(id), None);
        assert_eq!(tracker.counts(), (0, 0, 0));
    }

    #[test]
    fn incomplete_query_is_refused() {
        let tracker = QueryTracker::new();
        let bare = ApidQuery::write_key(0, 7, WriteKind::Update);
        assert!(tracker.define(bare).is_err());
    }

    #[test]
    fn out_of_order_transition_is_refused() {
        let tracker = QueryTracker::new();
        let id = tracker.define(defined_query()).unwrap();
        // Executed before dispatch is out of order.
        assert!(tracker.mark_executed(id).is_err());
        // Completing a never-executed query likewise.
        assert!(tracker.complete(id).is_err());
    }

    #[test]
    fn dispatch_order_is_submission_order() {
        let tracker = QueryTracker::new();
        let first = tracker.define(defined_query()).unwrap();
        let second = tracker.define(defined_query()).unwrap();
        assert_eq!(tracker.take_for_dispatch().unwrap().0, first);
        assert_eq!(tracker.take_for_dispatch().unwrap().0, second);
        assert!(tracker.take_for_dispatch().is_none());
    }
}
