//! Deduplication and coalescing of claimed events.
//!
//! All events of one entity in a batch fold into at most one index operation:
//!
//! | state \ next | Add    | Update | Delete |
//! |--------------|--------|--------|--------|
//! | (none)       | Add    | Update | Delete |
//! | Add          | Add    | Add    | (none) |
//! | Update       | Update | Update | Delete |
//! | Delete       | Update | Update | Delete |
//!
//! `UpdateBecauseOfAssociatedDelete` folds as `Update`. An update arriving
//! after a delete is treated as a resurrection: the index writer is asked for
//! the entity's current state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::outbox::{Batch, EntityRef, EventId, OperationKind, OutboxEvent};

/// Net operation sent to an index backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexAction {
    Add,
    Update,
    Delete,
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexAction::Add => write!(f, "add"),
            IndexAction::Update => write!(f, "update"),
            IndexAction::Delete => write!(f, "delete"),
        }
    }
}

/// Fold one more event into an entity's running state.
pub fn merge(state: Option<IndexAction>, next: OperationKind) -> Option<IndexAction> {
    use IndexAction::*;

    let next = match next {
        OperationKind::Add => Add,
        OperationKind::Update | OperationKind::UpdateBecauseOfAssociatedDelete => Update,
        OperationKind::Delete => Delete,
    };

    match (state, next) {
        (None, next) => Some(next),
        (Some(Add), Add | Update) => Some(Add),
        (Some(Add), Delete) => None,
        (Some(Update), Add | Update) => Some(Update),
        (Some(Update), Delete) => Some(Delete),
        (Some(Delete), Add | Update) => Some(Update),
        (Some(Delete), Delete) => Some(Delete),
    }
}

/// The net effect of all events of one entity in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescedOperation {
    pub entity: EntityRef,
    pub action: IndexAction,
    /// Routing key of the latest event that carried one.
    pub routing_key: Option<String>,
    /// Every event folded into this operation, in sequence order.
    pub source_events: Vec<EventId>,
    /// Highest retry count among the source events.
    pub max_retry_count: u32,
    /// Batch position of the group's last event.
    pub last_position: usize,
}

/// Coalescing result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coalesced {
    /// Ordered by `last_position`.
    pub operations: Vec<CoalescedOperation>,
    /// Events whose group folded to nothing. They count as processed.
    pub cancelled: Vec<EventId>,
}

impl Coalesced {
    pub fn event_count(&self) -> usize {
        self.operations.iter().map(|op| op.source_events.len()).sum::<usize>() + self.cancelled.len()
    }
}

struct Group {
    entity: EntityRef,
    state: Option<IndexAction>,
    routing_key: Option<String>,
    events: Vec<EventId>,
    max_retry_count: u32,
    last_position: usize,
}

/// Coalesce a batch.
pub fn coalesce(batch: &Batch) -> Coalesced {
    coalesce_events(&batch.events)
}

/// Coalesce events given in batch order.
pub fn coalesce_events(events: &[OutboxEvent]) -> Coalesced {
    let mut index: HashMap<&EntityRef, usize> = HashMap::with_capacity(events.len());
    let mut groups: Vec<Group> = Vec::new();

    for (position, event) in events.iter().enumerate() {
        let slot = *index.entry(&event.entity).or_insert_with(|| {
            groups.push(Group {
                entity: event.entity.clone(),
                state: None,
                routing_key: None,
                events: Vec::new(),
                max_retry_count: 0,
                last_position: position,
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        group.state = merge(group.state, event.kind);
        if event.routing_key.is_some() {
            group.routing_key = event.routing_key.clone();
        }
        group.events.push(event.id);
        group.max_retry_count = group.max_retry_count.max(event.retry_count);
        group.last_position = position;
    }

    groups.sort_by_key(|g| g.last_position);

    let mut result = Coalesced::default();
    for group in groups {
        match group.state {
            Some(action) => result.operations.push(CoalescedOperation {
                entity: group.entity,
                action,
                routing_key: group.routing_key,
                source_events: group.events,
                max_retry_count: group.max_retry_count,
                last_position: group.last_position,
            }),
            None => result.cancelled.extend(group.events),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{AgentId, ShardId};
    use crate::outbox::EventStatus;
    use chrono::Utc;

    fn event(seq: i64, entity_id: &str, kind: OperationKind) -> OutboxEvent {
        OutboxEvent {
            id: EventId(seq),
            shard: ShardId(0),
            entity: EntityRef::new("Book", entity_id),
            kind,
            routing_key: None,
            created_at: Utc::now(),
            status: EventStatus::Claimed,
            retry_count: 0,
            not_before: None,
            claim: None,
            last_error: None,
        }
    }

    fn fold(kinds: &[OperationKind]) -> Option<IndexAction> {
        kinds.iter().fold(None, |state, kind| merge(state, *kind))
    }

    #[test]
    fn test_merge_table() {
        use OperationKind::*;
        assert_eq!(fold(&[Add, Add]), Some(IndexAction::Add));
        assert_eq!(fold(&[Add, Update]), Some(IndexAction::Add));
        assert_eq!(fold(&[Add, Delete]), None);
        assert_eq!(fold(&[Update, Update]), Some(IndexAction::Update));
        assert_eq!(fold(&[Update, Delete]), Some(IndexAction::Delete));
        assert_eq!(fold(&[Delete, Add]), Some(IndexAction::Update));
        assert_eq!(fold(&[Delete, Delete]), Some(IndexAction::Delete));
        assert_eq!(fold(&[Delete, Update]), Some(IndexAction::Update));
        assert_eq!(fold(&[Update, Add]), Some(IndexAction::Update));
        assert_eq!(fold(&[Delete, UpdateBecauseOfAssociatedDelete]), Some(IndexAction::Update));
    }

    #[test]
    fn test_add_update_delete_cancels_out() {
        let events = vec![
            event(1, "42", OperationKind::Add),
            event(2, "42", OperationKind::Update),
            event(3, "42", OperationKind::Delete),
        ];
        let result = coalesce_events(&events);
        assert!(result.operations.is_empty());
        assert_eq!(result.cancelled, vec![EventId(1), EventId(2), EventId(3)]);
    }

    #[test]
    fn test_cancelled_group_can_be_revived() {
        let events = vec![
            event(1, "42", OperationKind::Add),
            event(2, "42", OperationKind::Delete),
            event(3, "42", OperationKind::Add),
        ];
        let result = coalesce_events(&events);
        assert_eq!(result.operations.len(), 1);
        assert_eq!(result.operations[0].action, IndexAction::Add);
        assert_eq!(result.operations[0].source_events.len(), 3);
    }

    #[test]
    fn test_ordered_by_last_event_position() {
        let events = vec![
            event(1, "a", OperationKind::Update),
            event(2, "b", OperationKind::Update),
            event(3, "a", OperationKind::Update),
            event(4, "c", OperationKind::Delete),
        ];
        let result = coalesce_events(&events);
        let order: Vec<&str> = result
            .operations
            .iter()
            .map(|op| op.entity.entity_id.as_str())
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(result.operations[1].source_events, vec![EventId(1), EventId(3)]);
        assert_eq!(result.event_count(), 4);
    }

    #[test]
    fn test_keeps_latest_routing_key_and_max_retry() {
        let mut first = event(1, "a", OperationKind::Add);
        first.routing_key = Some("old".into());
        first.retry_count = 3;
        let mut second = event(2, "a", OperationKind::Update);
        second.routing_key = Some("new".into());
        let third = event(3, "a", OperationKind::Update);

        let batch = Batch {
            agent: AgentId::new(),
            events: vec![first, second, third],
        };
        let result = coalesce(&batch);
        assert_eq!(result.operations[0].routing_key.as_deref(), Some("new"));
        assert_eq!(result.operations[0].max_retry_count, 3);
    }
}
