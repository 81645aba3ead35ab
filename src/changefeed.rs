use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::backend::{Filter, Table};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change notification. `row` is the post-change row for inserts
/// and updates, the removed row for deletes.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: EventKind,
    pub row: Value,
}

/// Fan-out point for change notifications, one broadcast channel per table.
///
/// Subscribers receive every event on their table and filter locally;
/// consumers are expected to respond with a full refetch of the affected
/// view, not an incremental merge.
#[derive(Clone, Default)]
pub struct ChangeFeedHub {
    channels: Arc<DashMap<Table, broadcast::Sender<ChangeEvent>>>,
}

impl ChangeFeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, table: Table) -> broadcast::Sender<ChangeEvent> {
        self.channels
            .entry(table)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, event: ChangeEvent) {
        // Send fails only when nobody is listening.
        let _ = self.sender(event.table).send(event);
    }

    /// Register for changes on `table`, optionally narrowed to rows matching
    /// `filter`. Dropping the returned subscription releases the handler.
    pub fn subscribe(&self, table: Table, filter: Option<Filter>) -> Subscription {
        Subscription {
            filter,
            rx: self.sender(table).subscribe(),
        }
    }

    /// Live receiver count for a table's channel.
    pub fn listener_count(&self, table: Table) -> usize {
        self.channels
            .get(&table)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

pub struct Subscription {
    filter: Option<Filter>,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Next matching event, or `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => {
                    let matched = self
                        .filter
                        .as_ref()
                        .map(|f| f.matches(&ev.row))
                        .unwrap_or(true);
                    if matched {
                        return Some(ev);
                    }
                }
                // A lagged receiver resumes at the oldest retained event;
                // the refetch it triggers covers whatever was skipped.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
