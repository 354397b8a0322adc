//! Event delivery to the notification collaborator.
//!
//! The WebSocket fan-out lives outside the core; it binds an [EventSink]
//! implementation here. The pipeline only ever calls sink methods after the
//! corresponding document has been persisted.

use super::ConnectionRecord;
use crate::importer::SessionRecord;

use crossbeam::channel::Sender;

/// Events emitted by the core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A connection was finalized and persisted.
    ConnectionFinalized(Box<ConnectionRecord>),
    /// A session changed state (created, progressed to terminal).
    SessionUpdated(SessionRecord),
    /// A new pattern-set version was published.
    RulesUpdated(u64),
}

/// Receives pipeline events. All methods default to no-ops so
/// implementations bind only what they care about.
pub trait EventSink: Send + Sync {
    fn connection_finalized(&self, _record: &ConnectionRecord) {}
    fn session_updated(&self, _session: &SessionRecord) {}
    fn rules_updated(&self, _version: u64) {}
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {}

/// Forwards events into a crossbeam channel. Sends never block: if the
/// receiver lags, events are dropped rather than stalling finalization.
pub struct ChannelSink {
    tx: Sender<CoreEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<CoreEvent>) -> Self {
        ChannelSink { tx }
    }
}

impl EventSink for ChannelSink {
    fn connection_finalized(&self, record: &ConnectionRecord) {
        if self
            .tx
            .try_send(CoreEvent::ConnectionFinalized(Box::new(record.clone())))
            .is_err()
        {
            log::warn!("Event receiver lagging; dropped connection event");
        }
    }

    fn session_updated(&self, session: &SessionRecord) {
        let _ = self.tx.try_send(CoreEvent::SessionUpdated(session.clone()));
    }

    fn rules_updated(&self, version: u64) {
        let _ = self.tx.try_send(CoreEvent::RulesUpdated(version));
    }
}
