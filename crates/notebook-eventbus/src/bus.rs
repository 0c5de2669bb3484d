use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use notebook_protocol::{DocumentId, EventPublisher, NotebookEvent, NotebookRuntimeResult};
use tokio::sync::broadcast;
use tracing::trace;

use crate::envelope::NotebookEventEnvelope;

pub const DEFAULT_DOCUMENT_BUFFER_CAPACITY: usize = 64;
pub const DEFAULT_GLOBAL_BUFFER_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotebookEventBusConfig {
    pub document_buffer_capacity: usize,
    pub global_buffer_capacity: usize,
}

impl Default for NotebookEventBusConfig {
    fn default() -> Self {
        Self {
            document_buffer_capacity: DEFAULT_DOCUMENT_BUFFER_CAPACITY,
            global_buffer_capacity: DEFAULT_GLOBAL_BUFFER_CAPACITY,
        }
    }
}

/// Broadcast channels keyed by document, plus one channel that sees every
/// event. Publishing never blocks; slow subscribers observe `Lagged`.
///
/// A document's channel is dropped once its last subscriber goes away.
#[derive(Debug)]
pub struct NotebookEventBus {
    next_sequence: AtomicU64,
    config: NotebookEventBusConfig,
    document_senders: RwLock<HashMap<DocumentId, broadcast::Sender<NotebookEventEnvelope>>>,
    global_sender: broadcast::Sender<NotebookEventEnvelope>,
}

impl Default for NotebookEventBus {
    fn default() -> Self {
        Self::new(NotebookEventBusConfig::default())
    }
}

impl NotebookEventBus {
    /// Zero capacities are raised to one.
    pub fn new(config: NotebookEventBusConfig) -> Self {
        let config = NotebookEventBusConfig {
            document_buffer_capacity: config.document_buffer_capacity.max(1),
            global_buffer_capacity: config.global_buffer_capacity.max(1),
        };
        let (global_sender, _global_receiver) = broadcast::channel(config.global_buffer_capacity);
        Self {
            next_sequence: AtomicU64::new(0),
            config,
            document_senders: RwLock::new(HashMap::new()),
            global_sender,
        }
    }

    pub fn subscribe_document(
        &self,
        document_id: DocumentId,
    ) -> broadcast::Receiver<NotebookEventEnvelope> {
        // Subscribing under the write lock keeps pruning from orphaning a new receiver.
        let mut document_senders = self
            .document_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        document_senders.retain(|_, sender| sender.receiver_count() > 0);
        let sender = document_senders.entry(document_id).or_insert_with(|| {
            let (sender, _receiver) = broadcast::channel(self.config.document_buffer_capacity);
            sender
        });
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<NotebookEventEnvelope> {
        self.global_sender.subscribe()
    }

    /// Drops the document's channel, closing its subscribers.
    pub fn remove_document(&self, document_id: &DocumentId) -> bool {
        let mut document_senders = self
            .document_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        document_senders.remove(document_id).is_some()
    }

    /// Documents that currently have a channel.
    pub fn document_count(&self) -> usize {
        self.document_senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn publish_event(&self, event: NotebookEvent) -> NotebookEventEnvelope {
        let envelope = NotebookEventEnvelope {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            event,
        };

        if let Some(sender) = self.document_sender(&envelope.event.object) {
            if sender.receiver_count() > 0 {
                let _ = sender.send(envelope.clone());
            } else {
                self.prune_document(&envelope.event.object);
            }
        }
        if self.global_sender.receiver_count() > 0 {
            let _ = self.global_sender.send(envelope.clone());
        }

        trace!(
            sequence = envelope.sequence,
            event = %envelope.event.event,
            document = %envelope.event.object,
            "published notebook event"
        );
        envelope
    }

    fn prune_document(&self, document_id: &DocumentId) {
        let mut document_senders = self
            .document_senders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let abandoned = document_senders
            .get(document_id)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if abandoned {
            document_senders.remove(document_id);
            trace!(document = %document_id, "dropped unsubscribed document channel");
        }
    }

    fn document_sender(
        &self,
        document_id: &DocumentId,
    ) -> Option<broadcast::Sender<NotebookEventEnvelope>> {
        let document_senders = self
            .document_senders
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        document_senders.get(document_id).cloned()
    }
}

#[async_trait]
impl EventPublisher for NotebookEventBus {
    async fn publish(&self, event: NotebookEvent) -> NotebookRuntimeResult<()> {
        self.publish_event(event);
        Ok(())
    }
}
