use super::cache::AggregationCache;
use super::coordinator::PersistenceCoordinator;
use super::policy::{evaluate, Evaluation};
use super::stats::IngestStats;
use super::types::PersistenceOutcome;
use crate::error::{ErrorClass, IngestError, TransportError, ValidationError};
use crate::layout::PipelineLayout;
use crate::router::TopicRouter;
use crate::telemetry::parse_reading_payload;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the transport task hands to the loop, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message {
        topic: String,
        payload: Bytes,
        received_at: DateTime<Utc>,
    },
    Disconnected(TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
}

pub struct IngestLoop {
    router: TopicRouter,
    layout: PipelineLayout,
    cache: AggregationCache,
    coordinator: PersistenceCoordinator,
    stats: Arc<IngestStats>,
    state: LoopState,
}

impl IngestLoop {
    pub fn new(
        layout: PipelineLayout,
        coordinator: PersistenceCoordinator,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            router: TopicRouter::from_layout(&layout),
            cache: AggregationCache::from_layout(&layout),
            layout,
            coordinator,
            stats,
            state: LoopState::Running,
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.router.topics()
    }

    pub fn cache(&self) -> &AggregationCache {
        &self.cache
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Routes, decodes and caches one message, then evaluates every group it dirtied.
    /// A rejected message leaves the cache exactly as it was.
    pub async fn handle_message(
        &mut self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Vec<PersistenceOutcome>, ValidationError> {
        IngestStats::incr(&self.stats.messages_received);

        let Some(route) = self.router.resolve(topic) else {
            IngestStats::incr(&self.stats.messages_dropped);
            return Err(ValidationError::UnknownTopic {
                topic: topic.to_string(),
            });
        };
        let observation = match parse_reading_payload(topic, payload, received_at) {
            Ok(observation) => observation,
            Err(err) => {
                IngestStats::incr(&self.stats.messages_dropped);
                return Err(err);
            }
        };
        tracing::debug!(
            topic,
            group = %route.group,
            field = %route.field,
            value = observation.value,
            "observation received"
        );

        self.coordinator.log_raw(&observation).await;
        self.cache
            .update(&route.group, &route.field, observation.value, received_at);

        let mut outcomes = Vec::new();
        // A group whose commit failed is only retried once one of its own slots changes again.
        for group_id in self.cache.take_dirty() {
            let Some(spec) = self.layout.group(&group_id) else {
                continue;
            };
            // Re-snapshot per group: an earlier commit in this pass may have cleared slots.
            match evaluate(spec, &self.cache.snapshots(), Utc::now()) {
                Evaluation::Complete(record) => {
                    outcomes.push(self.coordinator.commit(record, &mut self.cache).await);
                }
                Evaluation::Incomplete { missing } => {
                    tracing::trace!(group = %group_id, ?missing, "group incomplete");
                }
                Evaluation::Rejected { column, value } => {
                    tracing::warn!(
                        group = %group_id,
                        column = %column,
                        value,
                        class = ErrorClass::Validation.as_str(),
                        "resolved value cannot be stored; waiting for a new reading"
                    );
                }
            }
        }
        Ok(outcomes)
    }

    /// A rejected message comes back as a validation error; a lost broker as a transport one.
    pub async fn handle_event(&mut self, event: TransportEvent) -> Result<(), IngestError> {
        match event {
            TransportEvent::Message {
                topic,
                payload,
                received_at,
            } => {
                self.handle_message(&topic, &payload, received_at).await?;
                Ok(())
            }
            TransportEvent::Disconnected(err) => Err(err.into()),
        }
    }

    /// Runs until cancelled (Ok) or the transport fails (Err). Cancellation is only observed
    /// between messages, so the message in flight always finishes.
    pub async fn run(
        &mut self,
        mut rx: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                event = rx.recv() => {
                    let Some(event) = event else {
                        break Err(IngestError::from(TransportError::ChannelClosed));
                    };
                    match self.handle_event(event).await {
                        Ok(()) => {}
                        Err(err) if err.class().is_fatal() => break Err(err),
                        Err(IngestError::Validation(err)) => {
                            tracing::warn!(
                                topic = err.topic(),
                                class = err.class().as_str(),
                                reason = %err,
                                "message dropped"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, class = err.class().as_str(), "event skipped");
                        }
                    }
                }
            }
        };

        self.state = LoopState::Stopping;
        rx.close();
        match &result {
            Ok(()) => tracing::info!("ingestion loop stopping"),
            Err(err) => {
                self.stats.record_error(err.to_string());
                tracing::error!(error = %err, class = err.class().as_str(), "ingestion loop failed");
            }
        }
        result
    }

    /// Counters, last save per group and whatever is still cached.
    pub fn log_summary(&self) {
        let stats = self.stats.snapshot();
        tracing::info!(
            state = ?self.state(),
            mqtt_connected = stats.mqtt_connected,
            received = stats.messages_received,
            dropped = stats.messages_dropped,
            committed = stats.records_committed,
            commit_failures = stats.commit_failures,
            backup_failures = stats.backup_failures,
            last_error = stats.last_error.as_deref().unwrap_or(""),
            "session summary"
        );
        for (group_id, group) in self.cache.groups() {
            let cached = group
                .slots()
                .iter()
                .filter_map(|(field, slot)| slot.value.map(|value| format!("{field}={value}")))
                .collect::<Vec<_>>()
                .join(",");
            tracing::info!(
                group = %group_id,
                last_saved = ?group.last_committed_at(),
                cached = %cached,
                "group state at shutdown"
            );
        }
    }
}
