//! Worker-side event pipeline
//!
//! push -> decode -> dedup -> handler (with retry) -> dead letter on
//! terminal failure. Duplicates are dropped before the handler runs, so a
//! handler sees each event at most once per dedup window.

pub mod decoder;

pub use decoder::{ChainEvent, EventDecoder, EventKind, LogClassifier};

use crate::broker::protocol::EventPush;
use crate::client::EventSubscription;
use crate::core::errors::{SidecarError, SidecarResult};
use crate::monitoring::MetricsRegistry;
use crate::resilience::{
    classify_sidecar_error, retry_with_backoff, BackoffPolicy, DeadLetterStore, Deduplicator,
    RetryAttempt, Seen,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Business logic run for each decoded event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ChainEvent) -> SidecarResult<()>;
}

/// What happened to one push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Handled,
    /// Seen inside the dedup window
    Duplicate,
    /// Decoder dropped it
    Ignored,
    /// Could not be decoded
    Malformed,
    /// Handler failed terminally; parked in the dead-letter store
    DeadLettered,
    /// Handler failed terminally and there was nowhere to park it
    Failed,
}

/// Counters since start
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub handled: AtomicU64,
    pub duplicates: AtomicU64,
    pub ignored: AtomicU64,
    pub malformed: AtomicU64,
    pub failed: AtomicU64,
}

impl PipelineStats {
    fn record(&self, outcome: Processed) {
        let counter = match outcome {
            Processed::Handled => &self.handled,
            Processed::Duplicate => &self.duplicates,
            Processed::Ignored => &self.ignored,
            Processed::Malformed => &self.malformed,
            Processed::DeadLettered | Processed::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct EventPipeline {
    decoder: Arc<dyn EventDecoder>,
    handler: Arc<dyn EventHandler>,
    dedup: Arc<Deduplicator>,
    retry: BackoffPolicy,
    dead_letters: Option<DeadLetterStore>,
    metrics: Option<MetricsRegistry>,
    stats: PipelineStats,
}

impl EventPipeline {
    pub fn new(
        decoder: Arc<dyn EventDecoder>,
        handler: Arc<dyn EventHandler>,
        dedup: Arc<Deduplicator>,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            decoder,
            handler,
            dedup,
            retry,
            dead_letters: None,
            metrics: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_dead_letters(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    /// Run one push through the pipeline
    pub async fn process(&self, push: &EventPush) -> Processed {
        let outcome = self.process_inner(push).await;
        self.stats.record(outcome);
        outcome
    }

    async fn process_inner(&self, push: &EventPush) -> Processed {
        let event = match self.decoder.decode(push) {
            Ok(Some(event)) => event,
            Ok(None) => return Processed::Ignored,
            Err(e) => {
                warn!(channel = %push.channel, error = %e, "undecodable event");
                return Processed::Malformed;
            }
        };

        if let Some(key) = event.dedup_key() {
            if self.dedup.check(&key) == Seen::Duplicate {
                debug!(key = %key, "duplicate event dropped");
                if let Some(metrics) = &self.metrics {
                    metrics.resilience().dedup_drops_total.inc();
                }
                return Processed::Duplicate;
            }
        }

        match self.handle_with_retry(&event).await {
            Ok(()) => Processed::Handled,
            Err(e) => self.park(push, &event, &e).await,
        }
    }

    async fn handle_with_retry(&self, event: &ChainEvent) -> SidecarResult<()> {
        let handler = &self.handler;
        retry_with_backoff(
            &self.retry,
            &classify_sidecar_error,
            |a: &RetryAttempt<'_, SidecarError>| {
                warn!(
                    kind = %event.kind,
                    attempt = a.attempt,
                    delay_ms = a.delay.as_millis() as u64,
                    error = %a.error,
                    "event handler failed, retrying"
                );
            },
            || handler.handle(event),
        )
        .await
    }

    async fn park(&self, push: &EventPush, event: &ChainEvent, error: &SidecarError) -> Processed {
        let Some(store) = &self.dead_letters else {
            error!(
                kind = %event.kind,
                channel = %push.channel,
                error = %error,
                "event handler failed"
            );
            return Processed::Failed;
        };

        let payload = match serde_json::to_value(push) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize event for dead letter");
                return Processed::Failed;
            }
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "pipeline".to_string());
        metadata.insert("kind".to_string(), event.kind.to_string());
        if let Some(signature) = &event.signature {
            metadata.insert("signature".to_string(), signature.clone());
        }

        match store.add(payload, error, metadata).await {
            Ok(_) => Processed::DeadLettered,
            Err(store_err) => {
                error!(error = %error, store_error = %store_err, "failed to dead-letter event");
                Processed::Failed
            }
        }
    }

    /// Re-run a dead-lettered event; skips dedup and retry
    pub async fn redrive(&self, payload: serde_json::Value) -> SidecarResult<()> {
        let push: EventPush = serde_json::from_value(payload)?;
        match self.decoder.decode(&push)? {
            Some(event) => self.handler.handle(&event).await,
            None => Ok(()),
        }
    }

    /// Drain a subscription until it ends or `shutdown` flips to true
    pub async fn run(&self, mut events: EventSubscription, mut shutdown: watch::Receiver<bool>) {
        info!(channel = events.channel(), "event pipeline started");
        loop {
            let push = tokio::select! {
                push = events.recv() => match push {
                    Some(push) => push,
                    None => break,
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            self.process(&push).await;
        }
        info!(
            channel = events.channel(),
            handled = self.stats.handled.load(Ordering::Relaxed),
            duplicates = self.stats.duplicates.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "event pipeline stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::DeadLetterConfig;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    const TOKEN: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ChainEvent>>,
        failures_left: AtomicU32,
        permanent: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &ChainEvent) -> SidecarResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(if self.permanent {
                    SidecarError::Protocol("bad event".into())
                } else {
                    SidecarError::Connection("db down".into())
                });
            }
            self.seen.lock().push(event.clone());
            Ok(())
        }
    }

    fn burn(signature: &str) -> EventPush {
        EventPush {
            channel: format!("logs:{}", TOKEN),
            data: json!({
                "context": {"slot": 1},
                "value": {
                    "signature": signature,
                    "err": null,
                    "logs": ["Program log: Instruction: Burn"],
                },
            }),
        }
    }

    fn pipeline(handler: Arc<Recorder>) -> EventPipeline {
        EventPipeline::new(
            Arc::new(LogClassifier::new()),
            handler,
            Arc::new(Deduplicator::new(Duration::from_secs(60))),
            BackoffPolicy {
                base_delay: Duration::from_millis(1),
                jitter_factor: 0.0,
                max_attempts: 3,
                ..BackoffPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn test_duplicate_signature_handled_once() {
        let handler = Arc::new(Recorder::default());
        let metrics = MetricsRegistry::new().unwrap();
        let pipeline = pipeline(handler.clone()).with_metrics(metrics.clone());

        assert_eq!(pipeline.process(&burn("sig1")).await, Processed::Handled);
        assert_eq!(pipeline.process(&burn("sig1")).await, Processed::Duplicate);
        assert_eq!(pipeline.process(&burn("sig2")).await, Processed::Handled);

        assert_eq!(handler.seen.lock().len(), 2);
        assert_eq!(metrics.resilience().dedup_drops_total.get(), 1);
        assert_eq!(pipeline.stats().duplicates.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_transient_handler_failure_is_retried() {
        let handler = Arc::new(Recorder {
            failures_left: AtomicU32::new(2),
            ..Recorder::default()
        });
        let pipeline = pipeline(handler.clone());

        assert_eq!(pipeline.process(&burn("sig1")).await, Processed::Handled);
        assert_eq!(handler.seen.lock()[0].kind, EventKind::TokenBurn);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_lettered_then_redriven() {
        let handler = Arc::new(Recorder {
            failures_left: AtomicU32::new(1),
            permanent: true,
            ..Recorder::default()
        });
        let store = DeadLetterStore::in_memory(DeadLetterConfig::default());
        let pipeline = pipeline(handler.clone()).with_dead_letters(store.clone());

        assert_eq!(pipeline.process(&burn("sig1")).await, Processed::DeadLettered);
        assert!(handler.seen.lock().is_empty());

        let entries = store.recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_class, "protocol");
        assert_eq!(entries[0].metadata["kind"], "token_burn");

        pipeline.redrive(entries[0].original_payload.clone()).await.unwrap();
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_ignored() {
        let handler = Arc::new(Recorder::default());
        let pipeline = pipeline(handler.clone());

        let malformed = EventPush {
            channel: format!("logs:{}", TOKEN),
            data: Value::Null,
        };
        assert_eq!(pipeline.process(&malformed).await, Processed::Malformed);

        let mut failed_tx = burn("sig9");
        failed_tx.data["value"]["err"] = json!({"InstructionError": [0, "Custom"]});
        assert_eq!(pipeline.process(&failed_tx).await, Processed::Ignored);
        assert!(handler.seen.lock().is_empty());
    }
}
