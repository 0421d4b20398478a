//! Persisted, deduplicating queue of pending mutations.
//!
//! One entry per entity id; a second mutation for the same id is merged
//! into the first. The queue is written to the durable store after every
//! change and drained by a debounced flush that backs off exponentially on
//! failure.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, info, warn};

use sanctuary_common::{EntityId, Error, LibraryPatch, ReadingSession, Result};
use sanctuary_storage::QueueStore;

use crate::retry::{Backoff, RetryConfig};
use crate::timer::FlushTimer;

/// A mutation payload that can absorb a later mutation for the same entity.
pub trait Payload: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fold `later` into `self`; fields set in `later` win.
    fn merge(&mut self, later: Self);
}

impl Payload for LibraryPatch {
    fn merge(&mut self, later: Self) {
        LibraryPatch::merge(self, later);
    }
}

impl Payload for ReadingSession {
    fn merge(&mut self, later: Self) {
        *self = later;
    }
}

/// Where one kind of queued mutation is persisted and delivered.
#[async_trait]
pub trait QueueChannel: Send + Sync + 'static {
    /// Payload carried by each queue entry.
    type Payload: Payload;

    /// Short name used in logs.
    fn label(&self) -> &str;

    /// Store key holding the persisted queue.
    fn storage_key(&self) -> &str;

    /// Encode one entry for persistence.
    fn encode(&self, entity_id: &EntityId, payload: &Self::Payload) -> Result<serde_json::Value>;

    /// Decode one persisted entry; `None` skips a malformed entry.
    fn decode(&self, raw: serde_json::Value) -> Option<(EntityId, Self::Payload)>;

    /// Send one entry to the remote store.
    async fn deliver(&self, entity_id: &EntityId, payload: &Self::Payload) -> Result<()>;
}

/// Externally visible queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Nothing is being delivered.
    Idle,
    /// A flush pass is running.
    Syncing,
    /// The last flush pass failed; a retry is scheduled.
    Error,
}

/// A pending mutation for one entity.
#[derive(Debug, Clone)]
pub struct PendingMutation<P> {
    entity_id: EntityId,
    payload: P,
    edit: u64,
}

impl<P> PendingMutation<P> {
    /// Entity the mutation applies to.
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Merged payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }
}

/// Result of one `flush` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every entry in the pass was delivered.
    Drained { delivered: usize },
    /// Delivery stopped at the first failure; a retry is scheduled.
    Failed {
        delivered: usize,
        remaining: usize,
        retry_in: Duration,
    },
    /// Another flush is running; it will make one more pass.
    Coalesced,
    /// The queue has been disposed.
    Disposed,
}

/// Timing for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Quiet period after an enqueue before flushing.
    pub debounce: Duration,
    /// Delay before the first flush of a non-empty rehydrated queue.
    pub init_delay: Duration,
    /// Backoff after failed passes.
    pub retry: RetryConfig,
    /// Deadline for one remote call.
    pub call_timeout: Duration,
}

impl QueueConfig {
    /// Timing for the reading-progress queue.
    pub fn progress() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            init_delay: Duration::from_millis(150),
            retry: RetryConfig::progress_queue(),
            call_timeout: Duration::from_secs(15),
        }
    }

    /// Timing for the reading-session queue.
    pub fn sessions() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            init_delay: Duration::from_millis(200),
            retry: RetryConfig::session_queue(),
            call_timeout: Duration::from_secs(15),
        }
    }

    /// Set the debounce delay.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the backoff configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::progress()
    }
}

struct QueueCore<P> {
    entries: BTreeMap<EntityId, PendingMutation<P>>,
    state: QueueState,
    backoff: Backoff,
    next_edit: u64,
    flushing: bool,
    rerun: bool,
}

struct QueueInner<C: QueueChannel> {
    channel: C,
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    core: Mutex<QueueCore<C::Payload>>,
    hydrated: OnceCell<()>,
    persist_lock: tokio::sync::Mutex<()>,
    timer: FlushTimer,
    state_tx: broadcast::Sender<QueueState>,
}

/// Ordered, deduplicating, persisted mutation queue.
///
/// Cheap to clone; clones share one queue. Construct one per queue kind per
/// app session.
pub struct MutationQueue<C: QueueChannel> {
    inner: Arc<QueueInner<C>>,
}

impl<C: QueueChannel> Clone for MutationQueue<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: QueueChannel> MutationQueue<C> {
    /// Create a queue persisting to `store` and delivering through `channel`.
    pub fn new(channel: C, store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        let backoff = Backoff::new(config.retry.clone());

        Self {
            inner: Arc::new(QueueInner {
                channel,
                store,
                config,
                core: Mutex::new(QueueCore {
                    entries: BTreeMap::new(),
                    state: QueueState::Idle,
                    backoff,
                    next_edit: 0,
                    flushing: false,
                    rerun: false,
                }),
                hydrated: OnceCell::new(),
                persist_lock: tokio::sync::Mutex::new(()),
                timer: FlushTimer::new(),
                state_tx,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, QueueCore<C::Payload>> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn label(&self) -> &str {
        self.inner.channel.label()
    }

    /// Rehydrate from the store and schedule a flush if anything is pending.
    pub async fn init(&self) {
        self.ensure_hydrated().await;
        let pending = self.len();
        if pending > 0 {
            info!("{} queue restored {} pending mutations", self.label(), pending);
            self.schedule(self.inner.config.init_delay);
        }
    }

    /// Merge a mutation into the queue, persist it and schedule a flush.
    ///
    /// Never fails; persistence errors are logged and retried by the next
    /// persist.
    pub async fn enqueue(&self, entity_id: EntityId, payload: C::Payload) {
        self.ensure_hydrated().await;

        {
            let mut core = self.core();
            core.next_edit += 1;
            let edit = core.next_edit;
            match core.entries.get_mut(&entity_id) {
                Some(existing) => {
                    existing.payload.merge(payload);
                    existing.edit = edit;
                }
                None => {
                    core.entries.insert(
                        entity_id.clone(),
                        PendingMutation {
                            entity_id: entity_id.clone(),
                            payload,
                            edit,
                        },
                    );
                }
            }
        }
        debug!("{} queue: enqueued mutation for {}", self.label(), entity_id);

        if let Err(e) = self.persist().await {
            warn!("{} queue: failed to persist: {}", self.label(), e);
        }
        self.schedule(self.inner.config.debounce);
    }

    /// Deliver pending mutations until the queue is empty or a call fails.
    ///
    /// Entries delivered before a failure stay removed. Safe to call at any
    /// time, including while another flush is running.
    pub async fn flush(&self) -> FlushOutcome {
        if self.is_disposed() {
            return FlushOutcome::Disposed;
        }
        self.ensure_hydrated().await;

        {
            let mut core = self.core();
            if core.flushing {
                core.rerun = true;
                debug!("{} queue: flush already running, coalescing", self.label());
                return FlushOutcome::Coalesced;
            }
            core.flushing = true;
        }

        let mut delivered = 0;
        loop {
            let outcome = self.flush_pass().await;
            let mut core = self.core();
            match outcome {
                FlushOutcome::Drained { delivered: n } => {
                    delivered += n;
                    if core.rerun && !self.is_disposed() {
                        core.rerun = false;
                        continue;
                    }
                    core.rerun = false;
                    core.flushing = false;
                    return FlushOutcome::Drained { delivered };
                }
                FlushOutcome::Failed {
                    delivered: n,
                    remaining,
                    retry_in,
                } => {
                    core.rerun = false;
                    core.flushing = false;
                    return FlushOutcome::Failed {
                        delivered: delivered + n,
                        remaining,
                        retry_in,
                    };
                }
                other => {
                    core.flushing = false;
                    return other;
                }
            }
        }
    }

    async fn flush_pass(&self) -> FlushOutcome {
        let snapshot: Vec<(EntityId, C::Payload, u64)> = {
            let core = self.core();
            core.entries
                .values()
                .map(|m| (m.entity_id.clone(), m.payload.clone(), m.edit))
                .collect()
        };

        if snapshot.is_empty() {
            self.set_state(QueueState::Idle);
            if let Err(e) = self.persist().await {
                warn!("{} queue: failed to persist: {}", self.label(), e);
            }
            return FlushOutcome::Drained { delivered: 0 };
        }

        self.set_state(QueueState::Syncing);
        let mut delivered = 0;

        for (entity_id, payload, edit) in snapshot {
            match self.deliver(&entity_id, &payload).await {
                Ok(()) => {
                    {
                        let mut core = self.core();
                        let unchanged = core
                            .entries
                            .get(&entity_id)
                            .is_some_and(|m| m.edit == edit);
                        if unchanged {
                            core.entries.remove(&entity_id);
                        } else {
                            debug!(
                                "{} queue: {} changed while in flight, keeping it queued",
                                self.label(),
                                entity_id
                            );
                        }
                    }
                    delivered += 1;
                    if let Err(e) = self.persist().await {
                        warn!("{} queue: failed to persist: {}", self.label(), e);
                    }
                }
                Err(err) => {
                    let (retry_in, remaining) = {
                        let mut core = self.core();
                        (core.backoff.on_failure(), core.entries.len())
                    };
                    self.set_state(QueueState::Error);
                    warn!(
                        "{} queue: delivery of {} failed: {}. Retrying in {:?}",
                        self.label(),
                        entity_id,
                        err,
                        retry_in
                    );
                    self.schedule(retry_in);
                    return FlushOutcome::Failed {
                        delivered,
                        remaining,
                        retry_in,
                    };
                }
            }
        }

        let remaining = {
            let mut core = self.core();
            core.backoff.reset();
            core.entries.len()
        };
        // Entries merged while in flight wait for the next scheduled pass.
        self.set_state(if remaining == 0 {
            QueueState::Idle
        } else {
            QueueState::Syncing
        });
        debug!(
            "{} queue: delivered {} mutations, {} pending",
            self.label(),
            delivered,
            remaining
        );
        FlushOutcome::Drained { delivered }
    }

    async fn deliver(&self, entity_id: &EntityId, payload: &C::Payload) -> Result<()> {
        let deadline = self.inner.config.call_timeout;
        match tokio::time::timeout(deadline, self.inner.channel.deliver(entity_id, payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    /// Stop scheduling flushes and persist the queue one last time.
    ///
    /// Calls already in flight are left to finish on their own.
    pub async fn dispose(&self) {
        self.inner.timer.stop();
        if let Err(e) = self.persist().await {
            warn!("{} queue: failed to persist on dispose: {}", self.label(), e);
        }
        debug!("{} queue disposed", self.label());
    }

    /// Current state.
    pub fn state(&self) -> QueueState {
        self.core().state
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.core().entries.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids with a pending mutation.
    pub fn pending_ids(&self) -> Vec<EntityId> {
        self.core().entries.keys().cloned().collect()
    }

    /// Copy of every pending entry, ordered by id.
    pub fn snapshot(&self) -> Vec<PendingMutation<C::Payload>> {
        self.core().entries.values().cloned().collect()
    }

    /// Merged payload pending for `entity_id`.
    pub fn pending(&self, entity_id: &str) -> Option<C::Payload> {
        self.core()
            .entries
            .get(entity_id)
            .map(|m| m.payload.clone())
    }

    /// Delay of the scheduled flush, if one is pending.
    pub fn scheduled_delay(&self) -> Option<Duration> {
        self.inner.timer.pending_delay()
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.timer.is_stopped()
    }

    fn set_state(&self, state: QueueState) {
        let changed = {
            let mut core = self.core();
            let changed = core.state != state;
            core.state = state;
            changed
        };
        if changed {
            debug!("{} queue state -> {:?}", self.label(), state);
            let _ = self.inner.state_tx.send(state);
        }
    }

    fn schedule(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.timer.schedule(delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                let queue = MutationQueue { inner };
                queue.flush().await;
            }
        });
    }

    async fn ensure_hydrated(&self) {
        self.inner
            .hydrated
            .get_or_init(|| async {
                if let Err(e) = self.hydrate().await {
                    warn!("{} queue: ignoring persisted queue: {}", self.label(), e);
                }
            })
            .await;
    }

    async fn hydrate(&self) -> Result<()> {
        let key = self.inner.channel.storage_key();
        let Some(bytes) = self.inner.store.get(key).await? else {
            return Ok(());
        };

        let raw: Vec<serde_json::Value> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;

        let mut core = self.core();
        let mut skipped = 0;
        for value in raw {
            match self.inner.channel.decode(value) {
                Some((entity_id, payload)) => {
                    core.next_edit += 1;
                    let edit = core.next_edit;
                    core.entries
                        .entry(entity_id.clone())
                        .or_insert(PendingMutation {
                            entity_id,
                            payload,
                            edit,
                        });
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("{} queue: skipped {} malformed entries", self.label(), skipped);
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        // Serialize writers so an older snapshot never lands after a newer one.
        let _guard = self.inner.persist_lock.lock().await;

        let encoded: Vec<serde_json::Value> = {
            let core = self.core();
            core.entries
                .values()
                .map(|m| self.inner.channel.encode(&m.entity_id, &m.payload))
                .collect::<Result<_>>()?
        };
        let bytes = serde_json::to_vec(&encoded).map_err(|e| Error::Serialization(e.to_string()))?;

        self.inner
            .store
            .set(self.inner.channel.storage_key(), bytes)
            .await
    }
}
