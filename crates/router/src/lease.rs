//! Cross-instance router backed by leases recorded in the journal.
//!
//! Each key owns a journal stream. Taking the lease means appending a
//! `LeaseAcquired` entry at the stream's current sequence; the journal's
//! sequence check lets exactly one of several racing instances win. The
//! holder re-appends `LeaseAcquired` with the same lease id every third of
//! the TTL while its operation runs, and appends `LeaseReleased` when the
//! operation finishes. A lease whose TTL has passed counts as free, so a
//! crashed holder cannot block its key forever.
//!
//! The operation runs on its own task. If the caller goes away before it
//! finishes, the operation is dropped and the lease released at once.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EntityKey;
use journal::{AppendOptions, Journal, JournalEntry, Sequence, StreamId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ConcurrencyRoutingError, Result};
use crate::executor::{Job, KeyedExecutor, run_guarded};

/// Journal stream type for lease streams.
pub const LEASE_STREAM_TYPE: &str = "KeyLease";

/// Lease records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LeaseEvent {
    LeaseAcquired {
        lease_id: Uuid,
        owner: String,
        expires_at: DateTime<Utc>,
    },
    LeaseReleased {
        lease_id: Uuid,
        owner: String,
    },
}

impl LeaseEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LeaseEvent::LeaseAcquired { .. } => "LeaseAcquired",
            LeaseEvent::LeaseReleased { .. } => "LeaseReleased",
        }
    }

    /// Returns true if this record leaves the key held at `now`.
    fn holds_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            LeaseEvent::LeaseAcquired { expires_at, .. } => *expires_at > now,
            LeaseEvent::LeaseReleased { .. } => false,
        }
    }
}

/// Timing knobs for the lease router.
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// How long a lease stays valid after it was last taken or renewed.
    /// The holder renews it every third of this while its operation runs.
    pub ttl: Duration,
    /// How long `submit` waits for a busy key before giving up.
    pub acquire_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
        }
    }
}

/// A lease this instance holds.
#[derive(Debug, Clone, Copy)]
struct Held {
    lease_id: Uuid,
    sequence: Sequence,
    expires_at: DateTime<Utc>,
}

/// Serializes jobs per key across every instance sharing the journal.
#[derive(Clone)]
pub struct LeaseRouter<J: Journal> {
    journal: J,
    owner: String,
    options: LeaseOptions,
}

impl<J: Journal> LeaseRouter<J> {
    /// Creates a router with a fresh owner identity.
    pub fn new(journal: J, options: LeaseOptions) -> Self {
        Self::with_owner(journal, format!("router-{}", Uuid::new_v4()), options)
    }

    pub fn with_owner(journal: J, owner: impl Into<String>, options: LeaseOptions) -> Self {
        Self {
            journal,
            owner: owner.into(),
            options,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn stream_id(key: &EntityKey) -> StreamId {
        StreamId::derived(LEASE_STREAM_TYPE, key.as_str())
    }

    fn renew_interval(&self) -> Duration {
        self.options.ttl / 3
    }

    /// When a lease taken or renewed now runs out.
    fn expiry(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.options.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Utc::now() + ttl
    }

    fn acquired(&self, lease_id: Uuid, expires_at: DateTime<Utc>) -> LeaseEvent {
        LeaseEvent::LeaseAcquired {
            lease_id,
            owner: self.owner.clone(),
            expires_at,
        }
    }

    /// Reads the latest record of a key's stream and the stream sequence.
    async fn current(&self, stream_id: StreamId) -> Result<(Sequence, Option<LeaseEvent>)> {
        match self.journal.read_last(stream_id).await? {
            Some(entry) => Ok((entry.sequence, Some(entry.decode::<LeaseEvent>()?))),
            None => Ok((Sequence::initial(), None)),
        }
    }

    async fn append(
        &self,
        stream_id: StreamId,
        at: Sequence,
        event: &LeaseEvent,
    ) -> Result<Sequence> {
        let entry = JournalEntry::builder()
            .stream_id(stream_id)
            .stream_type(LEASE_STREAM_TYPE)
            .entry_type(event.event_type())
            .sequence(at.next())
            .payload(event)?
            .build()
            .ok_or_else(|| {
                ConcurrencyRoutingError::Unavailable("incomplete lease record".to_string())
            })?;

        Ok(self
            .journal
            .append(vec![entry], AppendOptions::expect_sequence(at))
            .await?)
    }

    /// Waits until the key is free and takes the lease.
    async fn acquire(&self, key: &EntityKey) -> Result<Held> {
        let stream_id = Self::stream_id(key);
        let started = Instant::now();
        let mut backoff = self.options.initial_backoff;

        loop {
            let (sequence, last) = self.current(stream_id).await?;
            let busy = last.as_ref().is_some_and(|e| e.holds_at(Utc::now()));

            if !busy {
                let lease_id = Uuid::new_v4();
                let expires_at = self.expiry();
                let event = self.acquired(lease_id, expires_at);
                match self.append(stream_id, sequence, &event).await {
                    Ok(sequence) => {
                        metrics::histogram!("router_wait_seconds", "backend" => "lease")
                            .record(started.elapsed().as_secs_f64());
                        return Ok(Held {
                            lease_id,
                            sequence,
                            expires_at,
                        });
                    }
                    Err(ConcurrencyRoutingError::Journal(e)) if e.is_conflict() => {
                        tracing::trace!(%key, "lost lease race");
                    }
                    Err(e) => return Err(e),
                }
            }

            let waited = started.elapsed();
            if waited >= self.options.acquire_timeout {
                return Err(ConcurrencyRoutingError::LeaseTimeout {
                    key: key.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.options.max_backoff);
        }
    }

    /// Extends the lease for as long as it is polled.
    ///
    /// Resolves only once the lease is lost: another owner appended after a
    /// renewal was due, or the journal kept failing until the lease was about
    /// to expire.
    async fn keep_alive(&self, key: &EntityKey, held: &mut Held) -> ConcurrencyRoutingError {
        let stream_id = Self::stream_id(key);
        let interval = self.renew_interval();
        let margin =
            chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());

        loop {
            tokio::time::sleep(interval).await;

            let expires_at = self.expiry();
            let event = self.acquired(held.lease_id, expires_at);
            match self.append(stream_id, held.sequence, &event).await {
                Ok(sequence) => {
                    held.sequence = sequence;
                    held.expires_at = expires_at;
                    tracing::trace!(%key, lease_id = %held.lease_id, "lease renewed");
                }
                Err(ConcurrencyRoutingError::Journal(e)) if e.is_conflict() => {
                    tracing::error!(%key, lease_id = %held.lease_id, "lease taken over while held");
                    return lost(key);
                }
                Err(e) => {
                    if Utc::now() + margin >= held.expires_at {
                        tracing::error!(%key, error = %e, "lease could not be renewed in time");
                        return lost(key);
                    }
                    tracing::warn!(%key, error = %e, "lease renewal failed, retrying");
                }
            }
        }
    }

    async fn release(&self, key: &EntityKey, held: Held) -> Result<()> {
        let stream_id = Self::stream_id(key);
        let event = LeaseEvent::LeaseReleased {
            lease_id: held.lease_id,
            owner: self.owner.clone(),
        };
        let mut at = held.sequence;

        loop {
            match self.append(stream_id, at, &event).await {
                Ok(_) => return Ok(()),
                Err(ConcurrencyRoutingError::Journal(e)) if e.is_conflict() => {
                    // A renewal interrupted after it was recorded moves the
                    // stream past `held` without us seeing the new sequence.
                    let (sequence, last) = self.current(stream_id).await?;
                    match last {
                        Some(LeaseEvent::LeaseAcquired { lease_id, .. })
                            if lease_id == held.lease_id && sequence != at =>
                        {
                            at = sequence;
                        }
                        _ => {
                            tracing::warn!(
                                %key,
                                lease_id = %held.lease_id,
                                "lease expired before release"
                            );
                            return Ok(());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Takes the lease, runs the job while renewing it, and releases it.
    ///
    /// The job is dropped if the lease is lost or if `caller_gone` resolves.
    #[tracing::instrument(skip_all, fields(%key, owner = %self.owner))]
    async fn run_leased(
        &self,
        key: &EntityKey,
        job: Job,
        mut caller_gone: oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut held = self.acquire(key).await?;

        let outcome = {
            let run = run_guarded(key, job);
            let renew = self.keep_alive(key, &mut held);
            tokio::pin!(run, renew);

            tokio::select! {
                biased;
                outcome = &mut run => outcome,
                lost = &mut renew => Err(lost),
                _ = &mut caller_gone => {
                    tracing::warn!(%key, "caller went away, dropping routed operation");
                    Err(ConcurrencyRoutingError::Aborted {
                        key: key.to_string(),
                        reason: "caller went away".to_string(),
                    })
                }
            }
        };
        let released = self.release(key, held).await;

        if let Err(e) = &outcome {
            tracing::error!(%key, error = %e, "routed operation aborted");
        }
        if let Err(e) = &released {
            tracing::warn!(%key, error = %e, "failed to release lease");
        }
        outcome
    }
}

fn lost(key: &EntityKey) -> ConcurrencyRoutingError {
    ConcurrencyRoutingError::Aborted {
        key: key.to_string(),
        reason: "lease lost before the operation finished".to_string(),
    }
}

#[async_trait]
impl<J: Journal + Clone + 'static> KeyedExecutor for LeaseRouter<J> {
    async fn submit(&self, key: &EntityKey, job: Job) -> Result<()> {
        let router = self.clone();
        let owned = key.clone();
        // Dropping this sender tells the task that nobody awaits the result.
        let (_caller, caller_gone) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            router.run_leased(&owned, job, caller_gone).await
        });
        task.await.unwrap_or_else(|e| {
            Err(ConcurrencyRoutingError::Aborted {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
    }

    fn backend(&self) -> &'static str {
        "lease"
    }
}
