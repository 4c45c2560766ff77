//! In-process router: one actor task per active key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::EntityKey;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ConcurrencyRoutingError, Result};
use crate::executor::{Job, KeyedExecutor, run_guarded};

struct Envelope {
    job: Job,
    queued_at: Instant,
    done: oneshot::Sender<Result<()>>,
}

type Mailboxes = Arc<Mutex<HashMap<EntityKey, mpsc::UnboundedSender<Envelope>>>>;

/// Serializes jobs per key inside one process.
///
/// The first job for a key spawns an actor that drains the key's mailbox one
/// job at a time. An actor that stays idle for `idle_timeout` removes its
/// mailbox and exits, so the map only holds keys with recent traffic.
#[derive(Clone)]
pub struct ActorRouter {
    mailboxes: Mailboxes,
    idle_timeout: Duration,
}

impl Default for ActorRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorRouter {
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::with_idle_timeout(Self::DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    /// Returns the number of keys with a live actor.
    pub fn active_keys(&self) -> usize {
        self.mailboxes.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn enqueue(&self, key: &EntityKey, envelope: Envelope) -> Result<()> {
        let mut mailboxes = self.mailboxes.lock().map_err(|_| {
            ConcurrencyRoutingError::Unavailable("mailbox lock poisoned".to_string())
        })?;

        // Sending while holding the lock keeps an idle actor from retiring
        // between our lookup and our send.
        let envelope = match mailboxes.get(key) {
            Some(sender) => match sender.send(envelope) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        sender
            .send(envelope)
            .map_err(|_| ConcurrencyRoutingError::Unavailable("mailbox closed".to_string()))?;
        mailboxes.insert(key.clone(), sender);
        tokio::spawn(run_actor(
            key.clone(),
            receiver,
            Arc::clone(&self.mailboxes),
            self.idle_timeout,
        ));
        tracing::debug!(%key, "key actor started");
        Ok(())
    }
}

#[async_trait]
impl KeyedExecutor for ActorRouter {
    #[tracing::instrument(skip_all, fields(%key))]
    async fn submit(&self, key: &EntityKey, job: Job) -> Result<()> {
        let (done, finished) = oneshot::channel();
        self.enqueue(
            key,
            Envelope {
                job,
                queued_at: Instant::now(),
                done,
            },
        )?;

        finished.await.map_err(|_| ConcurrencyRoutingError::Aborted {
            key: key.to_string(),
            reason: "key actor stopped".to_string(),
        })?
    }

    fn backend(&self) -> &'static str {
        "actor"
    }
}

async fn run_actor(
    key: EntityKey,
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
    mailboxes: Mailboxes,
    idle_timeout: Duration,
) {
    loop {
        let envelope = match tokio::time::timeout(idle_timeout, receiver.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_) => {
                let Ok(mut map) = mailboxes.lock() else {
                    break;
                };
                match receiver.try_recv() {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        map.remove(&key);
                        tracing::debug!(%key, "key actor retired");
                        break;
                    }
                }
            }
        };

        metrics::histogram!("router_wait_seconds", "backend" => "actor")
            .record(envelope.queued_at.elapsed().as_secs_f64());
        let outcome = run_guarded(&key, envelope.job).await;
        if let Err(e) = &outcome {
            tracing::error!(%key, error = %e, "routed operation aborted");
        }
        let _ = envelope.done.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::KeyedExecutorExt;

    #[tokio::test]
    async fn output_is_returned_unchanged() {
        let router = ActorRouter::new();
        let key = EntityKey::new("trial/1");

        let ok: std::result::Result<u32, String> = router
            .route_serialized(&key, || async { Ok(7) })
            .await
            .unwrap();
        let err: std::result::Result<u32, String> = router
            .route_serialized(&key, || async { Err("stale".to_string()) })
            .await
            .unwrap();

        assert_eq!(ok, Ok(7));
        assert_eq!(err, Err("stale".to_string()));
    }

    #[tokio::test]
    async fn panic_is_reported_and_key_keeps_working() {
        let router = ActorRouter::new();
        let key = EntityKey::new("trial/1");

        let result: Result<()> = router
            .route_serialized(&key, || async { panic!("boom") })
            .await;
        assert!(matches!(
            result,
            Err(ConcurrencyRoutingError::Aborted { ref reason, .. }) if reason.contains("boom")
        ));

        let after = router.route_serialized(&key, || async { 1 }).await.unwrap();
        assert_eq!(after, 1);
    }

    #[tokio::test]
    async fn idle_actor_retires() {
        let router = ActorRouter::with_idle_timeout(Duration::from_millis(20));
        let key = EntityKey::new("trial/1");
        router.route_serialized(&key, || async {}).await.unwrap();
        assert_eq!(router.active_keys(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(router.active_keys(), 0);

        router.route_serialized(&key, || async {}).await.unwrap();
        assert_eq!(router.active_keys(), 1);
    }
}
