//! Serialization properties shared by both router backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::EntityKey;
use journal::InMemoryJournal;
use router::{ActorRouter, KeyedExecutor, KeyedExecutorExt, LeaseOptions, LeaseRouter};

/// Counts operations currently inside the critical section and remembers the
/// highest count seen.
#[derive(Default)]
struct InFlight {
    inside: AtomicUsize,
    max_inside: AtomicUsize,
    runs: AtomicUsize,
}

impl InFlight {
    async fn enter(self: Arc<Self>, hold: Duration) {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(hold).await;
        self.inside.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn max(&self) -> usize {
        self.max_inside.load(Ordering::SeqCst)
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

fn lease_options() -> LeaseOptions {
    LeaseOptions {
        ttl: Duration::from_secs(10),
        acquire_timeout: Duration::from_secs(10),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

async fn run_same_key<E>(routers: Vec<E>, jobs: usize, hold: Duration) -> Arc<InFlight>
where
    E: KeyedExecutor + Clone + 'static,
{
    let in_flight = Arc::new(InFlight::default());
    let key = EntityKey::new("trial/shared");

    let mut handles = Vec::new();
    for i in 0..jobs {
        let router = routers[i % routers.len()].clone();
        let in_flight = Arc::clone(&in_flight);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            router
                .route_serialized(&key, move || in_flight.enter(hold))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    in_flight
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_actor_router_never_overlaps_same_key() {
    let in_flight = run_same_key(vec![ActorRouter::new()], 50, Duration::from_millis(2)).await;
    assert_eq!(in_flight.max(), 1);
    assert_eq!(in_flight.runs(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_router_never_overlaps_same_key_across_instances() {
    let journal = InMemoryJournal::new();
    let instances: Vec<_> = (0..3)
        .map(|i| {
            LeaseRouter::with_owner(journal.clone(), format!("instance-{i}"), lease_options())
        })
        .collect();

    let in_flight = run_same_key(instances, 20, Duration::from_millis(2)).await;
    assert_eq!(in_flight.max(), 1);
    assert_eq!(in_flight.runs(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_outliving_its_ttl_still_excludes_other_instances() {
    let journal = InMemoryJournal::new();
    let options = LeaseOptions {
        ttl: Duration::from_millis(30),
        ..lease_options()
    };
    let instances: Vec<_> = (0..3)
        .map(|i| LeaseRouter::with_owner(journal.clone(), format!("instance-{i}"), options.clone()))
        .collect();

    let in_flight = run_same_key(instances, 6, Duration::from_millis(100)).await;
    assert_eq!(in_flight.max(), 1);
    assert_eq!(in_flight.runs(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_in_parallel() {
    let router = ActorRouter::new();
    let in_flight = Arc::new(InFlight::default());

    let mut handles = Vec::new();
    for i in 0..4 {
        let router = router.clone();
        let in_flight = Arc::clone(&in_flight);
        handles.push(tokio::spawn(async move {
            router
                .route_serialized(&EntityKey::new(format!("trial/{i}")), move || {
                    in_flight.enter(Duration::from_millis(100))
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(in_flight.max() > 1);
    assert_eq!(in_flight.runs(), 4);
}

#[tokio::test]
async fn test_operation_errors_pass_through_unchanged() {
    #[derive(Debug, PartialEq)]
    struct Stale {
        expected: i64,
        actual: i64,
    }

    let routers: Vec<Arc<dyn KeyedExecutor>> = vec![
        Arc::new(ActorRouter::new()),
        Arc::new(LeaseRouter::new(InMemoryJournal::new(), lease_options())),
    ];
    for router in routers {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), Stale> = router
            .route_serialized(&EntityKey::new("trial/1"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Stale {
                    expected: 1,
                    actual: 2,
                })
            })
            .await
            .unwrap();

        assert_eq!(
            result,
            Err(Stale {
                expected: 1,
                actual: 2
            })
        );
        // No retries.
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{}", router.backend());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_key_order_is_total() {
    let router = ActorRouter::new();
    let key = EntityKey::new("trial/ordered");
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..10 {
        let router = router.clone();
        let key = key.clone();
        let log = Arc::clone(&log);
        handles.push(tokio::spawn(async move {
            router
                .route_serialized(&key, move || async move {
                    log.lock().unwrap().push(("start", i));
                    tokio::task::yield_now().await;
                    log.lock().unwrap().push(("end", i));
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let log = log.lock().unwrap();
    for pair in log.chunks(2) {
        assert_eq!(pair[0].0, "start");
        assert_eq!(pair[1], ("end", pair[0].1));
    }
}
