//! Stress tests for concurrent slot usage.
//!
//! Many sessions contend for few slots while adapters are mutated underneath
//! them. The mock engine counts overlapping use of a context, so any break in
//! mutual exclusion shows up as a violation.
//!
//! Run the long variants: cargo test --features test-utils --test concurrent_sessions -- --ignored

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use slotserve_core::admission::{Admission, TokenBucket};
use slotserve_core::backend::{ContextParams, SamplingParams, TokenId};
use slotserve_core::lora::{AdapterRegistry, AdapterRegistryConfig, AdapterUpdate};
use slotserve_core::request::{CancelToken, GenerationParams, SessionRequest};
use slotserve_core::slots::{SlotPool, SlotPoolConfig};
use slotserve_core::testing::MockBackend;
use slotserve_core::worker::{
    ClientSession, SessionError, SessionOutcome, SessionSink, WorkerPool, WorkerPoolConfig,
};

// ─── Test infrastructure ────────────────────────────────────────────────────

fn start_pool(
    backend: MockBackend,
    num_slots: usize,
) -> (Arc<MockBackend>, Arc<SlotPool<MockBackend>>) {
    let backend = Arc::new(backend);
    let pool = Arc::new(
        SlotPool::start(
            Arc::clone(&backend),
            &SlotPoolConfig {
                num_slots,
                context: ContextParams {
                    n_ctx: 512,
                    n_batch: 32,
                    n_threads: None,
                },
            },
        )
        .unwrap(),
    );
    (backend, pool)
}

fn request(prompt: Vec<TokenId>, max_tokens: usize) -> SessionRequest {
    SessionRequest::new(
        prompt,
        GenerationParams {
            max_tokens,
            sampling: SamplingParams::greedy(),
            ..Default::default()
        },
    )
}

/// Prompt for conversation `conv` of `client`: a shared system prefix plus a
/// per-conversation tail.
fn prompt_for(client: usize, conv: usize) -> Vec<TokenId> {
    let mut prompt: Vec<TokenId> = (1..=32).collect();
    prompt.extend((0..8).map(|i| (1000 + client * 100 + conv * 10 + i) as TokenId));
    prompt
}

struct ChannelSink {
    tx: mpsc::Sender<Result<SessionOutcome, String>>,
}

impl SessionSink for ChannelSink {
    fn on_token(&mut self, _token: TokenId) -> bool {
        true
    }

    fn on_finish(&mut self, result: Result<SessionOutcome, SessionError>) {
        let _ = self.tx.send(result.map_err(|e| e.to_string()));
    }
}

// ─── Mutual exclusion ───────────────────────────────────────────────────────

#[test]
fn slots_have_at_most_one_owner() {
    let (backend, pool) = start_pool(MockBackend::new(), 4);
    let owners: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let violations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..16)
        .map(|client| {
            let pool = Arc::clone(&pool);
            let owners = Arc::clone(&owners);
            let violations = Arc::clone(&violations);
            thread::spawn(move || {
                for conv in 0..50 {
                    let prompt = prompt_for(client, conv % 3);
                    let mut slot = pool.acquire(&prompt).unwrap();
                    if owners[slot.id()].fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    slot.prefill(&prompt).unwrap();
                    thread::yield_now();
                    owners[slot.id()].fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(backend.exclusion_violations(), 0);
    let stats = pool.stats();
    assert_eq!(stats.idle, 4);
    assert_eq!(stats.waiting, 0);
}

// ─── Sessions through the worker pool ───────────────────────────────────────

#[test]
fn worker_pool_runs_sessions_to_completion() {
    let (backend, pool) = start_pool(MockBackend::new().with_eval_delay(Duration::from_micros(50)), 3);
    let session = ClientSession::new(Arc::clone(&pool), Arc::new(Admission::unlimited()));
    let workers = WorkerPool::start(&WorkerPoolConfig {
        workers: 8,
        queue_depth: 64,
    })
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let total = 40;
    for i in 0..total {
        let session = session.clone();
        let mut sink = ChannelSink { tx: tx.clone() };
        workers
            .submit(move || {
                let request = request(prompt_for(i % 5, i % 2), 4);
                session.run(&request, &CancelToken::new(), &mut sink);
            })
            .unwrap();
    }

    let mut reused = 0;
    for _ in 0..total {
        let outcome = rx
            .recv_timeout(Duration::from_secs(30))
            .unwrap()
            .expect("session failed");
        assert_eq!(outcome.generated.len(), 4);
        reused += outcome.reused_tokens;
    }
    workers.shutdown();

    assert_eq!(backend.exclusion_violations(), 0);
    // The shared system prompt is served from cache for most sessions.
    assert!(reused > 0);
    assert_eq!(pool.stats().idle, 3);
}

// ─── Adapter churn under load ───────────────────────────────────────────────

#[test]
fn adapter_mutations_during_sessions_stay_consistent() {
    let (backend, pool) = start_pool(MockBackend::new(), 3);
    let registry = Arc::new(AdapterRegistry::new(
        Arc::clone(&backend),
        Arc::clone(&pool),
        &AdapterRegistryConfig::default(),
    ));
    let session = ClientSession::new(Arc::clone(&pool), Arc::new(Admission::unlimited()));
    let stop = Arc::new(AtomicBool::new(false));

    let mutator = {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut round = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let path = format!("adapter-{}.gguf", round % 4);
                registry.load(Path::new(&path), 1.0).unwrap();
                registry
                    .apply(&[AdapterUpdate {
                        id: 0,
                        scale: 0.5,
                    }])
                    .unwrap();
                if round % 3 == 2 {
                    registry.clear();
                }
                round += 1;
                thread::sleep(Duration::from_micros(200));
            }
            round
        })
    };

    let clients: Vec<_> = (0..6)
        .map(|client| {
            let session = session.clone();
            thread::spawn(move || {
                for conv in 0..30 {
                    session
                        .execute(&request(prompt_for(client, conv % 2), 3), &CancelToken::new(), |_| true)
                        .unwrap();
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    let rounds = mutator.join().unwrap();
    assert!(rounds > 0);

    assert_eq!(backend.exclusion_violations(), 0);
    registry.clear();
    // Every slot is idle and rebound to the empty set.
    assert_eq!(pool.stats().idle, 3);
    for id in 0..3 {
        assert!(backend.bound_adapters(id).is_empty());
    }
    // One adapter was loaded per round.
    assert_eq!(backend.adapters_freed(), rounds);
    assert!(registry.is_empty());
}

// ─── Shutdown ───────────────────────────────────────────────────────────────

#[test]
fn shutdown_releases_all_waiters() {
    let (_, pool) = start_pool(MockBackend::new(), 1);
    let held = pool.acquire(&[1]).unwrap();
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(&[1]).map(|_| ()).is_err())
        })
        .collect();
    while pool.stats().waiting < 8 {
        thread::sleep(Duration::from_millis(1));
    }
    pool.shutdown();
    for waiter in waiters {
        assert!(waiter.join().unwrap());
    }
    drop(held);
}

// ─── Admission soak ─────────────────────────────────────────────────────────

#[test]
#[ignore]
fn token_bucket_bounds_grants_under_contention() {
    let capacity = 50u32;
    let rate = 200.0;
    let bucket = Arc::new(TokenBucket::new(capacity, rate));
    let granted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let run_for = Duration::from_secs(3);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bucket = Arc::clone(&bucket);
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                while start.elapsed() < run_for {
                    if bucket.try_acquire(1) {
                        granted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let elapsed = start.elapsed().as_secs_f64();
    let bound = f64::from(capacity) + elapsed * rate;
    let granted = granted.load(Ordering::Relaxed) as f64;
    assert!(granted <= bound, "granted {granted} > bound {bound}");
    // The bucket should not starve either.
    assert!(granted >= f64::from(capacity));
}
