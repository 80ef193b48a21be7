//! Concurrency invariants under load.

mod common;

use async_trait::async_trait;
use common::{connection, ScriptedTransport};
use corral_core::domain::DomainTuning;
use corral_core::queue::DomainResolver;
use corral_core::{
    AgentJobKind, AsyncJobKind, ChannelKind, Domain, DomainDef, DomainRef, Event, EventHandler,
    EventKind, EventQueue, JobKind, JobOperation, JobOutcome, Result,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cheap deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Counts holders of one lane and fails the test on overlap.
#[derive(Default)]
struct Lane(AtomicI64);

impl Lane {
    fn enter(&self) {
        let before = self.0.fetch_add(1, Ordering::SeqCst);
        assert_eq!(before, 0, "two holders in the same lane");
    }

    fn leave(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Lanes {
    normal: Lane,
    async_job: Lane,
    agent: Lane,
}

async fn running_domain() -> (Arc<Domain>, Arc<ScriptedTransport>) {
    let tuning = DomainTuning {
        job_wait_timeout: Duration::from_secs(60),
        rpc_timeout: Duration::from_secs(5),
    };
    let domain = Domain::new(DomainDef::new("stress"), true, tuning, None);
    let monitor = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(1)));
    let agent = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(1)));
    {
        let mut guard = domain.lock().await;
        connection(Arc::clone(&monitor)).0.attach(&mut guard, ChannelKind::Monitor);
        connection(agent).0.attach(&mut guard, ChannelKind::Agent);
    }
    (domain, monitor)
}

async fn worker(domain: Arc<Domain>, lanes: Arc<Lanes>, seed: u64, rounds: usize) {
    let mut rng = Lcg(seed);
    for _ in 0..rounds {
        match rng.next() % 4 {
            0 | 1 => {
                let kind = if rng.next() % 2 == 0 { JobKind::Query } else { JobKind::Modify };
                let (guard, job) = domain.begin_job(kind).await.unwrap();
                lanes.normal.enter();
                let (guard, reply) = guard.monitor_call(&job, "query-status", json!({})).await;
                reply.unwrap();
                drop(guard);
                tokio::task::yield_now().await;
                let mut guard = domain.lock().await;
                lanes.normal.leave();
                guard.end_job(job);
            }
            2 => {
                let Ok((guard, job)) = domain
                    .begin_async_job(AsyncJobKind::Snapshot, JobOperation::Snapshot)
                    .await
                else {
                    // Another async job is active: rejected without waiting.
                    continue;
                };
                lanes.async_job.enter();
                let (guard, reply) = guard.async_monitor_call(&job, "query-status", json!({})).await;
                reply.unwrap();
                drop(guard);
                tokio::time::sleep(Duration::from_millis(rng.next() % 3)).await;
                let mut guard = domain.lock().await;
                lanes.async_job.leave();
                guard.end_async_job(job, JobOutcome::Completed);
            }
            _ => {
                let (guard, job) = domain.begin_agent_job(AgentJobKind::Query).await.unwrap();
                lanes.agent.enter();
                let mut session = guard.enter_agent(&job).await.map_err(|(_, e)| e).unwrap();
                session.call("guest-ping", json!({})).await.unwrap();
                let mut guard = session.exit().await;
                lanes.agent.leave();
                guard.end_agent_job(job);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lanes_never_overlap() {
    let (domain, monitor) = running_domain().await;
    let lanes = Arc::new(Lanes::default());

    let tasks: Vec<_> = (0..8)
        .map(|i| tokio::spawn(worker(Arc::clone(&domain), Arc::clone(&lanes), 17 + i, 60)))
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let stats = domain.stats();
    assert_eq!(stats.normal_active(), 0);
    assert_eq!(stats.async_active(), 0);
    assert_eq!(stats.agent_active(), 0);
    assert_eq!(stats.busy(), stats.busy_rejections.load(Ordering::Relaxed));

    let snap = domain.snapshot();
    assert!(snap.normal_job.is_none() && snap.async_job.is_none() && snap.agent_job.is_none());
    assert_eq!(snap.waiting, 0);
    assert!(snap.monitor_busy_since.is_none());
    assert!(!monitor.calls().is_empty());
}

// ============================================================================
// Event ordering
// ============================================================================

struct Fixed(Arc<Domain>);

#[async_trait]
impl DomainResolver for Fixed {
    async fn resolve(&self, _domain: &DomainRef) -> Option<Arc<Domain>> {
        Some(Arc::clone(&self.0))
    }
}

struct Recorder {
    seen: Mutex<Vec<(u64, String)>>,
    busy: AtomicBool,
    rng: Mutex<Lcg>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, _domain: Arc<Domain>, event: Event) -> Result<()> {
        assert!(!self.busy.swap(true, Ordering::SeqCst), "handlers overlapped");
        let delay = self.rng.lock().unwrap().next() % 5;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let EventKind::DeviceDeleted { alias } = event.kind else {
            panic!("unexpected event");
        };
        self.seen.lock().unwrap().push((event.seq, alias));
        self.busy.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_events_processed_in_submission_order() {
    let domain = Domain::new(DomainDef::new("ordered"), true, DomainTuning::default(), None);
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
        busy: AtomicBool::new(false),
        rng: Mutex::new(Lcg(99)),
    });
    let queue = EventQueue::start(8, Arc::new(Fixed(Arc::clone(&domain))), recorder.clone());
    let submitter = queue.submitter();

    for i in 0..100 {
        let kind = EventKind::DeviceDeleted {
            alias: format!("dev{i}"),
        };
        submitter
            .submit(Event::new(domain.reference().clone(), kind))
            .await
            .unwrap();
    }
    queue.shutdown().await;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 100);
    for (i, (seq, alias)) in seen.iter().enumerate() {
        assert_eq!(*seq, i as u64 + 1);
        assert_eq!(alias, &format!("dev{i}"));
    }
    assert_eq!(queue.stats().handled.load(Ordering::Relaxed), 100);
}
