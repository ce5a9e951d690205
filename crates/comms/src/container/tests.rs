use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stellwerk_core::{
    Dispatcher, ProcessOptions, ServiceIdentity, ServiceMessage, ServiceMessageHeader,
    TransmissionPayload,
};
use stellwerk_tasks::{ManagedProcess, TaskError, TaskManager, TaskManagerPolicy};
use tokio::sync::{mpsc, Notify};

use super::CommunicationContainer;
use crate::client::{ListenerClient, PayloadProcessor, SenderClient};
use crate::error::CommsError;
use crate::memory::{ChannelMode, MemoryFabric};
use crate::policy::CommunicationPolicy;

fn payload(channel: &str) -> TransmissionPayload {
    let identity = ServiceIdentity::new("test", "test-1");
    TransmissionPayload::new(ServiceMessage::empty(
        ServiceMessageHeader::new(channel, "tick", None),
        &identity,
    ))
}

fn manager(max: usize) -> TaskManager {
    TaskManager::new(TaskManagerPolicy {
        priority_levels: 2,
        max_concurrent: max,
        min_concurrent: 1,
        ..Default::default()
    })
    .unwrap()
}

/// Let spawned trackers run and the loop admit what they queued.
async fn settle(manager: &TaskManager, rounds: usize) {
    for _ in 0..rounds {
        manager.process_once();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }
}

struct Channelled {
    id: String,
    tx: mpsc::UnboundedSender<(String, TransmissionPayload)>,
    channels: Vec<String>,
}

#[async_trait]
impl SenderClient for Channelled {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_channel(&self, channel_id: &str) -> bool {
        self.channels.iter().any(|c| c == channel_id)
    }

    async fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommsError> {
        self.tx
            .send((self.id.clone(), payload))
            .map_err(|e| CommsError::Transport(e.to_string()))
    }
}

struct Counting {
    seen: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl Counting {
    fn new(gate: Option<Arc<Notify>>) -> Arc<Self> {
        Arc::new(Self {
            seen: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate,
        })
    }
}

#[async_trait]
impl PayloadProcessor for Counting {
    async fn process_payload(&self, _payload: TransmissionPayload) -> Result<(), TaskError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Broken {
    polls: Mutex<u32>,
}

#[async_trait]
impl ListenerClient for Broken {
    fn id(&self) -> &str {
        "broken"
    }

    fn channel_id(&self) -> &str {
        "orders"
    }

    async fn poll(&self, _max: usize) -> Result<Vec<TransmissionPayload>, CommsError> {
        *self.polls.lock() += 1;
        Err(CommsError::Transport("connection refused".into()))
    }
}

async fn fabric_with(channel: &str, messages: usize) -> MemoryFabric {
    let fabric = MemoryFabric::new();
    fabric.declare(channel, ChannelMode::Queue);
    let seed = fabric.sender("seed", [channel]);
    for _ in 0..messages {
        seed.transmit(payload(channel)).await.unwrap();
    }
    fabric
}

#[tokio::test]
async fn dispatch_uses_first_sender_supporting_the_channel() {
    let container = CommunicationContainer::new(CommunicationPolicy::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (id, channels) in [("first", vec!["orders"]), ("second", vec!["orders", "billing"])] {
        container.register_sender(Arc::new(Channelled {
            id: id.into(),
            tx: tx.clone(),
            channels: channels.into_iter().map(String::from).collect(),
        }));
    }

    container.dispatch(payload("orders"));
    container.dispatch(payload("billing"));
    let mut routed = Vec::new();
    for _ in 0..2 {
        let (sender, payload) = rx.recv().await.unwrap();
        routed.push((payload.channel_id().to_string(), sender));
    }
    routed.sort();
    assert_eq!(
        routed,
        vec![
            ("billing".to_string(), "second".to_string()),
            ("orders".to_string(), "first".to_string()),
        ]
    );

    container.dispatch(payload("nowhere"));
    container.dispatch(payload("orders").with_options(ProcessOptions::INTERNAL_ONLY));
    let stats = container.statistics();
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.undeliverable, 1);
    assert_eq!(stats.not_routed, 1);
    assert!(container.resolve_sender("nowhere").is_none());
}

#[tokio::test]
async fn direct_transmit_reports_missing_sender() {
    let container = CommunicationContainer::new(CommunicationPolicy::default()).unwrap();
    assert!(matches!(
        container.transmit(payload("orders")).await,
        Err(CommsError::NoSender(_))
    ));
}

#[tokio::test]
async fn polled_payloads_are_processed_within_the_budget() {
    let fabric = fabric_with("orders", 6).await;
    let container = Arc::new(CommunicationContainer::new(CommunicationPolicy::default()).unwrap());
    container.register_listener(Arc::new(fabric.listener("orders-in", "orders", 1).unwrap()));
    let gate = Arc::new(Notify::new());
    let processor = Counting::new(Some(Arc::clone(&gate)));
    container.set_processor(processor.clone());

    let manager = manager(2);
    manager.register_process(Arc::clone(&container) as Arc<dyn ManagedProcess>);

    settle(&manager, 4).await;
    assert_eq!(processor.running.load(Ordering::SeqCst), 2);
    assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
    // Nothing is polled beyond what the budget can admit.
    assert_eq!(fabric.depth("orders"), Some(4));

    for _ in 0..20 {
        gate.notify_waiters();
        settle(&manager, 2).await;
    }
    assert_eq!(processor.seen.load(Ordering::SeqCst), 6);
    assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
    assert_eq!(container.pending_slots(), 0);
    let listener = container.listener_statistics("orders-in").unwrap();
    assert_eq!(listener.received, 6);
    assert!(!listener.polling);
}

#[tokio::test]
async fn failing_listener_stays_in_rotation() {
    let container = Arc::new(CommunicationContainer::new(CommunicationPolicy::default()).unwrap());
    let broken = Arc::new(Broken { polls: Mutex::new(0) });
    container.register_listener(broken.clone());
    container.set_processor(Counting::new(None));

    let manager = manager(4);
    manager.register_process(Arc::clone(&container) as Arc<dyn ManagedProcess>);
    settle(&manager, 3).await;

    assert!(*broken.polls.lock() >= 2);
    let stats = container.listener_statistics("broken").unwrap();
    assert_eq!(stats.poll_errors, u64::from(*broken.polls.lock()));
    assert!(stats.error_rate > 0.0);
    assert_eq!(container.pending_slots(), 0);
    assert!(manager.statistics().failed >= 2);
}

#[tokio::test]
async fn listeners_wait_for_a_processor() {
    let fabric = fabric_with("orders", 1).await;
    let container = Arc::new(CommunicationContainer::new(CommunicationPolicy::default()).unwrap());
    container.register_listener(Arc::new(fabric.listener("orders-in", "orders", 0).unwrap()));
    let manager = manager(4);
    manager.register_process(Arc::clone(&container) as Arc<dyn ManagedProcess>);
    settle(&manager, 2).await;
    assert_eq!(fabric.depth("orders"), Some(1));
}

#[tokio::test]
async fn supported_channels_drive_recalculation() {
    let fabric = MemoryFabric::new();
    fabric.declare("orders", ChannelMode::Queue);
    fabric.declare("audit", ChannelMode::Queue);
    let container = CommunicationContainer::new(CommunicationPolicy::default()).unwrap();
    container.register_listener(Arc::new(fabric.listener("o", "orders", 0).unwrap()));
    container.register_listener(Arc::new(fabric.listener("a", "audit", 0).unwrap()));

    let first = container.recalculate(2);
    assert_eq!(container.collection().len(), 2);
    let old = container.collection();

    container.update_supported_channels(["Orders"]);
    assert!(container.needs_recalculation(tokio::time::Instant::now()));
    let second = container.recalculate(2);
    assert!(second > first);
    assert!(old.is_closed());
    assert_eq!(container.collection().len(), 1);
    assert_eq!(container.collection().take_next(0, 1).unwrap().0.id(), "o");
}

#[tokio::test(start_paused = true)]
async fn collection_is_rebuilt_after_the_interval() {
    let container = CommunicationContainer::new(CommunicationPolicy::default()).unwrap();
    container.recalculate(2);
    assert!(!container.needs_recalculation(tokio::time::Instant::now()));
    tokio::time::advance(Duration::from_secs(601)).await;
    assert!(container.needs_recalculation(tokio::time::Instant::now()));
}
