//! End-to-end behavior of the connection registry: takeover, routing and the
//! reconnect state machine, driven with short real timers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use tenant_relay::connection_manager::{
    ClientInfo, ConnectionHandle, ConnectionIo, ConnectionRegistry, RegistryConfig, RegistryEvent,
};
use tenant_relay::queue::{QueueError, QueueItem};
use tenant_relay::tenant::{InMemoryTenantDirectory, SessionRecovery, TenantDirectory, TenantId};
use tenant_relay::websocket::{CloseReason, EventKind};

const GRACE: Duration = Duration::from_millis(50);
const RECOVERY_TIMEOUT: Duration = Duration::from_millis(150);

/// Counts calls; optionally never finishes
struct TestRecovery {
    calls: AtomicUsize,
    hang: bool,
}

impl TestRecovery {
    fn quick() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            hang: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            hang: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionRecovery for TestRecovery {
    async fn recover(&self, _tenant: TenantId) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Reconnects the tenant the first time the registry asks about its session,
/// the way an acceptor running alongside a teardown would.
#[derive(Default)]
struct ReconnectingDirectory {
    registry: OnceLock<Weak<ConnectionRegistry>>,
    reconnected: Mutex<Option<(Arc<ConnectionHandle>, ConnectionIo)>>,
}

impl TenantDirectory for ReconnectingDirectory {
    fn has_live_session(&self, tenant: TenantId) -> bool {
        let mut reconnected = self.reconnected.lock().unwrap();
        if reconnected.is_none() {
            if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
                let (handle, io) = ConnectionHandle::new("192.168.0.11:40001", 16);
                let info = ClientInfo::new(Some(tenant as i64), "192.168.0.11:40001");
                registry.add_connection(handle.clone(), &info).unwrap();
                *reconnected = Some((handle, io));
            }
        }
        true
    }

    fn current_tenant(&self) -> Option<TenantId> {
        None
    }
}

struct Harness {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<InMemoryTenantDirectory>,
    recovery: Arc<TestRecovery>,
}

impl Harness {
    fn new(recovery: Arc<TestRecovery>) -> Self {
        let directory = Arc::new(InMemoryTenantDirectory::default());
        let config = RegistryConfig {
            grace_period: GRACE,
            recovery_timeout: RECOVERY_TIMEOUT,
        };
        let registry = Arc::new(
            ConnectionRegistry::new(config, directory.clone()).with_recovery(recovery.clone()),
        );
        Self {
            registry,
            directory,
            recovery,
        }
    }

    fn connect(&self, tenant: i64) -> (Arc<ConnectionHandle>, ConnectionIo) {
        let (handle, io) = ConnectionHandle::new("192.168.0.10:40000", 16);
        self.registry
            .add_connection(handle.clone(), &ClientInfo::new(Some(tenant), "192.168.0.10:40000"))
            .unwrap();
        (handle, io)
    }
}

/// A tenant never holds a connection and a grace timer at once
fn assert_timer_xor_connection(registry: &ConnectionRegistry, tenant: TenantId) {
    assert!(
        !(registry.has_grace_timer(tenant) && registry.get_connection_by_tenant(tenant).is_some()),
        "tenant {} has a grace timer while connected",
        tenant
    );
}

async fn wait_for_lost(events: &mut broadcast::Receiver<RegistryEvent>, tenant: TenantId) {
    let wait = async {
        loop {
            if let Ok(RegistryEvent::ConnectionLost { tenant: lost }) = events.recv().await {
                if lost == tenant {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("ConnectionLost should be emitted");
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_at_most_one_connection_per_tenant() {
    let harness = Harness::new(TestRecovery::quick());
    let (first, _io1) = harness.connect(7);
    let (second, _io2) = harness.connect(7);
    let (third, _io3) = harness.connect(7);

    assert_eq!(harness.registry.connection_count(), 1);
    assert_eq!(
        harness.registry.get_connection_by_tenant(7).unwrap().id,
        third.id
    );
    assert_eq!(first.close_reason(), Some(CloseReason::Replaced));
    assert_eq!(second.close_reason(), Some(CloseReason::Replaced));
    assert!(!third.is_closed());

    // Teardown of the replaced sockets must not disturb the live one
    harness.registry.connection_closed(&first);
    harness.registry.connection_closed(&second);
    assert!(!harness.registry.has_grace_timer(7));
    assert_eq!(
        harness.registry.get_connection_by_tenant(7).unwrap().id,
        third.id
    );
}

#[tokio::test]
async fn test_three_chunks_then_stream_close() {
    let harness = Harness::new(TestRecovery::quick());
    let _conn = harness.connect(3);
    let queue = harness.registry.create_message_queue("r1");

    for n in 0..3 {
        let frame = json!({ "request_id": "r1", "event_type": "chunk", "data": { "n": n } });
        harness.registry.route_inbound_frame(3, &frame.to_string());
    }
    harness
        .registry
        .route_inbound_frame(3, r#"{"request_id":"r1","event_type":"stream_close"}"#);

    for n in 0..3 {
        match queue.dequeue().await {
            Ok(QueueItem::Event(event)) => {
                assert_eq!(event.kind, EventKind::Chunk);
                assert_eq!(event.payload["data"]["n"], json!(n));
            }
            other => panic!("expected chunk {}, got {:?}", n, other),
        }
    }
    assert_eq!(queue.dequeue().await, Ok(QueueItem::StreamEnd));
    assert_eq!(queue.dequeue().await, Err(QueueError::Closed));
    assert_eq!(queue.dequeue().await, Err(QueueError::Closed));
}

#[tokio::test]
async fn test_interleaved_requests_keep_their_order() {
    let harness = Harness::new(TestRecovery::quick());
    let _conn = harness.connect(1);
    let a = harness.registry.create_message_queue("a");
    let b = harness.registry.create_message_queue("b");

    for n in 0..5 {
        for id in ["a", "b"] {
            let frame = json!({ "request_id": id, "event_type": "chunk", "seq": n });
            harness.registry.route_inbound_frame(1, &frame.to_string());
        }
    }

    for queue in [&a, &b] {
        for n in 0..5 {
            match queue.dequeue().await.unwrap() {
                QueueItem::Event(event) => assert_eq!(event.payload["seq"], json!(n)),
                other => panic!("unexpected item: {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn test_drop_on_miss_creates_nothing() {
    let harness = Harness::new(TestRecovery::quick());
    let _conn = harness.connect(1);

    harness
        .registry
        .route_inbound_frame(1, r#"{"request_id":"ghost","event_type":"chunk"}"#);
    harness
        .registry
        .route_inbound_frame(1, r#"{"request_id":"ghost","event_type":"stream_close"}"#);

    assert!(harness.registry.get_message_queue("ghost").is_none());
    assert_eq!(harness.registry.queue_count(), 0);
}

#[tokio::test]
async fn test_reconnect_within_grace_cancels_loss_handling() {
    let harness = Harness::new(TestRecovery::quick());
    let mut events = harness.registry.subscribe();
    let (first, _io1) = harness.connect(4);
    let queue = harness.registry.create_message_queue("pending");

    harness.registry.connection_closed(&first);
    assert!(harness.registry.has_grace_timer(4));

    let (_second, _io2) = harness.connect(4);
    assert!(!harness.registry.has_grace_timer(4));

    tokio::time::sleep(GRACE * 4).await;

    assert_eq!(harness.recovery.calls(), 0);
    assert!(!queue.is_closed());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, RegistryEvent::ConnectionLost { .. }));
    }
}

#[tokio::test]
async fn test_current_tenant_expiry_closes_all_queues() {
    let harness = Harness::new(TestRecovery::quick());
    harness.directory.set_current(Some(2));
    let (handle, _io) = harness.connect(2);
    let mut events = harness.registry.subscribe();

    let q1 = harness.registry.create_message_queue("q1");
    let q2 = harness.registry.create_message_queue("q2");

    harness.registry.connection_closed(&handle);
    wait_for_lost(&mut events, 2).await;

    assert!(q1.is_closed());
    assert!(q2.is_closed());
    assert_eq!(harness.registry.queue_count(), 0);
    assert_eq!(q1.dequeue().await, Err(QueueError::Closed));
    assert_eq!(harness.recovery.calls(), 1);
}

#[tokio::test]
async fn test_background_tenant_expiry_keeps_queues() {
    let harness = Harness::new(TestRecovery::quick());
    harness.directory.set_current(Some(1));
    let (handle, _io) = harness.connect(5);
    let mut events = harness.registry.subscribe();

    let queue = harness.registry.create_message_queue("bg");

    harness.registry.connection_closed(&handle);
    wait_for_lost(&mut events, 5).await;

    assert!(!queue.is_closed());
    assert_eq!(harness.registry.queue_count(), 1);

    harness
        .registry
        .route_inbound_frame(5, r#"{"request_id":"bg","event_type":"stream_close"}"#);
    assert_eq!(queue.dequeue().await, Ok(QueueItem::StreamEnd));
}

#[tokio::test]
async fn test_recovery_timeout_clears_flag_and_allows_retry() {
    let harness = Harness::new(TestRecovery::hanging());
    let (handle, _io) = harness.connect(6);

    harness.registry.connection_closed(&handle);

    let registry = harness.registry.clone();
    assert!(wait_until(|| registry.is_reconnecting(6)).await);
    assert_eq!(harness.recovery.calls(), 1);

    // Bounded by the recovery timeout
    tokio::time::sleep(RECOVERY_TIMEOUT + GRACE).await;
    assert!(!harness.registry.is_reconnecting(6));

    // A later loss triggers a fresh attempt
    let (handle, _io) = harness.connect(6);
    harness.registry.connection_closed(&handle);
    let recovery = harness.recovery.clone();
    assert!(wait_until(|| recovery.calls() == 2).await);
}

#[tokio::test]
async fn test_queue_close_is_idempotent_across_paths() {
    let harness = Harness::new(TestRecovery::quick());
    let queue = harness.registry.create_message_queue("dup-close");

    harness
        .registry
        .route_inbound_frame(0, r#"{"request_id":"dup-close","event_type":"stream_close"}"#);
    harness
        .registry
        .route_inbound_frame(0, r#"{"request_id":"dup-close","event_type":"stream_close"}"#);

    assert_eq!(queue.dequeue().await, Ok(QueueItem::StreamEnd));
    assert_eq!(queue.dequeue().await, Err(QueueError::Closed));

    assert_eq!(harness.registry.close_all_message_queues(), 1);
    assert!(!harness.registry.remove_message_queue("dup-close"));
    assert!(!queue.close());
    assert_eq!(queue.dequeue().await, Err(QueueError::Closed));
}

#[tokio::test]
async fn test_account_switch_close_skips_grace_period() {
    let harness = Harness::new(TestRecovery::quick());
    let (handle, _io) = harness.connect(8);

    harness.directory.retire(8);
    assert!(harness.registry.close_connection_by_tenant(8));
    harness.registry.connection_closed(&handle);

    tokio::time::sleep(GRACE * 3).await;
    assert!(!harness.registry.has_grace_timer(8));
    assert_eq!(harness.recovery.calls(), 0);
    assert_eq!(harness.registry.stats().pending_grace_periods, 0);
}

#[tokio::test]
async fn test_current_tenant_reconnect_within_grace_closes_queues() {
    let harness = Harness::new(TestRecovery::quick());
    harness.directory.set_current(Some(2));
    let mut events = harness.registry.subscribe();
    let (first, _io1) = harness.connect(2);
    let before_loss = harness.registry.create_message_queue("before-loss");

    harness.registry.connection_closed(&first);
    assert!(harness.registry.has_grace_timer(2));
    let during_grace = harness.registry.create_message_queue("during-grace");
    assert!(!before_loss.is_closed());

    let (_second, _io2) = harness.connect(2);
    assert!(!harness.registry.has_grace_timer(2));
    assert!(before_loss.is_closed());
    assert!(during_grace.is_closed());
    assert_eq!(harness.registry.queue_count(), 0);
    assert_eq!(before_loss.dequeue().await, Err(QueueError::Closed));

    tokio::time::sleep(GRACE * 4).await;
    assert_eq!(harness.recovery.calls(), 0);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, RegistryEvent::ConnectionLost { .. }));
    }
}

#[tokio::test]
async fn test_grace_timer_never_present_while_connected() {
    let harness = Harness::new(TestRecovery::quick());
    let registry = harness.registry.clone();
    let mut events = registry.subscribe();
    const T: TenantId = 9;

    let (a, _io_a) = harness.connect(9);
    assert_timer_xor_connection(&registry, T);
    registry.connection_closed(&a);
    assert_timer_xor_connection(&registry, T);

    let (b, _io_b) = harness.connect(9);
    assert_timer_xor_connection(&registry, T);
    let (c, _io_c) = harness.connect(9);
    assert_timer_xor_connection(&registry, T);

    // The replaced socket's late teardown changes nothing
    registry.connection_closed(&b);
    assert_timer_xor_connection(&registry, T);
    assert_eq!(registry.get_connection_by_tenant(T).unwrap().id, c.id);

    registry.connection_closed(&c);
    assert_timer_xor_connection(&registry, T);
    wait_for_lost(&mut events, T).await;
    assert_timer_xor_connection(&registry, T);

    let (_d, _io_d) = harness.connect(9);
    assert_timer_xor_connection(&registry, T);
    assert!(!registry.has_grace_timer(T));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connect_and_teardown_keep_timer_invariant() {
    let harness = Harness::new(TestRecovery::quick());
    const T: TenantId = 12;

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let registry = harness.registry.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let (handle, _io) = ConnectionHandle::new("192.168.0.20:40000", 4);
                    let info = ClientInfo::new(Some(12), "192.168.0.20:40000");
                    registry.add_connection(handle.clone(), &info).unwrap();
                    tokio::task::yield_now().await;
                    registry.connection_closed(&handle);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_timer_xor_connection(&harness.registry, T);

    let (last, _io) = harness.connect(12);
    assert!(!harness.registry.has_grace_timer(T));

    tokio::time::sleep(GRACE * 4).await;
    assert_eq!(harness.registry.get_connection_by_tenant(T).unwrap().id, last.id);
    assert!(!harness.registry.has_grace_timer(T));
}

#[tokio::test]
async fn test_reconnect_during_teardown_leaves_no_timer() {
    let recovery = TestRecovery::quick();
    let directory = Arc::new(ReconnectingDirectory::default());
    let config = RegistryConfig {
        grace_period: GRACE,
        recovery_timeout: RECOVERY_TIMEOUT,
    };
    let registry = Arc::new(
        ConnectionRegistry::new(config, directory.clone()).with_recovery(recovery.clone()),
    );
    directory.registry.set(Arc::downgrade(&registry)).unwrap();
    let mut events = registry.subscribe();

    let (old, _io) = ConnectionHandle::new("192.168.0.10:40000", 16);
    registry
        .add_connection(old.clone(), &ClientInfo::new(Some(1), "192.168.0.10:40000"))
        .unwrap();
    let queue = registry.create_message_queue("live");

    registry.connection_closed(&old);

    let reconnected = directory.reconnected.lock().unwrap().as_ref().map(|(h, _)| h.id);
    assert!(reconnected.is_some());
    assert_eq!(registry.get_connection_by_tenant(1).map(|h| h.id), reconnected);
    assert!(!registry.has_grace_timer(1));
    assert_eq!(old.close_reason(), Some(CloseReason::Replaced));

    tokio::time::sleep(GRACE * 4).await;

    assert_eq!(recovery.calls(), 0);
    assert!(!queue.is_closed());
    assert_eq!(registry.get_connection_by_tenant(1).map(|h| h.id), reconnected);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, RegistryEvent::ConnectionLost { .. }));
    }
}
