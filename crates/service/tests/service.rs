use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stellwerk_command::{CommandError, CommandPolicy, MasterJobPolicy, MasterJobState, RequestContext};
use stellwerk_comms::{ChannelMode, ListenerClient, MemoryFabric};
use stellwerk_core::{
    Dispatcher, MessageFilter, MessageStatus, ServiceMessage, ServiceMessageHeader,
    TransmissionPayload,
};
use stellwerk_service::{serve_statistics, Microservice, ServiceConfig, ServiceError};
use stellwerk_tasks::{Frequency, Schedule};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct CreateOrder {
    sku: String,
    quantity: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u64,
}

fn config(service_id: &str) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.service.name = "test".into();
    config.service.service_id = Some(service_id.into());
    config.tasks.max_concurrent = 4;
    config.tasks.min_concurrent = 1;
    config.tasks.loop_poll_interval_ms = 10;
    config
}

async fn wait_until(what: &str, limit: Duration, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn master_state(service: &Microservice) -> Option<(MasterJobState, Option<String>)> {
    let stats = service.command("coordinator")?.statistics().master_job?;
    Some((stats.state, stats.current_master))
}

#[tokio::test]
async fn local_command_handles_dispatch_without_a_sender() {
    let service = Microservice::new(config("orders-1")).unwrap();
    let orders = service.create_command("orders").unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    orders.register(
        MessageFilter::new("orders", Some("create"), None).unwrap(),
        move |_ctx: RequestContext| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(Vec::new()) }
        },
    );
    service.start().unwrap();

    let header = ServiceMessageHeader::new("orders", "create", None);
    service
        .dispatcher()
        .dispatch(TransmissionPayload::new(ServiceMessage::empty(header, service.identity())));

    wait_until("local processing", Duration::from_secs(5), || {
        service.statistics().routing.processed == 1
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = service.statistics();
    assert_eq!(stats.routing.internal, 1);
    assert_eq!(stats.routing.external, 0);
    assert_eq!(stats.communication.dispatched, 0);
    assert_eq!(stats.communication.undeliverable, 0);

    service.stop().await;
    assert!(!service.is_started());
}

#[tokio::test]
async fn unsupported_request_is_answered_not_supported() {
    let fabric = MemoryFabric::new();
    fabric.declare("web-replies", ChannelMode::Queue);
    let service = Microservice::new(config("orders-1")).unwrap();
    service.register_sender(Arc::new(fabric.sender("out", ["web-replies"])));

    let request = ServiceMessage::empty(
        ServiceMessageHeader::new("orders", "delete", None),
        &stellwerk_core::ServiceIdentity::new("web", "web-1"),
    )
    .with_response_header(ServiceMessageHeader::new("web-replies", "response", None));
    service
        .router()
        .route(TransmissionPayload::new(request.clone()))
        .await
        .unwrap();

    wait_until("reply transmitted", Duration::from_secs(5), || {
        fabric.depth("web-replies") == Some(1)
    })
    .await;
    let replies = fabric
        .listener("inspector", "web-replies", 0)
        .unwrap()
        .poll(10)
        .await
        .unwrap();
    assert_eq!(replies.len(), 1);
    let reply = &replies[0].message;
    assert_eq!(reply.status, Some(MessageStatus::NotSupported));
    assert_eq!(reply.correlation_id(), Some(request.request_id()));
    assert_eq!(service.statistics().routing.not_supported, 1);
}

#[tokio::test]
async fn request_round_trip_between_two_services() {
    let fabric = MemoryFabric::new();
    fabric.declare("orders", ChannelMode::Queue);
    fabric.declare("web-replies", ChannelMode::Queue);

    let orders = Microservice::new(config("orders-1")).unwrap();
    orders
        .create_command("orders")
        .unwrap()
        .register_typed::<CreateOrder, OrderCreated, _, _>(
            MessageFilter::new("orders", Some("create"), None).unwrap(),
            |req: CreateOrder| async move {
                Ok(OrderCreated {
                    order_id: u64::from(req.quantity) * 10,
                })
            },
        );
    orders.register_listener(Arc::new(fabric.listener("orders-in", "orders", 1).unwrap()));
    orders.register_sender(Arc::new(fabric.sender("orders-out", ["web-replies"])));

    let mut web_config = config("web-1");
    web_config.commands.insert(
        "web".into(),
        CommandPolicy {
            outgoing_requests_enabled: true,
            response_channel: Some("web-replies".into()),
            ..Default::default()
        },
    );
    let web = Microservice::new(web_config).unwrap();
    let client = web.create_command("web").unwrap();
    web.register_listener(Arc::new(fabric.listener("web-in", "web-replies", 1).unwrap()));
    web.register_sender(Arc::new(fabric.sender("web-out", ["orders"])));

    orders.start().unwrap();
    web.start().unwrap();

    let created: OrderCreated = tokio::time::timeout(
        Duration::from_secs(10),
        client.request(
            ServiceMessageHeader::new("orders", "create", None),
            &CreateOrder {
                sku: "A-1".into(),
                quantity: 3,
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(created, OrderCreated { order_id: 30 });

    let web_stats = web.statistics();
    assert_eq!(web_stats.routing.external, 1);
    assert_eq!(web_stats.commands[0].outgoing.matched, 1);
    assert_eq!(web_stats.commands[0].outgoing.outstanding, 0);
    wait_until("orders processed", Duration::from_secs(5), || {
        orders.statistics().commands[0].processed == 1
    })
    .await;

    web.stop().await;
    orders.stop().await;
}

fn cluster_peer(fabric: &MemoryFabric, id: &str, job_runs: Arc<AtomicU32>) -> Microservice {
    let mut config = config(id);
    config.commands.insert(
        "coordinator".into(),
        CommandPolicy {
            master_job: MasterJobPolicy {
                enabled: true,
                negotiation_channel: Some("cluster".into()),
                negotiating_poll_min_secs: 1,
                negotiating_poll_max_secs: 1,
                active_poll_min_secs: 1,
                active_poll_max_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let service = Microservice::new(config).unwrap();
    let coordinator = service.create_command("coordinator").unwrap();
    coordinator
        .register_master_job(Schedule::new(
            "count",
            Frequency::Every(Duration::from_millis(100)),
            move |_| {
                job_runs.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        ))
        .unwrap();
    service.register_listener(Arc::new(
        fabric.listener(format!("{id}-cluster"), "cluster", 2).unwrap(),
    ));
    service.register_sender(Arc::new(fabric.sender(format!("{id}-out"), ["cluster"])));
    service
}

#[tokio::test]
async fn late_peers_stand_by_for_the_elected_master() {
    let fabric = MemoryFabric::new();
    fabric.declare("cluster", ChannelMode::Broadcast);

    let first_runs = Arc::new(AtomicU32::new(0));
    let first = cluster_peer(&fabric, "node-1", Arc::clone(&first_runs));
    first.start().unwrap();
    wait_until("first peer to become master", Duration::from_secs(20), || {
        matches!(master_state(&first), Some((MasterJobState::Active, _)))
    })
    .await;

    let late_runs = Arc::new(AtomicU32::new(0));
    let second = cluster_peer(&fabric, "node-2", Arc::clone(&late_runs));
    let third = cluster_peer(&fabric, "node-3", Arc::clone(&late_runs));
    second.start().unwrap();
    third.start().unwrap();

    wait_until("late peers to stand by", Duration::from_secs(20), || {
        [&second, &third].iter().all(|peer| {
            master_state(peer)
                == Some((MasterJobState::Inactive, Some("node-1".to_string())))
        })
    })
    .await;

    assert!(matches!(master_state(&first), Some((MasterJobState::Active, _))));
    wait_until("master job to run", Duration::from_secs(5), || {
        first_runs.load(Ordering::SeqCst) > 0
    })
    .await;
    assert_eq!(late_runs.load(Ordering::SeqCst), 0);

    for peer in [&first, &second, &third] {
        peer.stop().await;
    }
}

#[tokio::test]
async fn commands_added_after_start_are_started() {
    let service = Microservice::new(config("orders-1")).unwrap();
    service.create_command("orders").unwrap();
    service.start().unwrap();
    assert!(matches!(service.start(), Err(ServiceError::AlreadyStarted)));

    let audit = service.create_command("audit").unwrap();
    assert!(audit.is_started());
    assert!(matches!(
        service.create_command("audit"),
        Err(ServiceError::DuplicateCommand(name)) if name == "audit"
    ));

    audit.register(
        MessageFilter::channel("audit").unwrap(),
        |_ctx: RequestContext| async { Ok::<_, CommandError>(Vec::new()) },
    );
    assert!(service.router().supported_channels().contains("audit"));

    service.stop().await;
    assert!(!audit.is_started());
}

#[tokio::test]
async fn statistics_endpoint_serves_json() {
    let service = Arc::new(Microservice::new(config("stats-1")).unwrap());
    service.create_command("orders").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let server = tokio::spawn(serve_statistics(listener, Arc::clone(&service), rx));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /statistics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "{text}");

    let body = text.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["identity"]["service_id"], "stats-1");
    assert_eq!(json["started"], false);
    assert_eq!(json["commands"][0]["name"], "orders");

    tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}
