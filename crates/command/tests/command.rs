use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stellwerk_command::{
    Command, CommandError, CommandEvent, CommandPolicy, Handler, MasterJobPolicy, MasterJobState,
    RequestContext,
};
use stellwerk_core::{
    Dispatcher, MessageFilter, MessageStatus, ProcessOptions, ServiceIdentity, ServiceMessage,
    ServiceMessageHeader, TransmissionPayload,
};
use stellwerk_tasks::{Schedule, SchedulerContainer, Frequency};

#[derive(Default)]
struct Recording {
    sent: Mutex<Vec<TransmissionPayload>>,
}

impl Recording {
    fn take(&self) -> Vec<TransmissionPayload> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Dispatcher for Recording {
    fn dispatch(&self, payload: TransmissionPayload) {
        self.sent.lock().push(payload);
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct CreateOrder {
    sku: String,
    quantity: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: u64,
}

fn caller() -> ServiceIdentity {
    ServiceIdentity::new("web", "web-1")
}

fn request(channel: &str, message_type: &str) -> TransmissionPayload {
    let header = ServiceMessageHeader::new(channel, message_type, None);
    TransmissionPayload::new(ServiceMessage::empty(header, &caller()))
}

fn start(command: &Command) -> (Arc<Recording>, Arc<SchedulerContainer>) {
    let dispatcher = Arc::new(Recording::default());
    let scheduler = Arc::new(SchedulerContainer::new());
    command
        .start(
            dispatcher.clone(),
            Arc::clone(&scheduler),
            ServiceIdentity::new("orders", "orders-1"),
        )
        .unwrap();
    (dispatcher, scheduler)
}

fn with_outgoing() -> CommandPolicy {
    CommandPolicy {
        outgoing_requests_enabled: true,
        response_channel: Some("orders-replies".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn matching_handler_runs_once_and_unknown_is_not_supported() {
    let command = Command::new("orders", CommandPolicy::default()).unwrap();
    let calls = Arc::new(Mutex::new(0u32));
    let c = Arc::clone(&calls);
    command.register(
        MessageFilter::new("orders", Some("create"), None).unwrap(),
        move |ctx: RequestContext| {
            *c.lock() += 1;
            async move {
                let reply = ctx.response(MessageStatus::Ok);
                Ok(vec![TransmissionPayload::new(reply)])
            }
        },
    );

    let mut responses = Vec::new();
    command
        .process_message(request("orders", "create"), &mut responses)
        .await
        .unwrap();
    assert_eq!(*calls.lock(), 1);
    assert_eq!(responses.len(), 1);

    let err = command
        .process_message(request("orders", "unknown"), &mut responses)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NotSupported(_)));
    assert_eq!(responses.len(), 1);

    let stats = command.statistics();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.not_supported, 1);
}

#[tokio::test]
async fn typed_handler_replies_only_when_asked() {
    let command = Command::new("orders", CommandPolicy::default()).unwrap();
    command.register_typed(
        MessageFilter::new("orders", Some("create"), None).unwrap(),
        |req: CreateOrder| async move {
            Ok(OrderCreated {
                order_id: u64::from(req.quantity) * 10,
            })
        },
    );

    let body = CreateOrder { sku: "A-1".into(), quantity: 4 };
    let header = ServiceMessageHeader::new("orders", "create", None);
    let fire_and_forget = ServiceMessage::new(header.clone(), &caller(), &body).unwrap();
    let mut responses = Vec::new();
    command
        .process_message(TransmissionPayload::new(fire_and_forget), &mut responses)
        .await
        .unwrap();
    assert!(responses.is_empty());

    let asking = ServiceMessage::new(header, &caller(), &body)
        .unwrap()
        .with_response_header(ServiceMessageHeader::new("web", "created", None));
    let key = asking.request_id();
    command
        .process_message(TransmissionPayload::new(asking), &mut responses)
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);
    let reply = &responses[0].message;
    assert_eq!(reply.header.channel_id, "web");
    assert_eq!(reply.correlation_id(), Some(key));
    assert_eq!(reply.decode::<OrderCreated>().unwrap(), OrderCreated { order_id: 40 });
}

#[tokio::test]
async fn dead_letters_prefer_dead_letter_handler() {
    let command = Command::new("orders", CommandPolicy::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let filter = MessageFilter::new("orders", Some("create"), None).unwrap();

    let s = Arc::clone(&seen);
    command.register(filter.clone(), move |_| {
        s.lock().push("live");
        async { Ok(Vec::new()) }
    });
    let s = Arc::clone(&seen);
    command.register_dead_letter(Handler::new(filter, move |_| {
        s.lock().push("dead");
        async { Ok(Vec::new()) }
    }));

    let mut dead = request("orders", "create");
    dead.message.dead_letter = true;
    let mut out = Vec::new();
    command.process_message(dead, &mut out).await.unwrap();
    command
        .process_message(request("orders", "create"), &mut out)
        .await
        .unwrap();
    assert_eq!(*seen.lock(), vec!["dead", "live"]);
}

#[tokio::test]
async fn registration_changes_are_announced() {
    let command = Command::new("orders", CommandPolicy::default()).unwrap();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&changes);
    command.events().subscribe(move |e: &CommandEvent| {
        if let CommandEvent::CommandChanged { registered, .. } = e {
            c.lock().push(*registered);
        }
    });

    let filter = MessageFilter::channel("orders").unwrap();
    command.register(filter.clone(), |_| async { Ok(Vec::new()) });
    assert!(command.supports(&ServiceMessageHeader::new("orders", "anything", None)));
    assert!(command.unregister(&filter));
    assert!(!command.unregister(&filter));
    assert_eq!(*changes.lock(), vec![true, false]);
}

#[test]
fn supports_covers_every_supported_filter() {
    let policy = CommandPolicy {
        master_job: MasterJobPolicy {
            enabled: true,
            negotiation_channel: Some("cluster".into()),
            ..Default::default()
        },
        ..with_outgoing()
    };
    let command = Command::new("orders", policy).unwrap();
    command.register(
        MessageFilter::new("orders", Some("create"), Some("now")).unwrap(),
        |_| async { Ok(Vec::new()) },
    );
    command.register_dead_letter(Handler::new(
        MessageFilter::channel("orders-dlq").unwrap(),
        |_| async { Ok(Vec::new()) },
    ));

    let supported = [
        ServiceMessageHeader::action("orders", "create", "now"),
        ServiceMessageHeader::new("orders-dlq", "anything", None),
        ServiceMessageHeader::new("orders-replies", "response", None),
        ServiceMessageHeader::action("cluster", "masterjob", "iammaster"),
    ];
    for header in &supported {
        assert!(command.supports(header), "{header}");
    }
    let unsupported = [
        ServiceMessageHeader::action("orders", "create", "later"),
        ServiceMessageHeader::new("orders", "create", None),
        ServiceMessageHeader::action("orders-replies", "response", "x"),
        ServiceMessageHeader::new("cluster", "other", None),
    ];
    for header in &unsupported {
        assert!(!command.supports(header), "{header}");
    }

    // Same answer as matching against the published filter list.
    let filters = command.supported_messages();
    assert_eq!(filters.len(), 4);
    for header in supported.iter().chain(&unsupported) {
        let listed = filters.iter().any(|f| f.matches(header).is_some());
        assert_eq!(command.supports(header), listed, "{header}");
    }
}

#[tokio::test]
async fn outgoing_request_resolves_with_matching_response() {
    let command = Command::new("orders", with_outgoing()).unwrap();
    let (dispatcher, _) = start(&command);

    let outbound = request("billing", "charge");
    let pending = command.send_request(outbound).unwrap();
    let sent = dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].message.response_header,
        Some(ServiceMessageHeader::new("orders-replies", "response", None))
    );
    assert_eq!(command.outstanding_requests(), 1);

    let billing = ServiceIdentity::new("billing", "billing-1");
    let reply = sent[0].message.to_response(&billing, MessageStatus::Ok);
    let mut out = Vec::new();
    command
        .process_message(TransmissionPayload::new(reply), &mut out)
        .await
        .unwrap();

    let response = pending.wait().await.unwrap();
    assert_eq!(response.message.originator_service_id, "billing-1");
    assert_eq!(command.outstanding_requests(), 0);
    assert_eq!(command.statistics().outgoing.matched, 1);
}

#[tokio::test]
async fn fire_and_forget_request_is_still_tracked() {
    let command = Command::new("orders", with_outgoing()).unwrap();
    let (dispatcher, _) = start(&command);

    let id = command.transmit_async(request("billing", "charge")).unwrap();
    let sent = dispatcher.take();
    assert_eq!(id, sent[0].message.request_id());
    assert_eq!(command.outstanding_requests(), 1);

    let reply = sent[0]
        .message
        .to_response(&ServiceIdentity::new("billing", "billing-1"), MessageStatus::Ok);
    let mut out = Vec::new();
    command
        .process_message(TransmissionPayload::new(reply), &mut out)
        .await
        .unwrap();
    assert_eq!(command.outstanding_requests(), 0);
    assert_eq!(command.statistics().outgoing.matched, 1);
}

#[tokio::test]
async fn unrecognized_response_raises_event() {
    let command = Command::new("orders", with_outgoing()).unwrap();
    let _ = start(&command);
    let unrecognized = Arc::new(Mutex::new(0u32));
    let u = Arc::clone(&unrecognized);
    command.events().subscribe(move |e: &CommandEvent| {
        if matches!(e, CommandEvent::UnrecognizedResponse { .. }) {
            *u.lock() += 1;
        }
    });

    let stray = request("billing", "charge")
        .message
        .with_response_header(ServiceMessageHeader::new("orders-replies", "response", None))
        .to_response(&caller(), MessageStatus::Ok);
    let mut out = Vec::new();
    command
        .process_message(TransmissionPayload::new(stray), &mut out)
        .await
        .unwrap();
    assert_eq!(*unrecognized.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn outgoing_request_times_out() {
    let command = Command::new("orders", with_outgoing()).unwrap();
    let (dispatcher, _) = start(&command);
    let timed_out = Arc::new(Mutex::new(Vec::new()));
    let t = Arc::clone(&timed_out);
    command.events().subscribe(move |e: &CommandEvent| {
        if let CommandEvent::RequestTimedOut(r) = e {
            t.lock().push(r.id.clone());
        }
    });

    let pending = command
        .send_request(request("billing", "charge").with_max_processing_time(Duration::from_secs(2)))
        .unwrap();
    let id = pending.id.clone();
    assert_eq!(command.process_timeouts(), 0);

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(command.process_timeouts(), 1);
    assert!(matches!(pending.wait().await, Err(CommandError::Timeout { .. })));
    assert_eq!(*timed_out.lock(), vec![id]);

    // A response arriving after the timeout is ignored.
    let late = dispatcher.take()[0]
        .message
        .to_response(&caller(), MessageStatus::Ok);
    assert!(!command.outgoing_response_process(TransmissionPayload::new(late)));
}

#[tokio::test]
async fn stop_cancels_outstanding_requests() {
    let command = Command::new("orders", with_outgoing()).unwrap();
    let (_, scheduler) = start(&command);
    assert_eq!(scheduler.len(), 1);

    let pending = command.send_request(request("billing", "charge")).unwrap();
    command.stop();
    assert!(matches!(pending.wait().await, Err(CommandError::Cancelled(_))));
    assert!(scheduler.is_empty());
    assert!(matches!(
        command.send_request(request("billing", "charge")),
        Err(CommandError::NotStarted(_))
    ));
}

#[tokio::test]
async fn send_request_needs_outgoing_enabled() {
    let command = Command::new("orders", CommandPolicy::default()).unwrap();
    let _ = start(&command);
    assert!(matches!(
        command.send_request(request("billing", "charge")),
        Err(CommandError::Config(_))
    ));
}

fn negotiation(action: &str, sender: &str) -> TransmissionPayload {
    let header = ServiceMessageHeader::action("cluster", "masterjob", action);
    let identity = ServiceIdentity::new("orders", sender);
    TransmissionPayload::new(ServiceMessage::empty(header, &identity))
}

#[tokio::test]
async fn master_job_negotiation_runs_through_process_message() {
    let policy = CommandPolicy {
        master_job: MasterJobPolicy {
            enabled: true,
            negotiation_channel: Some("cluster".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let command = Command::new("orders", policy).unwrap();
    command
        .register_master_job(Schedule::new("nightly", Frequency::Once, |_| async { Ok(()) }))
        .unwrap();
    let (dispatcher, scheduler) = start(&command);
    // Only the negotiation poll; master jobs wait for the Active state.
    assert_eq!(scheduler.len(), 1);
    let state = || command.statistics().master_job.map(|m| m.state);
    assert_eq!(state(), Some(MasterJobState::VerifyingComms));

    let mut out = Vec::new();
    command
        .process_message(negotiation("whoismaster", "orders-1"), &mut out)
        .await
        .unwrap();
    assert_eq!(state(), Some(MasterJobState::Starting));

    command
        .process_message(negotiation("iammaster", "orders-2"), &mut out)
        .await
        .unwrap();
    assert_eq!(state(), Some(MasterJobState::Inactive));
    assert!(out.is_empty());

    let sent = dispatcher.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.header.action_type.as_deref(), Some("iamstandby"));
    assert_eq!(sent[0].options, ProcessOptions::EXTERNAL_ONLY);
    assert_eq!(sent[0].message.channel_priority, 2);

    let bad = command
        .process_message(negotiation("hello", "orders-2"), &mut out)
        .await;
    assert!(matches!(bad, Err(CommandError::Codec(_))));
}

#[test]
fn master_job_registration_requires_enabled_policy() {
    let command = Command::new("orders", CommandPolicy::default()).unwrap();
    let job = Schedule::new("nightly", Frequency::Once, |_| async { Ok(()) });
    assert!(matches!(command.register_master_job(job), Err(CommandError::Config(_))));
}
