use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stellwerk_core::{
    Dispatcher, MessageFilter, MessageStatus, Observers, ServiceIdentity, ServiceMessage,
    ServiceMessageHeader, TransmissionPayload,
};
use stellwerk_tasks::{Frequency, Schedule, SchedulerContainer};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchTable, Handler, HandlerResult, HandlerStatistics, RequestContext};
use crate::error::CommandError;
use crate::event::CommandEvent;
use crate::master::MasterJobStatistics;
use crate::master_job::MasterJobRunner;
use crate::outgoing::{OutgoingRequests, PendingResponse};
use crate::policy::CommandPolicy;

/// Collaborators a started command talks to.
#[derive(Clone)]
pub(crate) struct Attachment {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub scheduler: Arc<SchedulerContainer>,
    pub identity: ServiceIdentity,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    not_supported: AtomicU64,
    transmitted: AtomicU64,
    responses_matched: AtomicU64,
    responses_unrecognized: AtomicU64,
    requests_timed_out: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingStatistics {
    pub outstanding: usize,
    pub transmitted: u64,
    pub matched: u64,
    pub unrecognized: u64,
    pub timed_out: u64,
    pub requests: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandStatistics {
    pub name: String,
    pub started: bool,
    pub processed: u64,
    pub failed: u64,
    pub not_supported: u64,
    pub handlers: Vec<HandlerStatistics>,
    pub dead_letter_handlers: Vec<HandlerStatistics>,
    pub outgoing: OutgoingStatistics,
    pub master_job: Option<MasterJobStatistics>,
}

/// A message-processing component.
///
/// Composes a dispatch table, a dead-letter table, outgoing-request tracking
/// and, when enabled, master-job negotiation. Handlers can be registered
/// before or after [`start`](Self::start); every change raises
/// [`CommandEvent::CommandChanged`].
pub struct Command {
    name: String,
    policy: CommandPolicy,
    response_header: Option<ServiceMessageHeader>,
    identity: RwLock<ServiceIdentity>,
    table: RwLock<DispatchTable>,
    dead_letters: RwLock<DispatchTable>,
    outgoing: Arc<OutgoingRequests>,
    master: Option<Arc<MasterJobRunner>>,
    events: Arc<Observers<CommandEvent>>,
    counters: Arc<Counters>,
    attachment: RwLock<Option<Attachment>>,
    schedules: Mutex<Vec<Uuid>>,
}

impl Command {
    pub fn new(name: impl Into<String>, policy: CommandPolicy) -> Result<Self, CommandError> {
        policy.validate()?;
        let name = name.into();
        let events = Arc::new(Observers::new());
        let master = if policy.master_job.enabled {
            Some(Arc::new(MasterJobRunner::new(
                policy.master_job.clone(),
                Arc::clone(&events),
            )?))
        } else {
            None
        };
        let response_header = policy.response_channel.as_deref().map(|channel| {
            ServiceMessageHeader::new(channel, &policy.response_message_type, None)
        });
        Ok(Self {
            identity: RwLock::new(ServiceIdentity::generated(&name)),
            name,
            policy,
            response_header,
            table: RwLock::new(DispatchTable::new()),
            dead_letters: RwLock::new(DispatchTable::new()),
            outgoing: Arc::new(OutgoingRequests::new()),
            master,
            events,
            counters: Arc::new(Counters::default()),
            attachment: RwLock::new(None),
            schedules: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn identity(&self) -> ServiceIdentity {
        self.identity.read().clone()
    }

    pub fn events(&self) -> &Observers<CommandEvent> {
        &self.events
    }

    pub fn is_started(&self) -> bool {
        self.attachment.read().is_some()
    }

    // ── Registration ─────────────────────────────────────────────────

    pub fn register<F, Fut>(&self, filter: MessageFilter, body: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(Handler::new(filter, body));
    }

    pub fn register_handler(&self, handler: Handler) {
        let filter = handler.filter().clone();
        debug!(command = %self.name, %filter, "registered handler");
        self.table.write().insert(handler);
        self.command_changed(filter, true);
    }

    /// Handler used for dead-lettered messages matching `filter`. Dead
    /// letters with no dead-letter handler fall through to the normal table.
    pub fn register_dead_letter(&self, handler: Handler) {
        let filter = handler.filter().clone();
        self.dead_letters.write().insert(handler);
        self.command_changed(filter, true);
    }

    /// Register a handler working on typed bodies.
    ///
    /// The request body is decoded as `Req`. When the request carries a
    /// response header, the handler's `Resp` is sent back as an `Ok` reply.
    pub fn register_typed<Req, Resp, F, Fut>(&self, filter: MessageFilter, body: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, CommandError>> + Send + 'static,
    {
        self.register(filter, move |ctx: RequestContext| {
            let request = ctx.decode::<Req>();
            let pending = request.map(&body);
            async move {
                let response = pending?.await?;
                Ok(ctx.reply(&response)?.into_iter().collect())
            }
        });
    }

    pub fn unregister(&self, filter: &MessageFilter) -> bool {
        let removed = self.table.write().remove(filter) | self.dead_letters.write().remove(filter);
        if removed {
            self.command_changed(filter.clone(), false);
        }
        removed
    }

    /// Schedule that runs only while this instance holds the master job.
    pub fn register_master_job(&self, schedule: Schedule) -> Result<(), CommandError> {
        let master = self.master.as_ref().ok_or_else(|| {
            CommandError::Config(format!("command {} has master job disabled", self.name))
        })?;
        master.register_job(Arc::new(schedule));
        Ok(())
    }

    fn command_changed(&self, filter: MessageFilter, registered: bool) {
        self.events
            .notify(&CommandEvent::CommandChanged { filter, registered });
    }

    /// Every filter this command answers, including response and
    /// negotiation traffic.
    pub fn supported_messages(&self) -> Vec<MessageFilter> {
        let mut filters = self.table.read().filters();
        filters.extend(self.dead_letters.read().filters());
        if let Some(filter) = self.response_filter() {
            filters.push(filter);
        }
        if let Some(master) = &self.master {
            filters.push(master.filter().clone());
        }
        filters
    }

    /// Whether any of [`supported_messages`](Self::supported_messages)
    /// matches `header`. Runs on every routed message.
    pub fn supports(&self, header: &ServiceMessageHeader) -> bool {
        self.table.read().supports(header)
            || self.dead_letters.read().supports(header)
            || self.is_response_channel(header)
            || self
                .master
                .as_ref()
                .is_some_and(|m| m.filter().matches(header).is_some())
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Route an inbound payload and collect the responses it produces.
    pub async fn process_message(
        &self,
        payload: TransmissionPayload,
        responses: &mut Vec<TransmissionPayload>,
    ) -> Result<(), CommandError> {
        let message = &payload.message;
        if message.is_response() && self.is_response_channel(&message.header) {
            self.outgoing_response_process(payload);
            return Ok(());
        }
        if let Some(master) = &self.master {
            if master.filter().matches(&message.header).is_some() {
                return master.receive(message);
            }
        }

        let dead = if message.dead_letter {
            self.dead_letters.read().resolve(&message.header)
        } else {
            None
        };
        let handler = dead.or_else(|| self.table.read().resolve(&message.header));
        let Some(handler) = handler else {
            self.counters.not_supported.fetch_add(1, Ordering::Relaxed);
            warn!(command = %self.name, header = %message.header, "message not supported");
            return Err(CommandError::NotSupported(message.header.to_string()));
        };

        let ctx = RequestContext {
            payload,
            identity: self.identity(),
        };
        match handler.execute(ctx).await {
            Ok(out) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                responses.extend(out);
                Ok(())
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Match a response to its outstanding request. Unmatched responses
    /// raise [`CommandEvent::UnrecognizedResponse`]; the requester may have
    /// timed out already.
    pub fn outgoing_response_process(&self, payload: TransmissionPayload) -> bool {
        let Some(id) = payload.message.correlation_id() else {
            return false;
        };
        let header = payload.message.header.to_string();
        if self.outgoing.resolve(&id, payload) {
            self.counters.responses_matched.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.counters
            .responses_unrecognized
            .fetch_add(1, Ordering::Relaxed);
        debug!(command = %self.name, correlation_id = %id, "unrecognized response");
        self.events.notify(&CommandEvent::UnrecognizedResponse {
            correlation_id: id,
            header,
        });
        false
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Hand a payload to the dispatcher without tracking a response.
    pub fn transmit(&self, payload: TransmissionPayload) -> Result<(), CommandError> {
        let dispatcher = self.dispatcher()?;
        self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
        dispatcher.dispatch(payload);
        Ok(())
    }

    /// Track and transmit a request. The returned handle resolves with the
    /// response, a timeout or a cancellation.
    ///
    /// The deadline is the payload's max processing time, or the policy
    /// default.
    pub fn send_request(
        &self,
        mut payload: TransmissionPayload,
    ) -> Result<PendingResponse, CommandError> {
        if !self.policy.outgoing_requests_enabled {
            return Err(CommandError::Config(format!(
                "command {} has outgoing requests disabled",
                self.name
            )));
        }
        let dispatcher = self.dispatcher()?;
        if payload.message.response_header.is_none() {
            payload.message.response_header = self.response_header();
        }
        let ttl = payload
            .max_processing_time
            .unwrap_or_else(|| self.policy.outgoing_request_ttl());
        let pending = self.outgoing.insert(
            &payload.message.request_id(),
            payload.message.header.clone(),
            ttl,
        )?;
        payload.max_processing_time = Some(ttl);
        self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
        dispatcher.dispatch(payload);
        Ok(pending)
    }

    /// Send a tracked request without waiting on it. The response still
    /// clears the tracker; a timeout still raises its event. Returns the
    /// correlation id.
    pub fn transmit_async(&self, payload: TransmissionPayload) -> Result<String, CommandError> {
        Ok(self.send_request(payload)?.id)
    }

    pub async fn transmit_and_wait(
        &self,
        payload: TransmissionPayload,
    ) -> Result<TransmissionPayload, CommandError> {
        self.send_request(payload)?.wait().await
    }

    /// Typed request/response round trip.
    pub async fn request<Req, Resp>(
        &self,
        header: ServiceMessageHeader,
        body: &Req,
    ) -> Result<Resp, CommandError>
    where
        Req: Serialize,
        Resp: for<'de> Deserialize<'de>,
    {
        let message = ServiceMessage::new(header, &self.identity(), body)?;
        let response = self
            .transmit_and_wait(TransmissionPayload::new(message))
            .await?;
        match response.message.status {
            None | Some(MessageStatus::Ok) => Ok(response.message.decode()?),
            Some(status) => Err(CommandError::Remote {
                status,
                description: response.message.status_description.unwrap_or_default(),
            }),
        }
    }

    /// Run the outgoing timeout sweep now. Returns how many requests timed out.
    pub fn process_timeouts(&self) -> usize {
        sweep(&self.outgoing, &self.events, &self.counters)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.outgoing.len()
    }

    fn dispatcher(&self) -> Result<Arc<dyn Dispatcher>, CommandError> {
        self.attachment
            .read()
            .as_ref()
            .map(|a| Arc::clone(&a.dispatcher))
            .ok_or_else(|| CommandError::NotStarted(self.name.clone()))
    }

    fn response_header(&self) -> Option<ServiceMessageHeader> {
        self.response_header.clone()
    }

    fn response_filter(&self) -> Option<MessageFilter> {
        if !self.policy.outgoing_requests_enabled {
            return None;
        }
        self.response_header().map(|h| h.to_filter())
    }

    fn is_response_channel(&self, header: &ServiceMessageHeader) -> bool {
        self.policy.outgoing_requests_enabled && self.response_header.as_ref() == Some(header)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Attach to the runtime: install the timeout sweep and, if enabled,
    /// begin master-job negotiation.
    pub fn start(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        scheduler: Arc<SchedulerContainer>,
        identity: ServiceIdentity,
    ) -> Result<(), CommandError> {
        self.policy.validate()?;
        let mut slot = self.attachment.write();
        if slot.is_some() {
            return Err(CommandError::Config(format!(
                "command {} already started",
                self.name
            )));
        }
        *self.identity.write() = identity.clone();
        let attachment = Attachment {
            dispatcher,
            scheduler: Arc::clone(&scheduler),
            identity,
        };

        let mut schedules = Vec::new();
        if self.policy.outgoing_requests_enabled {
            let interval = self.policy.outgoing_sweep_interval();
            let outgoing = Arc::clone(&self.outgoing);
            let events = Arc::clone(&self.events);
            let counters = Arc::clone(&self.counters);
            let schedule = Arc::new(
                Schedule::new(
                    format!("{}:outgoing-timeouts", self.name),
                    Frequency::Every(interval),
                    move |_| {
                        sweep(&outgoing, &events, &counters);
                        async { Ok(()) }
                    },
                )
                .with_initial_wait(interval),
            );
            schedules.push(schedule.id());
            scheduler.register(schedule);
        }
        if let Some(master) = &self.master {
            let poll = master.attach(attachment.clone());
            schedules.push(poll.id());
            scheduler.register(poll);
        }

        *slot = Some(attachment);
        *self.schedules.lock() = schedules;
        info!(command = %self.name, handlers = self.table.read().len(), "command started");
        Ok(())
    }

    /// Detach from the runtime: stop master jobs, remove schedules and
    /// cancel every outstanding request.
    pub fn stop(&self) {
        let Some(attachment) = self.attachment.write().take() else {
            return;
        };
        if let Some(master) = &self.master {
            master.detach();
        }
        for id in self.schedules.lock().drain(..) {
            attachment.scheduler.unregister(id);
        }
        let cancelled = self.outgoing.abort_all();
        info!(command = %self.name, cancelled, "command stopped");
    }

    pub fn statistics(&self) -> CommandStatistics {
        let c = &self.counters;
        CommandStatistics {
            name: self.name.clone(),
            started: self.is_started(),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            not_supported: c.not_supported.load(Ordering::Relaxed),
            handlers: self.table.read().statistics(),
            dead_letter_handlers: self.dead_letters.read().statistics(),
            outgoing: OutgoingStatistics {
                outstanding: self.outgoing.len(),
                transmitted: c.transmitted.load(Ordering::Relaxed),
                matched: c.responses_matched.load(Ordering::Relaxed),
                unrecognized: c.responses_unrecognized.load(Ordering::Relaxed),
                timed_out: c.requests_timed_out.load(Ordering::Relaxed),
                requests: self.outgoing.debug_strings(),
            },
            master_job: self.master.as_ref().map(|m| m.statistics()),
        }
    }
}

fn sweep(outgoing: &OutgoingRequests, events: &Observers<CommandEvent>, counters: &Counters) -> usize {
    let expired = outgoing.sweep_timeouts(Instant::now());
    let count = expired.len();
    for request in expired {
        counters.requests_timed_out.fetch_add(1, Ordering::Relaxed);
        warn!(request = %request.id, header = %request.header, "outgoing request timed out");
        events.notify(&CommandEvent::RequestTimedOut(request));
    }
    count
}
