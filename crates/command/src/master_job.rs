use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use stellwerk_core::{
    MessageFilter, Observers, ProcessOptions, ServiceMessage, ServiceMessageHeader,
    TransmissionPayload,
};
use stellwerk_tasks::{Frequency, Schedule};
use tracing::{debug, info, warn};

use crate::command::Attachment;
use crate::error::CommandError;
use crate::event::CommandEvent;
use crate::master::{
    MasterJobAction, MasterJobEffect, MasterJobNegotiator, MasterJobState, MasterJobStatistics,
};
use crate::policy::MasterJobPolicy;

/// Jobs owned by the master, and whether they are registered right now.
#[derive(Default)]
struct MasterJobs {
    schedules: Vec<Arc<Schedule>>,
    running: bool,
}

/// Drives a [`MasterJobNegotiator`] for one command: polls it from a
/// schedule, feeds it peer notifications and carries out its effects.
pub(crate) struct MasterJobRunner {
    policy: MasterJobPolicy,
    channel: String,
    filter: MessageFilter,
    negotiator: Mutex<MasterJobNegotiator>,
    jobs: Mutex<MasterJobs>,
    attachment: RwLock<Option<Attachment>>,
    poll_schedule: Mutex<Option<Arc<Schedule>>>,
    events: Arc<Observers<CommandEvent>>,
}

impl MasterJobRunner {
    pub fn new(
        policy: MasterJobPolicy,
        events: Arc<Observers<CommandEvent>>,
    ) -> Result<Self, CommandError> {
        policy.validate()?;
        let channel = policy
            .negotiation_channel
            .clone()
            .ok_or_else(|| CommandError::Config("master job has no negotiation channel".into()))?;
        let filter = MessageFilter::new(
            &channel,
            Some(policy.negotiation_message_type.as_str()),
            None,
        )?;
        Ok(Self {
            negotiator: Mutex::new(MasterJobNegotiator::new("", policy.inactive_poll_threshold)),
            channel,
            filter,
            policy,
            jobs: Mutex::new(MasterJobs::default()),
            attachment: RwLock::new(None),
            poll_schedule: Mutex::new(None),
            events,
        })
    }

    /// Partial filter covering every negotiation action.
    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    pub fn register_job(&self, schedule: Arc<Schedule>) {
        let mut jobs = self.jobs.lock();
        if jobs.running {
            if let Some(att) = self.attachment.read().as_ref() {
                att.scheduler.register(Arc::clone(&schedule));
            }
        }
        jobs.schedules.push(schedule);
    }

    /// Start negotiating from `VerifyingComms`. Returns the poll schedule
    /// for the caller to register.
    pub fn attach(self: &Arc<Self>, attachment: Attachment) -> Arc<Schedule> {
        *self.negotiator.lock() = MasterJobNegotiator::new(
            attachment.identity.service_id.clone(),
            self.policy.inactive_poll_threshold,
        );
        *self.attachment.write() = Some(attachment);

        let (min, max) = self.policy.negotiating_window();
        let weak: Weak<Self> = Arc::downgrade(self);
        let schedule = Arc::new(Schedule::new(
            format!("masterjob:{}", self.channel),
            Frequency::Jitter { min, max },
            move |_| {
                if let Some(runner) = weak.upgrade() {
                    runner.poll();
                }
                async { Ok(()) }
            },
        ));
        *self.poll_schedule.lock() = Some(Arc::clone(&schedule));
        schedule
    }

    /// Stop local jobs and forget the attachment.
    pub fn detach(&self) {
        let attachment = self.attachment.read().clone();
        self.sync_jobs(attachment.as_ref(), true);
        *self.poll_schedule.lock() = None;
        *self.attachment.write() = None;
    }

    pub fn poll(&self) {
        let effects = self.negotiator.lock().poll();
        self.apply(effects);
        self.retune();
    }

    pub fn receive(&self, message: &ServiceMessage) -> Result<(), CommandError> {
        let raw = message.header.action_type.as_deref().unwrap_or_default();
        let action: MasterJobAction = raw.parse().map_err(CommandError::Codec)?;
        debug!(%action, sender = %message.originator_service_id, "master job notification");
        let effects = self
            .negotiator
            .lock()
            .receive(action, &message.originator_service_id);
        self.apply(effects);
        self.retune();
        Ok(())
    }

    pub fn statistics(&self) -> MasterJobStatistics {
        self.negotiator.lock().statistics()
    }

    /// Next poll follows the interval for the current state.
    fn retune(&self) {
        let interval = self.negotiator.lock().poll_interval(&self.policy);
        if let Some(schedule) = self.poll_schedule.lock().as_ref() {
            schedule.set_frequency(Frequency::Every(interval));
        }
    }

    fn apply(&self, effects: Vec<MasterJobEffect>) {
        let attachment = self.attachment.read().clone();
        for effect in effects {
            match effect {
                MasterJobEffect::Transmit(action) => {
                    let Some(att) = attachment.as_ref() else {
                        warn!(%action, "master job not attached, dropping transmit");
                        continue;
                    };
                    let header = ServiceMessageHeader::action(
                        &self.channel,
                        &self.policy.negotiation_message_type,
                        action.as_str(),
                    );
                    let mut message = ServiceMessage::empty(header, &att.identity);
                    message.channel_priority = self.policy.negotiation_priority;
                    // Peers, and our own echo, must see this; never short-circuit locally.
                    let payload =
                        TransmissionPayload::new(message).with_options(ProcessOptions::EXTERNAL_ONLY);
                    att.dispatcher.dispatch(payload);
                }
                MasterJobEffect::StartJobs | MasterJobEffect::StopJobs => {
                    self.sync_jobs(attachment.as_ref(), false);
                }
                MasterJobEffect::StateChanged { from, to } => {
                    info!(channel = %self.channel, %from, %to, "master job state changed");
                    self.events
                        .notify(&CommandEvent::MasterJobStateChanged { from, to });
                }
            }
        }
    }

    /// Bring the registered job set in line with the negotiator state.
    ///
    /// Effects are applied outside the negotiator lock, so a start or stop
    /// may arrive after the state has already moved on. Reading the state
    /// under the jobs lock makes the last caller win: jobs stay registered
    /// only while the negotiator is `Active`. `halt` unregisters regardless.
    fn sync_jobs(&self, attachment: Option<&Attachment>, halt: bool) {
        let mut jobs = self.jobs.lock();
        let wanted = !halt && self.negotiator.lock().state() == MasterJobState::Active;
        if wanted == jobs.running {
            return;
        }
        if wanted {
            let Some(att) = attachment else {
                return;
            };
            for job in &jobs.schedules {
                att.scheduler.register(Arc::clone(job));
            }
            debug!(channel = %self.channel, jobs = jobs.schedules.len(), "master jobs started");
        } else {
            if let Some(att) = attachment {
                for job in &jobs.schedules {
                    att.scheduler.unregister(job.id());
                }
            }
            debug!(channel = %self.channel, jobs = jobs.schedules.len(), "master jobs stopped");
        }
        jobs.running = wanted;
    }
}
