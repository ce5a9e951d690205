//! The microservice host: one task manager, one scheduler, one
//! communication container and any number of commands, wired together by
//! the [`MessageRouter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use stellwerk_command::{Command, CommandEvent, CommandStatistics};
use stellwerk_comms::{
    CommunicationContainer, CommunicationStatistics, ListenerClient, SenderClient,
};
use stellwerk_core::{Dispatcher, ServiceIdentity};
use stellwerk_tasks::{
    ManagedProcess, Schedule, SchedulerContainer, SchedulerStatistics, TaskManager,
    TaskManagerStatistics,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::routing::{MessageRouter, RoutingStatistics};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatistics {
    pub identity: ServiceIdentity,
    pub started: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub tasks: TaskManagerStatistics,
    pub scheduler: SchedulerStatistics,
    pub communication: CommunicationStatistics,
    pub routing: RoutingStatistics,
    pub commands: Vec<CommandStatistics>,
}

pub struct Microservice {
    config: ServiceConfig,
    identity: ServiceIdentity,
    tasks: TaskManager,
    scheduler: Arc<SchedulerContainer>,
    comms: Arc<CommunicationContainer>,
    router: Arc<MessageRouter>,
    started: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Microservice {
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let identity = config.identity();
        let tasks = TaskManager::new(config.tasks.clone())?;

        let scheduler = Arc::new(SchedulerContainer::new());
        let comms = Arc::new(CommunicationContainer::new(config.comms.clone())?);
        let scheduler_process: Arc<dyn ManagedProcess> = scheduler.clone();
        let comms_process: Arc<dyn ManagedProcess> = comms.clone();
        tasks.register_process(scheduler_process);
        tasks.register_process(comms_process);

        let router = MessageRouter::new(identity.clone(), Arc::clone(&comms), tasks.submitter());
        comms.set_processor(router.clone());

        Ok(Self {
            config,
            identity,
            tasks,
            scheduler,
            comms,
            router,
            started: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn scheduler(&self) -> &Arc<SchedulerContainer> {
        &self.scheduler
    }

    pub fn communication(&self) -> &Arc<CommunicationContainer> {
        &self.comms
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Dispatcher that routes locally first and externally otherwise.
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.router.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Create a command using the policy configured under its name.
    pub fn create_command(&self, name: &str) -> Result<Arc<Command>, ServiceError> {
        let command = Command::new(name, self.config.command_policy(name))?;
        self.register_command(command)
    }

    /// Add a command. Commands added after [`start`](Self::start) are
    /// started straight away.
    pub fn register_command(&self, command: Command) -> Result<Arc<Command>, ServiceError> {
        if self.command(command.name()).is_some() {
            return Err(ServiceError::DuplicateCommand(command.name().to_string()));
        }
        let command = Arc::new(command);

        let router = Arc::downgrade(&self.router);
        command.events().subscribe(move |event: &CommandEvent| {
            if let CommandEvent::CommandChanged { .. } = event {
                if let Some(router) = router.upgrade() {
                    router.refresh_supported_channels();
                }
            }
        });
        self.router.add_command(Arc::clone(&command));

        if self.is_started() {
            self.start_command(&command)?;
        }
        self.router.refresh_supported_channels();
        info!(command = %command.name(), "command registered");
        Ok(command)
    }

    pub fn command(&self, name: &str) -> Option<Arc<Command>> {
        self.router.commands().into_iter().find(|c| c.name() == name)
    }

    pub fn register_listener(&self, client: Arc<dyn ListenerClient>) {
        self.comms.register_listener(client);
    }

    pub fn register_sender(&self, client: Arc<dyn SenderClient>) {
        self.comms.register_sender(client);
    }

    pub fn register_schedule(&self, schedule: Schedule) -> Arc<Schedule> {
        let schedule = Arc::new(schedule);
        self.scheduler.register(Arc::clone(&schedule));
        schedule
    }

    pub fn unregister_schedule(&self, id: Uuid) -> bool {
        self.scheduler.unregister(id).is_some()
    }

    /// Start every command, then the task manager loop. Must be called
    /// inside a tokio runtime.
    pub fn start(&self) -> Result<(), ServiceError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::AlreadyStarted);
        }
        let commands = self.router.commands();
        for (i, command) in commands.iter().enumerate() {
            if let Err(e) = self.start_command(command) {
                for started in &commands[..i] {
                    started.stop();
                }
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        }
        self.router.refresh_supported_channels();
        if let Err(e) = self.tasks.start() {
            for command in &commands {
                command.stop();
            }
            self.started.store(false, Ordering::Release);
            return Err(e.into());
        }
        *self.started_at.lock() = Some(Utc::now());
        info!(identity = %self.identity, commands = commands.len(), "service started");
        Ok(())
    }

    /// Stop commands first so outstanding requests are cancelled, then the
    /// task manager.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for command in self.router.commands() {
            command.stop();
        }
        self.tasks.stop().await;
        *self.started_at.lock() = None;
        info!(identity = %self.identity, "service stopped");
    }

    pub fn statistics(&self) -> ServiceStatistics {
        ServiceStatistics {
            identity: self.identity.clone(),
            started: self.is_started(),
            started_at: *self.started_at.lock(),
            tasks: self.tasks.statistics(),
            scheduler: self.scheduler.statistics(),
            communication: self.comms.statistics(),
            routing: self.router.statistics(),
            commands: self
                .router
                .commands()
                .iter()
                .map(|c| c.statistics())
                .collect(),
        }
    }

    fn start_command(&self, command: &Arc<Command>) -> Result<(), ServiceError> {
        command
            .start(self.dispatcher(), Arc::clone(&self.scheduler), self.identity.clone())
            .map_err(|e| {
                warn!(command = %command.name(), error = %e, "command failed to start");
                ServiceError::from(e)
            })
    }
}
