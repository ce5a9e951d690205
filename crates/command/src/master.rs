//! Master-job negotiation.
//!
//! Peers sharing a negotiation channel elect one `Active` instance. The
//! negotiator here is a pure state machine: it consumes local polls and
//! peer notifications and returns the effects the caller must carry out.
//! It is best effort. Under message loss or partition there can briefly be
//! zero or two masters.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stellwerk_tasks::Frequency;

use crate::policy::MasterJobPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterJobState {
    VerifyingComms,
    Starting,
    Requesting1,
    Requesting2,
    TakingControl,
    Inactive,
    Active,
}

impl MasterJobState {
    /// Position in the acquisition sequence; `None` for the operational
    /// states.
    fn rank(self) -> Option<u8> {
        match self {
            Self::VerifyingComms => Some(0),
            Self::Starting => Some(1),
            Self::Requesting1 => Some(2),
            Self::Requesting2 => Some(3),
            Self::TakingControl => Some(4),
            Self::Inactive | Self::Active => None,
        }
    }

    /// VerifyingComms through TakingControl.
    pub fn is_negotiating(self) -> bool {
        self.rank().is_some()
    }
}

impl fmt::Display for MasterJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Negotiation message, carried in the header's action part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterJobAction {
    WhoIsMaster,
    RequestingControl1,
    RequestingControl2,
    TakingControl,
    IAmMaster,
    IAmStandby,
    ResyncMaster,
}

impl MasterJobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhoIsMaster => "whoismaster",
            Self::RequestingControl1 => "requestingcontrol1",
            Self::RequestingControl2 => "requestingcontrol2",
            Self::TakingControl => "takingcontrol",
            Self::IAmMaster => "iammaster",
            Self::IAmStandby => "iamstandby",
            Self::ResyncMaster => "resyncmaster",
        }
    }

    /// The state a sender of this action has reached. A receiver at or below
    /// it yields.
    fn step_down_threshold(self) -> Option<MasterJobState> {
        match self {
            Self::RequestingControl1 => Some(MasterJobState::Requesting1),
            Self::RequestingControl2 => Some(MasterJobState::Requesting2),
            Self::TakingControl => Some(MasterJobState::TakingControl),
            _ => None,
        }
    }
}

impl fmt::Display for MasterJobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MasterJobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s.to_ascii_lowercase().as_str() {
            "whoismaster" => Self::WhoIsMaster,
            "requestingcontrol1" => Self::RequestingControl1,
            "requestingcontrol2" => Self::RequestingControl2,
            "takingcontrol" => Self::TakingControl,
            "iammaster" => Self::IAmMaster,
            "iamstandby" => Self::IAmStandby,
            "resyncmaster" => Self::ResyncMaster,
            other => return Err(format!("unknown master job action '{other}'")),
        };
        Ok(action)
    }
}

/// What the caller must do after a poll or a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterJobEffect {
    Transmit(MasterJobAction),
    StartJobs,
    StopJobs,
    StateChanged {
        from: MasterJobState,
        to: MasterJobState,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StandbyPartner {
    pub service_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MasterJobStatistics {
    pub state: MasterJobState,
    pub current_master: Option<String>,
    pub current_master_seen: Option<DateTime<Utc>>,
    pub poll_attempts: u32,
    pub standbys: Vec<StandbyPartner>,
}

#[derive(Debug)]
pub struct MasterJobNegotiator {
    service_id: String,
    state: MasterJobState,
    current_master: Option<String>,
    current_master_seen: Option<DateTime<Utc>>,
    poll_attempts: u32,
    inactive_threshold: u32,
    standbys: HashMap<String, StandbyPartner>,
}

impl MasterJobNegotiator {
    pub fn new(service_id: impl Into<String>, inactive_threshold: u32) -> Self {
        Self {
            service_id: service_id.into(),
            state: MasterJobState::VerifyingComms,
            current_master: None,
            current_master_seen: None,
            poll_attempts: 0,
            inactive_threshold: inactive_threshold.max(1),
            standbys: HashMap::new(),
        }
    }

    pub fn state(&self) -> MasterJobState {
        self.state
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn current_master(&self) -> Option<&str> {
        self.current_master.as_deref()
    }

    pub fn poll_attempts(&self) -> u32 {
        self.poll_attempts
    }

    pub fn standbys(&self) -> impl Iterator<Item = &StandbyPartner> {
        self.standbys.values()
    }

    /// Outgoing poll, fired by the negotiation schedule.
    pub fn poll(&mut self) -> Vec<MasterJobEffect> {
        let mut effects = Vec::new();
        match self.state {
            MasterJobState::VerifyingComms => {
                effects.push(MasterJobEffect::Transmit(MasterJobAction::WhoIsMaster));
            }
            MasterJobState::Starting => {
                effects.push(MasterJobEffect::Transmit(MasterJobAction::WhoIsMaster));
                self.transition(MasterJobState::Requesting1, &mut effects);
            }
            MasterJobState::Inactive => {
                self.poll_attempts += 1;
                effects.push(MasterJobEffect::Transmit(MasterJobAction::WhoIsMaster));
                if self.poll_attempts >= self.inactive_threshold {
                    self.poll_attempts = 0;
                    self.current_master = None;
                    self.transition(MasterJobState::Starting, &mut effects);
                }
            }
            MasterJobState::Requesting1 => {
                effects.push(MasterJobEffect::Transmit(MasterJobAction::RequestingControl1));
                self.transition(MasterJobState::Requesting2, &mut effects);
            }
            MasterJobState::Requesting2 => {
                effects.push(MasterJobEffect::Transmit(MasterJobAction::RequestingControl2));
                self.transition(MasterJobState::TakingControl, &mut effects);
            }
            MasterJobState::TakingControl => {
                effects.push(MasterJobEffect::Transmit(MasterJobAction::TakingControl));
                self.current_master = Some(self.service_id.clone());
                self.current_master_seen = Some(Utc::now());
                self.transition(MasterJobState::Active, &mut effects);
                effects.push(MasterJobEffect::StartJobs);
            }
            MasterJobState::Active => {
                effects.push(MasterJobEffect::Transmit(MasterJobAction::IAmMaster));
            }
        }
        effects
    }

    /// Inbound notification from `sender`.
    pub fn receive(&mut self, action: MasterJobAction, sender: &str) -> Vec<MasterJobEffect> {
        let mut effects = Vec::new();

        if sender == self.service_id {
            // Our own broadcast came back: the channel works both ways.
            if self.state == MasterJobState::VerifyingComms {
                self.transition(MasterJobState::Starting, &mut effects);
            }
            return effects;
        }

        match action {
            MasterJobAction::IAmStandby => {
                if self.state == MasterJobState::Active {
                    let now = Utc::now();
                    self.standbys
                        .entry(sender.to_string())
                        .and_modify(|p| p.last_seen = now)
                        .or_insert_with(|| StandbyPartner {
                            service_id: sender.to_string(),
                            first_seen: now,
                            last_seen: now,
                        });
                }
            }
            MasterJobAction::IAmMaster => {
                if self.state == MasterJobState::Active {
                    self.step_down(&mut effects);
                } else if self.state != MasterJobState::VerifyingComms {
                    self.transition(MasterJobState::Inactive, &mut effects);
                }
                self.current_master = Some(sender.to_string());
                self.current_master_seen = Some(Utc::now());
                self.poll_attempts = 0;
                effects.push(MasterJobEffect::Transmit(MasterJobAction::IAmStandby));
            }
            MasterJobAction::ResyncMaster => {
                if self.state == MasterJobState::Active {
                    effects.push(MasterJobEffect::StopJobs);
                    self.standbys.clear();
                }
                self.poll_attempts = 0;
                self.current_master = None;
                self.transition(MasterJobState::Starting, &mut effects);
            }
            MasterJobAction::WhoIsMaster
            | MasterJobAction::RequestingControl1
            | MasterJobAction::RequestingControl2
            | MasterJobAction::TakingControl => {
                if self.state == MasterJobState::Active {
                    effects.push(MasterJobEffect::Transmit(MasterJobAction::IAmMaster));
                } else if self.state == MasterJobState::Inactive {
                    // A peer is negotiating; keep waiting for its outcome.
                    if action != MasterJobAction::WhoIsMaster {
                        self.poll_attempts = 0;
                    }
                } else if let Some(threshold) = action.step_down_threshold() {
                    if self.state.is_negotiating() && self.state.rank() <= threshold.rank() {
                        self.poll_attempts = 0;
                        self.transition(MasterJobState::Inactive, &mut effects);
                    }
                }
            }
        }
        effects
    }

    /// Interval until the next poll.
    ///
    /// Negotiating and active states poll on their jittered windows. An
    /// inactive instance backs off by the negotiating window times the
    /// attempt count, capped by the policy.
    pub fn poll_interval(&self, policy: &MasterJobPolicy) -> Duration {
        match self.state {
            MasterJobState::Active => {
                let (min, max) = policy.active_window();
                jitter(min, max)
            }
            MasterJobState::Inactive => {
                let (min, max) = policy.negotiating_window();
                let factor = self.poll_attempts + 1;
                let cap = Duration::from_secs(policy.inactive_backoff_cap_secs);
                jitter(min * factor, max * factor).min(cap)
            }
            _ => {
                let (min, max) = policy.negotiating_window();
                jitter(min, max)
            }
        }
    }

    pub fn statistics(&self) -> MasterJobStatistics {
        MasterJobStatistics {
            state: self.state,
            current_master: self.current_master.clone(),
            current_master_seen: self.current_master_seen,
            poll_attempts: self.poll_attempts,
            standbys: self.standbys.values().cloned().collect(),
        }
    }

    fn step_down(&mut self, effects: &mut Vec<MasterJobEffect>) {
        effects.push(MasterJobEffect::StopJobs);
        self.standbys.clear();
        self.transition(MasterJobState::Inactive, effects);
    }

    fn transition(&mut self, to: MasterJobState, effects: &mut Vec<MasterJobEffect>) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        effects.push(MasterJobEffect::StateChanged { from, to });
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    Frequency::Jitter { min, max }.next_interval().unwrap_or(min)
}
