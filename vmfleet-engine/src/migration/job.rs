//! Migration job model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use vmfleet_hypervisor::{DiskFormat, MigrationFlags};

use super::preflight::PreflightIssue;
use crate::error::EngineError;

/// Job identifier handed back to callers.
pub type JobId = String;

/// State machine of a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Requested,
    CompatibilityCheck,
    Preparing,
    Transferring,
    Finalizing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Requested, CompatibilityCheck)
            | (CompatibilityCheck, Preparing)
            | (CompatibilityCheck, Transferring)
            | (Preparing, Transferring)
            | (Transferring, Finalizing)
            | (Finalizing, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Requested => "requested",
            JobState::CompatibilityCheck => "compatibility_check",
            JobState::Preparing => "preparing",
            JobState::Transferring => "transferring",
            JobState::Finalizing => "finalizing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// What Preparing does for one image on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskAction {
    /// A matching volume is already there
    Reuse,
    /// Empty volume, filled by the transfer
    Create,
    /// Placeholder for a missing base image, its content must be copied
    Copy,
}

/// One image of a disk's backing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainLink {
    /// Path on the source
    pub source_path: String,
    /// Volume name, identical on both ends
    pub volume: String,
    pub format: DiskFormat,
    pub capacity_bytes: u64,
    /// Pool on the destination
    pub dest_pool: String,
    /// Path on the destination, known once the volume exists there
    pub dest_path: Option<String>,
    pub action: DiskAction,
}

/// Plan of one guest disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskPlan {
    /// Guest device (vda, ...)
    pub target: String,
    pub source_path: String,
    /// Images ordered base first, top (the disk itself) last
    pub chain: Vec<ChainLink>,
}

impl DiskPlan {
    pub fn top(&self) -> Option<&ChainLink> {
        self.chain.last()
    }
}

/// A volume created on the destination during Preparing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedVolume {
    pub pool: String,
    pub name: String,
    pub path: String,
}

/// One in-flight or archived migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationJob {
    pub id: JobId,
    pub domain_uuid: String,
    pub source: String,
    pub destination: String,
    pub flags: MigrationFlags,
    pub state: JobState,
    pub plan: Vec<DiskPlan>,
    /// Preflight findings, warnings included
    pub diagnostics: Vec<PreflightIssue>,
    /// Volumes this job created, in creation order
    pub created_volumes: Vec<CreatedVolume>,
    /// Display form of `failure`
    pub error: Option<String>,
    #[serde(skip)]
    pub failure: Option<EngineError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    pub fn new(domain_uuid: &str, source: &str, destination: &str, flags: MigrationFlags) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            domain_uuid: domain_uuid.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            flags,
            state: JobState::Requested,
            plan: Vec::new(),
            diagnostics: Vec::new(),
            created_volumes: Vec::new(),
            error: None,
            failure: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `next`. Returns false and leaves the job alone if the move is
    /// not allowed.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        true
    }

    /// Move to `Failed`, unless already terminal. The first failure wins.
    pub fn fail(&mut self, failure: EngineError) -> bool {
        if self.transition(JobState::Failed) {
            self.error = Some(failure.to_string());
            self.failure = Some(failure);
            true
        } else {
            false
        }
    }

    pub fn uses_endpoint(&self, endpoint: &str) -> bool {
        self.source == endpoint || self.destination == endpoint
    }
}
