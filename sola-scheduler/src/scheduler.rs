//! Worker job scheduler
//!
//! Each connected worker owns one slot: `{type, status, file}`. A scheduling
//! pass walks the READY slots and tries to claim the oldest eligible queue row
//! for each of them. Claims are serialized per job type by an async mutex held
//! across select, update, shard choice and dispatch, so two workers can never
//! receive the same row; hash and load claims do not block each other.

use crate::error::{Result, SchedulerError};
use crate::queue::JobQueue;
use crate::shard_selector::{least_populated, RoundRobin, ShardProbe};
use serde::{Deserialize, Serialize};
use sola_common::db::QueueStatus;
use sola_common::ShardTarget;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Hash,
    Load,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Hash => "hash",
            JobType::Load => "load",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(JobType::Hash),
            "load" => Ok(JobType::Load),
            other => Err(SchedulerError::UnknownJobType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Busy,
    Ready,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Ready => "READY",
        })
    }
}

/// Scheduler-side view of one worker connection
///
/// Field order gives the snapshot sort order: type, status, file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct WorkerSlot {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: WorkerStatus,
    pub file: String,
}

impl WorkerSlot {
    fn ready(job_type: JobType) -> Self {
        Self {
            job_type,
            status: WorkerStatus::Ready,
            file: String::new(),
        }
    }
}

/// Job message sent to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobDescriptor {
    Hash { file: String, algo: String },
    Load { file: String, core: String },
}

impl JobDescriptor {
    pub fn file(&self) -> &str {
        match self {
            JobDescriptor::Hash { file, .. } | JobDescriptor::Load { file, .. } => file,
        }
    }
}

struct Worker {
    slot: WorkerSlot,
    sender: mpsc::UnboundedSender<JobDescriptor>,
}

pub struct Scheduler {
    queue: JobQueue,
    algorithm: String,
    workers: Mutex<HashMap<Uuid, Worker>>,
    hash_claim: tokio::sync::Mutex<()>,
    load_claim: tokio::sync::Mutex<RoundRobin>,
    probe: Option<Arc<dyn ShardProbe>>,
}

impl Scheduler {
    pub fn new(
        queue: JobQueue,
        algorithm: impl Into<String>,
        shards: Vec<ShardTarget>,
        probe: Option<Arc<dyn ShardProbe>>,
    ) -> Self {
        Self {
            queue,
            algorithm: algorithm.into(),
            workers: Mutex::new(HashMap::new()),
            hash_claim: tokio::sync::Mutex::new(()),
            load_claim: tokio::sync::Mutex::new(RoundRobin::new(shards)),
            probe,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<Uuid, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a READY slot for a new worker connection
    pub fn register(&self, job_type: JobType) -> (Uuid, mpsc::UnboundedReceiver<JobDescriptor>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.workers().insert(
            id,
            Worker {
                slot: WorkerSlot::ready(job_type),
                sender,
            },
        );
        info!(worker = %id, job_type = %job_type, "Worker connected");
        (id, receiver)
    }

    pub fn unregister(&self, id: Uuid) {
        if let Some(worker) = self.workers().remove(&id) {
            info!(
                worker = %id,
                job_type = %worker.slot.job_type,
                file = %worker.slot.file,
                "Worker disconnected"
            );
        }
    }

    /// Worker reported back; its slot is free again
    pub fn mark_ready(&self, id: Uuid) {
        if let Some(worker) = self.workers().get_mut(&id) {
            worker.slot.status = WorkerStatus::Ready;
            worker.slot.file.clear();
        }
    }

    /// All slots, sorted by type, status and file
    pub fn snapshot(&self) -> Vec<WorkerSlot> {
        let mut slots: Vec<WorkerSlot> = self.workers().values().map(|w| w.slot.clone()).collect();
        slots.sort();
        slots
    }

    fn ready_workers(&self) -> Vec<(Uuid, JobType)> {
        self.workers()
            .iter()
            .filter(|(_, w)| w.slot.status == WorkerStatus::Ready)
            .map(|(id, w)| (*id, w.slot.job_type))
            .collect()
    }

    fn is_ready(&self, id: Uuid) -> bool {
        self.workers()
            .get(&id)
            .map_or(false, |w| w.slot.status == WorkerStatus::Ready)
    }

    /// Try to give every READY worker a job; returns the resulting snapshot
    pub async fn schedule(&self) -> Vec<WorkerSlot> {
        for (id, job_type) in self.ready_workers() {
            let claimed = match job_type {
                JobType::Hash => self.look_for_hash_job(id).await,
                JobType::Load => self.look_for_load_job(id).await,
            };
            if let Err(e) = claimed {
                warn!(worker = %id, job_type = %job_type, "Job claim failed: {}", e);
            }
        }

        let snapshot = self.snapshot();
        let pool: Vec<String> = snapshot
            .iter()
            .map(|s| format!("{},{},{}", s.job_type, s.status, s.file))
            .collect();
        debug!(workers = ?pool, "Worker pool");
        snapshot
    }

    async fn look_for_hash_job(&self, id: Uuid) -> Result<()> {
        let _claim = self.hash_claim.lock().await;
        if !self.is_ready(id) {
            return Ok(());
        }

        let Some(file) = self.queue.oldest_with_status(QueueStatus::Uploaded).await? else {
            return Ok(());
        };
        if !self
            .queue
            .transition(&file, QueueStatus::Uploaded, QueueStatus::Hashing)
            .await?
        {
            debug!(file = %file, "Row claimed elsewhere");
            return Ok(());
        }

        let job = JobDescriptor::Hash {
            file: file.clone(),
            algo: self.algorithm.clone(),
        };
        if let Err(e) = self.dispatch(id, job) {
            self.queue
                .transition(&file, QueueStatus::Hashing, QueueStatus::Uploaded)
                .await?;
            return Err(e);
        }
        info!(worker = %id, file = %file, "Dispatched hash job");
        Ok(())
    }

    async fn look_for_load_job(&self, id: Uuid) -> Result<()> {
        let mut round_robin = self.load_claim.lock().await;
        if !self.is_ready(id) {
            return Ok(());
        }

        let pending = self.queue.count_with_status(QueueStatus::Hashed).await?;
        let Some(file) = self.queue.oldest_with_status(QueueStatus::Hashed).await? else {
            return Ok(());
        };
        if !self
            .queue
            .transition(&file, QueueStatus::Hashed, QueueStatus::Loading)
            .await?
        {
            debug!(file = %file, "Row claimed elsewhere");
            return Ok(());
        }

        let Some(core) = self.choose_core(pending, &mut round_robin).await else {
            warn!(file = %file, "No search core available for load job");
            self.queue
                .transition(&file, QueueStatus::Loading, QueueStatus::Hashed)
                .await?;
            return Ok(());
        };

        let job = JobDescriptor::Load {
            file: file.clone(),
            core: core.to_string(),
        };
        if let Err(e) = self.dispatch(id, job) {
            self.queue
                .transition(&file, QueueStatus::Loading, QueueStatus::Hashed)
                .await?;
            return Err(e);
        }
        info!(worker = %id, file = %file, core = %core, "Dispatched load job");
        Ok(())
    }

    /// Least populated core while the backlog is smaller than the shard
    /// count, round-robin otherwise or when probing fails
    async fn choose_core(&self, pending: i64, round_robin: &mut RoundRobin) -> Option<ShardTarget> {
        let backlog_is_small = usize::try_from(pending).map_or(true, |p| p < round_robin.len());
        if backlog_is_small {
            if let Some(probe) = &self.probe {
                match least_populated(probe.as_ref()).await {
                    Ok(core) => {
                        debug!(core = %core, "Chose least populated core");
                        return Some(core);
                    }
                    Err(e) => warn!("Falling back to round-robin: {}", e),
                }
            }
        }
        round_robin.next()
    }

    fn dispatch(&self, id: Uuid, job: JobDescriptor) -> Result<()> {
        let mut workers = self.workers();
        let worker = workers.get_mut(&id).ok_or(SchedulerError::WorkerGone(id))?;
        let file = job.file().to_string();
        worker
            .sender
            .send(job)
            .map_err(|_| SchedulerError::WorkerGone(id))?;
        worker.slot.status = WorkerStatus::Busy;
        worker.slot.file = file;
        Ok(())
    }
}
