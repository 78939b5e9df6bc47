use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::clock;

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Done,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn unknown() -> Self {
        Self {
            id: None,
            status: JobStatus::Unknown,
            started: None,
            finished: None,
            result: None,
            error: None,
        }
    }

    fn running() -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            status: JobStatus::Running,
            started: Some(clock::unix_seconds()),
            ..Self::unknown()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    /// Finish time never precedes the recorded start, even if the wall clock
    /// stepped backwards while the job ran.
    fn finish(&mut self, outcome: std::thread::Result<anyhow::Result<Value>>) {
        let now = clock::unix_seconds();
        self.finished = Some(self.started.map_or(now, |started| now.max(started)));
        match outcome {
            Ok(Ok(value)) => {
                self.status = JobStatus::Done;
                self.result = Some(value);
            }
            Ok(Err(error)) => {
                self.status = JobStatus::Error;
                self.error = Some(format!("{error:#}"));
            }
            Err(payload) => {
                self.status = JobStatus::Error;
                self.error = Some(format!("job panicked: {}", panic_message(payload.as_ref())));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}

struct JobSlot {
    record: JobRecord,
    handle: Option<JoinHandle<()>>,
}

/// Named background jobs, one OS thread per run. A name that is running or
/// has finished successfully is never started again; an errored name is.
#[derive(Clone, Default)]
pub struct JobRegistry {
    slots: Arc<Mutex<HashMap<String, JobSlot>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `work` under `name` unless a run is already in flight or has
    /// completed, in which case that record is returned untouched. Never
    /// waits for `work`.
    pub fn start<F>(&self, name: &str, work: F) -> JobRecord
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(name) {
            if matches!(existing.record.status, JobStatus::Running | JobStatus::Done) {
                return existing.record.clone();
            }
        }

        let mut record = JobRecord::running();
        let run_id = record.id;
        let shared = Arc::clone(&self.slots);
        let job_name = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("job-{name}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(work));
                let mut slots = shared.lock();
                if let Some(slot) = slots.get_mut(&job_name) {
                    if slot.record.id == run_id {
                        slot.record.finish(outcome);
                        info!("Job {job_name} finished: {:?}", slot.record.status);
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => {
                info!("Job {name} started");
                Some(handle)
            }
            Err(error) => {
                warn!("Failed to spawn job {name}: {error}");
                record.finish(Ok(Err(anyhow::Error::new(error).context("spawn job thread"))));
                None
            }
        };

        slots.insert(
            name.to_string(),
            JobSlot {
                record: record.clone(),
                handle,
            },
        );
        record
    }

    pub fn status(&self, name: &str) -> JobRecord {
        self.slots
            .lock()
            .get(name)
            .map(|slot| slot.record.clone())
            .unwrap_or_else(JobRecord::unknown)
    }

    pub fn running_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.record.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Blocks until `name` is no longer running or `timeout` elapses, and
    /// returns the record as it stands. Finished threads are joined.
    pub fn wait(&self, name: &str, timeout: Duration) -> JobRecord {
        let deadline = Instant::now() + timeout;
        loop {
            let (record, handle) = {
                let mut slots = self.slots.lock();
                match slots.get_mut(name) {
                    None => return JobRecord::unknown(),
                    Some(slot) if !slot.record.is_running() => {
                        (slot.record.clone(), slot.handle.take())
                    }
                    Some(slot) => (slot.record.clone(), None),
                }
            };
            if !record.is_running() {
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
                return record;
            }
            if Instant::now() >= deadline {
                return record;
            }
            thread::sleep(WAIT_POLL);
        }
    }
}
