//! Resource managers that actually run jobs.
//!
//! Every kind of resource (local shell, PBS, Slurm, simulated...) implements
//! [`Lrms`]. Tasks never talk to a backend directly: they are attached to a
//! shared [`LrmsRef`], usually a [`broker::Broker`] that selects one of the
//! configured resources for each job.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use crate::common::WrappedRcRefCell;
use crate::common::error::GridError;
use crate::run::{JobInfo, ReturnCode, RunState};
use crate::task::JobSpec;
use crate::{Result, Set};

pub mod auth;
pub mod batch;
pub mod broker;
pub mod noop;
pub mod registry;
pub mod shellcmd;

pub use auth::{AuthHook, Authenticated};

pub type LrmsRef = WrappedRcRefCell<dyn Lrms>;

pub fn wrap_lrms<L: Lrms + 'static>(lrms: L) -> LrmsRef {
    let inner: Rc<RefCell<dyn Lrms>> = Rc::new(RefCell::new(lrms));
    WrappedRcRefCell::new_wrapped(inner)
}

pub fn wrap_boxed_lrms(lrms: Box<dyn Lrms>) -> LrmsRef {
    wrap_lrms(BoxedLrms(lrms))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_32", alias = "i386", alias = "i686", alias = "x86")]
    X86_32,
    #[serde(rename = "x86_64", alias = "amd64", alias = "x64")]
    X86_64,
}

impl FromStr for Architecture {
    type Err = GridError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "x86_32" | "x86-32" | "i386" | "i686" | "x86" => Ok(Architecture::X86_32),
            "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Architecture::X86_64),
            other => Err(GridError::Config(format!("unknown architecture `{other}`"))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::X86_32 => "x86_32",
            Architecture::X86_64 => "x86_64",
        })
    }
}

/// Static capacity of a resource. Fixed once the backend is constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub name: String,
    pub architecture: Set<Architecture>,
    pub max_cores: u32,
    pub max_cores_per_job: u32,
    /// GB
    pub max_memory_per_core: u64,
    pub max_walltime: Duration,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GridError::Config("resource name cannot be empty".into()));
        }
        if self.architecture.is_empty() {
            return Err(GridError::Config(format!(
                "resource {} must declare at least one architecture",
                self.name
            )));
        }
        if self.max_cores == 0 {
            return Err(GridError::Config(format!(
                "resource {}: max_cores must be positive",
                self.name
            )));
        }
        if self.max_cores_per_job > self.max_cores {
            return Err(GridError::Config(format!(
                "resource {}: max_cores_per_job ({}) exceeds max_cores ({})",
                self.name, self.max_cores_per_job, self.max_cores
            )));
        }
        Ok(())
    }

    /// Checks whether a job fits into this resource, returns the reason if it does not.
    pub fn check_job(&self, spec: &JobSpec) -> std::result::Result<(), String> {
        if let Some(arch) = spec.requested_architecture {
            if !self.architecture.contains(&arch) {
                return Err(format!("architecture {arch} is not supported"));
            }
        }
        if spec.requested_cores > self.max_cores_per_job {
            return Err(format!(
                "{} cores requested, at most {} allowed per job",
                spec.requested_cores, self.max_cores_per_job
            ));
        }
        if let Some(memory) = spec.requested_memory {
            if memory > self.max_memory_per_core {
                return Err(format!(
                    "{memory} GB per core requested, at most {} available",
                    self.max_memory_per_core
                ));
            }
        }
        if let Some(walltime) = spec.requested_walltime {
            if walltime > self.max_walltime {
                return Err(format!(
                    "walltime {} requested, at most {} allowed",
                    humantime::format_duration(walltime),
                    humantime::format_duration(self.max_walltime)
                ));
            }
        }
        Ok(())
    }
}

/// Dynamic load of a resource, refreshed by [`Lrms::get_resource_status`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub enabled: bool,
    pub free_slots: i64,
    pub user_run: u32,
    pub user_queued: u32,
    pub queued: u32,
    pub updated: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    pub fn new(free_slots: i64) -> Self {
        Self {
            enabled: true,
            free_slots,
            user_run: 0,
            user_queued: 0,
            queued: 0,
            updated: None,
        }
    }
}

/// Result of polling a job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    pub state: RunState,
    pub returncode: Option<ReturnCode>,
}

impl JobStatus {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            returncode: None,
        }
    }

    pub fn unknown() -> Self {
        Self::new(RunState::Unknown)
    }

    pub fn terminated(returncode: ReturnCode) -> Self {
        Self {
            state: RunState::Terminated,
            returncode: Some(returncode),
        }
    }
}

/// Local Resource Management System: one configured remote (or local) resource.
pub trait Lrms {
    fn name(&self) -> &str {
        &self.limits().name
    }

    fn limits(&self) -> &ResourceLimits;

    fn status(&self) -> &ResourceStatus;

    fn set_enabled(&mut self, enabled: bool);

    /// Start the job remotely and record backend bookkeeping in `job`.
    /// May report the initial state when the backend knows it (e.g. already running).
    fn submit_job(&mut self, spec: &JobSpec, job: &mut JobInfo) -> Result<Option<RunState>>;

    /// Poll the job. Never fails: anything that cannot be mapped is `UNKNOWN`.
    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus;

    /// Copy the job's results into `download_dir`. Existing files are kept unless
    /// `overwrite` is set.
    fn get_results(
        &mut self,
        spec: &JobSpec,
        job: &JobInfo,
        download_dir: &Path,
        overwrite: bool,
    ) -> Result<()>;

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()>;

    /// Write `size` bytes (or everything) from `offset` of a remote file into `sink`.
    fn peek(
        &mut self,
        job: &JobInfo,
        remote_file: &str,
        sink: &mut dyn Write,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()>;

    fn get_resource_status(&mut self) -> Result<&ResourceStatus>;

    fn free(&mut self, job: &JobInfo) -> Result<()>;

    /// Whether every input can be staged by this backend.
    fn validate_data(&self, inputs: &[String]) -> bool;

    fn close(&mut self) {}
}

/// Adapter that lets an already boxed backend be shared as an [`LrmsRef`].
struct BoxedLrms(Box<dyn Lrms>);

impl Lrms for BoxedLrms {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn limits(&self) -> &ResourceLimits {
        self.0.limits()
    }

    fn status(&self) -> &ResourceStatus {
        self.0.status()
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.0.set_enabled(enabled)
    }

    fn submit_job(&mut self, spec: &JobSpec, job: &mut JobInfo) -> Result<Option<RunState>> {
        self.0.submit_job(spec, job)
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        self.0.update_job_state(job)
    }

    fn get_results(
        &mut self,
        spec: &JobSpec,
        job: &JobInfo,
        download_dir: &Path,
        overwrite: bool,
    ) -> Result<()> {
        self.0.get_results(spec, job, download_dir, overwrite)
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        self.0.cancel_job(job)
    }

    fn peek(
        &mut self,
        job: &JobInfo,
        remote_file: &str,
        sink: &mut dyn Write,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()> {
        self.0.peek(job, remote_file, sink, offset, size)
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        self.0.get_resource_status()
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        self.0.free(job)
    }

    fn validate_data(&self, inputs: &[String]) -> bool {
        self.0.validate_data(inputs)
    }

    fn close(&mut self) {
        self.0.close()
    }
}

/// Local filesystem path of an input reference, `None` if it needs a transfer
/// protocol (`http://`, `gsiftp://`, ...).
pub fn local_path(input: &str) -> Option<PathBuf> {
    if let Some(path) = input.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if input.contains("://") {
        return None;
    }
    Some(PathBuf::from(input))
}

pub(crate) fn job_id(job: &JobInfo) -> Result<&str> {
    job.lrms_jobid
        .as_deref()
        .ok_or_else(|| GridError::UnknownJob("job has no backend id".to_string()))
}

/// Copy `files` from a job's working directory into `download_dir`.
pub(crate) fn copy_results(
    workdir: &Path,
    files: &[&str],
    download_dir: &Path,
    overwrite: bool,
) -> Result<()> {
    for file in files {
        let source = workdir.join(file);
        let target = download_dir.join(file);
        if !source.exists() {
            log::debug!("Result file {} does not exist, skipping", source.display());
            continue;
        }
        if target.exists() && !overwrite {
            log::debug!("Not overwriting existing file {}", target.display());
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target).map_err(|error| {
            GridError::DataStaging(format!(
                "cannot copy {} to {}: {error}",
                source.display(),
                target.display()
            ))
        })?;
    }
    Ok(())
}

/// Write a byte range of a local file into `sink`.
pub(crate) fn peek_file(
    path: &Path,
    sink: &mut dyn Write,
    offset: u64,
    size: Option<u64>,
) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    match size {
        Some(size) => {
            std::io::copy(&mut file.take(size), sink)?;
        }
        None => {
            std::io::copy(&mut file, sink)?;
        }
    }
    Ok(())
}
