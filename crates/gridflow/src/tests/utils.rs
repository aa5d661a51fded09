use derive_builder::Builder;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::backend::{
    Architecture, JobStatus, Lrms, LrmsRef, ResourceLimits, ResourceStatus, wrap_lrms,
};
use crate::common::WrappedRcRefCell;
use crate::common::error::GridError;
use crate::run::{JobInfo, ReturnCode, RunState};
use crate::task::{Application, JobSpec, Task};
use crate::{Map, Result, Set};

pub fn init_logging() {
    let _ = crate::common::setup::logging_builder(true)
        .is_test(true)
        .try_init();
}

pub fn test_limits(name: &str) -> ResourceLimits {
    ResourceLimits {
        name: name.to_string(),
        architecture: Set::from_iter([Architecture::X86_64]),
        max_cores: 8,
        max_cores_per_job: 4,
        max_memory_per_core: 4,
        max_walltime: Duration::from_secs(60 * 60),
    }
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct Job {
    #[builder(default = "vec![\"true\".to_string()]")]
    arguments: Vec<String>,
    #[builder(default = "1")]
    cores: u32,
    #[builder(default)]
    memory: Option<u64>,
    #[builder(default)]
    walltime: Option<Duration>,
    #[builder(default)]
    inputs: Vec<String>,
    #[builder(default)]
    outputs: Vec<String>,
}

impl JobBuilder {
    pub fn command(self, command: &str) -> Self {
        self.arguments(command.split_whitespace().map(str::to_string).collect())
    }

    pub fn build(self) -> JobSpec {
        let Job {
            arguments,
            cores,
            memory,
            walltime,
            inputs,
            outputs,
        } = self.finish().unwrap();
        let mut spec = JobSpec::new(arguments);
        spec.requested_cores = cores;
        spec.requested_memory = memory;
        spec.requested_walltime = walltime;
        spec.inputs = inputs;
        spec.outputs = outputs;
        spec
    }
}

/// Leaf task running `command` on the scripted backend.
pub fn app(command: &str) -> Box<dyn Task> {
    Box::new(Application::new(
        command,
        JobBuilder::default().command(command).build(),
    ))
}

pub fn running() -> JobStatus {
    JobStatus::new(RunState::Running)
}

pub fn exited(code: i32) -> JobStatus {
    JobStatus::terminated(ReturnCode::exited(code))
}

/// Shared state of [`ScriptedLrms`], kept by tests to steer the backend and to
/// inspect what the tasks did with it.
#[derive(Default)]
pub struct ScriptState {
    /// `"<operation> <job id>"` for every backend call.
    pub calls: Vec<String>,
    /// Scripts by the first argument of the job.
    pub scripts: Map<String, Vec<JobStatus>>,
    pub submit_failures: usize,
    pub fetch_failures: usize,
    jobs: Map<String, (Vec<JobStatus>, usize)>,
    job_counter: u64,
}

impl ScriptState {
    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }

    pub fn set_script(&mut self, command: &str, statuses: Vec<JobStatus>) {
        self.scripts.insert(command.to_string(), statuses);
    }
}

pub type ScriptHandle = WrappedRcRefCell<ScriptState>;

/// Backend whose jobs follow a script: by default each job runs on the first
/// poll and exits with 0 on the second one.
pub struct ScriptedLrms {
    limits: ResourceLimits,
    status: ResourceStatus,
    state: ScriptHandle,
}

impl ScriptedLrms {
    pub fn new(name: &str) -> (Self, ScriptHandle) {
        let limits = test_limits(name);
        let state = ScriptHandle::wrap(ScriptState::default());
        (
            Self {
                status: ResourceStatus::new(limits.max_cores as i64),
                limits,
                state: state.clone(),
            },
            state,
        )
    }
}

pub fn scripted_controller() -> (LrmsRef, ScriptHandle) {
    let (lrms, handle) = ScriptedLrms::new("scripted");
    (wrap_lrms(lrms), handle)
}

fn record(state: &ScriptHandle, operation: &str, job: &JobInfo) {
    let id = job.lrms_jobid.clone().unwrap_or_default();
    state.get_mut().calls.push(format!("{operation} {id}"));
}

impl Lrms for ScriptedLrms {
    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn status(&self) -> &ResourceStatus {
        &self.status
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.status.enabled = enabled;
    }

    fn submit_job(&mut self, spec: &JobSpec, job: &mut JobInfo) -> Result<Option<RunState>> {
        let mut state = self.state.get_mut();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            state.calls.push("submit-failed ".to_string());
            return Err(GridError::Submission("scripted failure".to_string()));
        }
        state.job_counter += 1;
        let id = format!("fake-{}", state.job_counter);
        let command = spec.arguments.first().cloned().unwrap_or_default();
        let statuses = state
            .scripts
            .get(&command)
            .cloned()
            .unwrap_or_else(|| vec![running(), exited(0)]);
        state.jobs.insert(id.clone(), (statuses, 0));
        state.calls.push(format!("submit {id}"));
        job.lrms_jobid = Some(id);
        job.resource_name = Some(self.limits.name.clone());
        Ok(Some(RunState::Submitted))
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        record(&self.state, "poll", job);
        let mut state = self.state.get_mut();
        let Some(id) = job.lrms_jobid.as_ref() else {
            return JobStatus::unknown();
        };
        let Some((statuses, position)) = state.jobs.get_mut(id) else {
            return JobStatus::unknown();
        };
        let index = (*position).min(statuses.len().saturating_sub(1));
        *position += 1;
        statuses.get(index).copied().unwrap_or_else(JobStatus::unknown)
    }

    fn get_results(
        &mut self,
        _spec: &JobSpec,
        job: &JobInfo,
        _download_dir: &Path,
        _overwrite: bool,
    ) -> Result<()> {
        record(&self.state, "fetch", job);
        let mut state = self.state.get_mut();
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(GridError::DataStaging("scripted failure".to_string()));
        }
        Ok(())
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        record(&self.state, "cancel", job);
        Ok(())
    }

    fn peek(
        &mut self,
        job: &JobInfo,
        remote_file: &str,
        sink: &mut dyn Write,
        _offset: u64,
        _size: Option<u64>,
    ) -> Result<()> {
        record(&self.state, "peek", job);
        sink.write_all(remote_file.as_bytes())?;
        Ok(())
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        self.status.updated = Some(chrono::Utc::now());
        Ok(&self.status)
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        record(&self.state, "free", job);
        Ok(())
    }

    fn validate_data(&self, _inputs: &[String]) -> bool {
        true
    }
}

/// Call `progress` until the task terminates, returns the number of rounds.
pub fn run_to_completion(task: &mut dyn Task, max_rounds: usize) -> usize {
    for round in 1..=max_rounds {
        task.progress().unwrap();
        if task.state() == RunState::Terminated {
            return round;
        }
    }
    panic!(
        "task {} did not terminate in {max_rounds} rounds, state {}",
        task.name(),
        task.state()
    );
}
