use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::backend::{Architecture, LrmsRef};
use crate::common::error::{GridError, invalid_operation};
use crate::define_id_type;
use crate::run::{Execution, ReturnCode, RunState};
use crate::{Map, Result};

define_id_type!(TaskId, u64);

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId::new(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Output stream of a job that can be inspected with [`Task::peek`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Lifecycle contract shared by leaf jobs, collections and retry wrappers.
///
/// The engine only ever talks to this trait: it calls [`Task::progress`] (or the
/// individual lifecycle methods) on its top-level tasks, and composite tasks
/// forward the calls to their children before recomputing their own state.
pub trait Task: Any {
    fn id(&self) -> TaskId;
    fn name(&self) -> &str;
    fn execution(&self) -> &Execution;

    #[inline]
    fn state(&self) -> RunState {
        self.execution().state()
    }

    /// Whether the task was modified since the last [`Task::mark_saved`].
    fn changed(&self) -> bool;
    fn mark_saved(&mut self);

    fn controller(&self) -> Option<&LrmsRef>;

    /// Attaching to the controller the task already has is a no-op; attaching to a
    /// different one while attached fails with [`GridError::AlreadyAttached`].
    fn attach(&mut self, controller: &LrmsRef) -> Result<()>;
    fn detach(&mut self);

    #[inline]
    fn is_attached(&self) -> bool {
        self.controller().is_some()
    }

    /// Start the task. Submitting a task that is not `NEW` requires `resubmit`.
    /// A rejected submission is not an error: the task stays `NEW`.
    fn submit(&mut self, resubmit: bool) -> Result<RunState>;

    /// Refresh the state from the backend. Poll failures surface as `UNKNOWN`.
    fn update_state(&mut self) -> Result<RunState>;

    /// Best-effort cancellation; always ends in `TERMINATED`. Idempotent.
    fn kill(&mut self) -> Result<()>;

    /// Retrieve output artifacts into `output_dir` (or the task's own output
    /// directory). Moves a `TERMINATING` task to `TERMINATED`.
    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState>;

    fn peek(&self, stream: OutputStream, offset: u64, size: Option<u64>) -> Result<Vec<u8>>;

    /// Release backend-side resources of a `TERMINATED` task.
    fn free(&mut self) -> Result<()>;

    /// Reset the task to `NEW` so that it can be run again.
    fn redo(&mut self) -> Result<()>;

    /// Advance the task by one step of its normal lifecycle: poll it when it is in
    /// flight, submit it when it is `NEW`, fetch its output when it is
    /// `TERMINATING`.
    fn progress(&mut self) -> Result<RunState> {
        if self.state().in_flight() {
            self.update_state()?;
        }
        match self.state() {
            RunState::New => {
                self.submit(false)?;
            }
            RunState::Terminating => {
                self.fetch_output(None, false)?;
            }
            _ => {}
        }
        Ok(self.state())
    }

    fn children(&self) -> &[Box<dyn Task>] {
        &[]
    }

    fn as_any(&self) -> &dyn Any;
}

/// The controller a task is attached to.
#[derive(Default, Clone)]
pub(crate) struct Attachment {
    controller: Option<LrmsRef>,
}

impl Attachment {
    #[inline]
    pub fn get(&self) -> Option<&LrmsRef> {
        self.controller.as_ref()
    }

    /// Returns `true` when the controller was newly set.
    pub fn attach(&mut self, controller: &LrmsRef, task_name: &str) -> Result<bool> {
        match &self.controller {
            Some(current) if current == controller => Ok(false),
            Some(_) => Err(GridError::AlreadyAttached(task_name.to_string())),
            None => {
                self.controller = Some(controller.clone());
                Ok(true)
            }
        }
    }

    pub fn detach(&mut self) {
        self.controller = None;
    }

    pub fn require(&self, task_name: &str) -> Result<LrmsRef> {
        self.controller
            .clone()
            .ok_or_else(|| GridError::Detached(task_name.to_string()))
    }
}

/// Description of a single remote job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: Map<String, String>,
    /// Local paths or URLs staged into the job's working directory.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Files retrieved from the job's working directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Where results are downloaded. `None` (the default) leaves them on the
    /// resource: fetching only moves the task to `TERMINATED`.
    pub output_dir: Option<PathBuf>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Merge stderr into stdout.
    #[serde(default)]
    pub join: bool,
    pub requested_cores: u32,
    /// Memory per core in GB.
    pub requested_memory: Option<u64>,
    pub requested_walltime: Option<Duration>,
    pub requested_architecture: Option<Architecture>,
}

impl JobSpec {
    pub fn new<S: Into<String>>(arguments: impl IntoIterator<Item = S>) -> Self {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            environment: Default::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            output_dir: None,
            stdout: Some("stdout.txt".to_string()),
            stderr: Some("stderr.txt".to_string()),
            join: false,
            requested_cores: 1,
            requested_memory: None,
            requested_walltime: None,
            requested_architecture: None,
        }
    }

    /// Name of the file a stream is captured in, if it is captured at all.
    pub fn stream_file(&self, stream: OutputStream) -> Option<&str> {
        match stream {
            OutputStream::Stdout => self.stdout.as_deref(),
            OutputStream::Stderr if self.join => self.stdout.as_deref(),
            OutputStream::Stderr => self.stderr.as_deref(),
        }
    }

    /// Every file that should be copied back when the job terminates.
    pub fn result_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self.outputs.iter().map(String::as_str).collect();
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            if let Some(file) = self.stream_file(stream) {
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
        files
    }
}

/// Leaf task that runs one [`JobSpec`] on whatever backend it is attached to.
pub struct Application {
    id: TaskId,
    name: String,
    spec: JobSpec,
    execution: Execution,
    attachment: Attachment,
}

impl Application {
    pub fn new(name: impl Into<String>, spec: JobSpec) -> Self {
        Self {
            id: TaskId::next(),
            name: name.into(),
            spec,
            execution: Execution::default(),
            attachment: Attachment::default(),
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    fn poll(&mut self, controller: &LrmsRef) {
        let status = controller.get_mut().update_job_state(self.execution.job());
        if let Some(returncode) = status.returncode {
            self.execution.set_returncode(returncode);
        }
        let state = match status.state {
            // output has to be fetched before the task is really done
            RunState::Terminated => RunState::Terminating,
            RunState::New => {
                log::warn!(
                    "Backend reported state NEW for already submitted task {}",
                    self.name
                );
                RunState::Unknown
            }
            state => state,
        };
        self.execution.set_state(state);
    }
}

impl Task for Application {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn execution(&self) -> &Execution {
        &self.execution
    }

    fn changed(&self) -> bool {
        self.execution.changed()
    }

    fn mark_saved(&mut self) {
        self.execution.mark_saved();
    }

    fn controller(&self) -> Option<&LrmsRef> {
        self.attachment.get()
    }

    fn attach(&mut self, controller: &LrmsRef) -> Result<()> {
        self.attachment.attach(controller, &self.name)?;
        Ok(())
    }

    fn detach(&mut self) {
        self.attachment.detach();
    }

    fn submit(&mut self, resubmit: bool) -> Result<RunState> {
        match self.state() {
            RunState::New => {}
            state if resubmit => {
                log::debug!("Resubmitting task {} from state {state}", self.name);
                self.execution.reset();
            }
            state => {
                return invalid_operation(format!(
                    "task {} is in state {state}, only NEW tasks can be submitted",
                    self.name
                ));
            }
        }
        if self.spec.arguments.is_empty() {
            log::error!("Task {} has no command to execute", self.name);
            self.execution
                .set_info("Submission failed: job has no command to execute");
            self.execution
                .set_returncode(ReturnCode::new(crate::Signal::SUBMISSION_FAILED, -1));
            self.execution.set_state(RunState::Terminated);
            return Ok(self.state());
        }
        let controller = self.attachment.require(&self.name)?;
        let result = controller
            .get_mut()
            .submit_job(&self.spec, self.execution.job_mut());
        match result {
            Ok(state) => {
                let state = match state {
                    Some(RunState::Running) => RunState::Running,
                    _ => RunState::Submitted,
                };
                self.execution.set_state(state);
            }
            Err(error) if error.is_recoverable() => {
                log::warn!("Submission of task {} failed: {error}", self.name);
                *self.execution.job_mut() = Default::default();
                self.execution.set_info(format!("Submission failed: {error}"));
            }
            Err(error) => return Err(error),
        }
        Ok(self.state())
    }

    fn update_state(&mut self) -> Result<RunState> {
        if self.state().in_flight() {
            let controller = self.attachment.require(&self.name)?;
            self.poll(&controller);
        }
        Ok(self.state())
    }

    fn kill(&mut self) -> Result<()> {
        match self.state() {
            RunState::Terminated => return Ok(()),
            RunState::New | RunState::Terminating => {}
            _ => {
                if let Some(controller) = self.attachment.get() {
                    if let Err(error) = controller.get_mut().cancel_job(self.execution.job()) {
                        log::warn!("Cannot cancel remote job of task {}: {error}", self.name);
                    }
                }
            }
        }
        self.execution.set_returncode(ReturnCode::cancelled());
        self.execution.set_state(RunState::Terminated);
        Ok(())
    }

    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState> {
        let state = self.state();
        match state {
            RunState::Terminated => return Ok(state),
            RunState::New => {
                return invalid_operation(format!(
                    "task {} has not been submitted, there is no output to fetch",
                    self.name
                ));
            }
            _ => {}
        }
        let controller = self.attachment.require(&self.name)?;
        let directory = output_dir
            .map(Path::to_path_buf)
            .or_else(|| self.spec.output_dir.clone());
        if let Some(directory) = directory {
            std::fs::create_dir_all(&directory)?;
            let result = controller.get_mut().get_results(
                &self.spec,
                self.execution.job(),
                &directory,
                overwrite,
            );
            match result {
                Ok(()) => {}
                Err(GridError::DataStaging(message)) if state == RunState::Terminating => {
                    log::error!("Cannot retrieve output of task {}: {message}", self.name);
                    self.execution
                        .set_returncode(ReturnCode::new(crate::Signal::DATA_STAGING_FAILURE, -1));
                    self.execution
                        .set_info(format!("Output retrieval failed: {message}"));
                    self.execution.set_state(RunState::Terminated);
                    return Ok(self.state());
                }
                Err(error) => return Err(error),
            }
        } else {
            log::debug!(
                "Task {} has no output directory, its results stay on the resource",
                self.name
            );
        }
        if state == RunState::Terminating {
            self.execution.set_state(RunState::Terminated);
        }
        Ok(self.state())
    }

    fn peek(&self, stream: OutputStream, offset: u64, size: Option<u64>) -> Result<Vec<u8>> {
        if self.state() == RunState::New {
            return invalid_operation(format!(
                "task {} has not been submitted yet",
                self.name
            ));
        }
        let Some(file) = self.spec.stream_file(stream) else {
            return invalid_operation(format!(
                "task {} does not capture its {stream:?}",
                self.name
            ));
        };
        let controller = self.attachment.require(&self.name)?;
        let mut buffer = Vec::new();
        controller
            .get_mut()
            .peek(self.execution.job(), file, &mut buffer, offset, size)?;
        Ok(buffer)
    }

    fn free(&mut self) -> Result<()> {
        if self.state() != RunState::Terminated {
            return invalid_operation(format!(
                "task {} is in state {}, only TERMINATED tasks can be freed",
                self.name,
                self.state()
            ));
        }
        if let Some(controller) = self.attachment.get() {
            if self.execution.job().is_submitted() {
                controller.get_mut().free(self.execution.job())?;
            }
        }
        Ok(())
    }

    fn redo(&mut self) -> Result<()> {
        check_redo_allowed(self)?;
        self.execution.reset();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Tasks can be redone from `NEW` or any state in which nothing runs remotely.
pub(crate) fn check_redo_allowed(task: &dyn Task) -> Result<()> {
    match task.state() {
        RunState::New
        | RunState::Stopped
        | RunState::Terminating
        | RunState::Terminated
        | RunState::Unknown => Ok(()),
        state => invalid_operation(format!(
            "task {} is in state {state} and cannot be redone",
            task.name()
        )),
    }
}
