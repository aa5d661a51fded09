//! Batch schedulers driven through their command line tools.
//!
//! Both PBS and Slurm work the same way: a job script is written into a per-job
//! working directory on the (shared) spool directory, submitted with
//! `qsub`/`sbatch`, polled with `qstat`/`scontrol` and cancelled with
//! `qdel`/`scancel`. The scheduler specific parts live in a [`BatchDialect`].
use anyhow::Context;
use bstr::ByteSlice;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use crate::backend::{
    JobStatus, Lrms, ResourceLimits, ResourceStatus, copy_results, job_id, local_path, peek_file,
};
use crate::common::error::GridError;
use crate::run::{JobInfo, RunState};
use crate::task::JobSpec;
use crate::{Map, Result};

pub mod pbs;
pub mod slurm;

pub use pbs::Pbs;
pub use slurm::Slurm;

pub type PbsLrms = BatchLrms<Pbs>;
pub type SlurmLrms = BatchLrms<Slurm>;

/// Name of the script that will be submitted to Slurm/PBS.
const SUBMIT_SCRIPT_NAME: &str = "gridflow-submit.sh";

/// Name of a file that will store the job id of a submitted Slurm/PBS job.
const JOBID_FILE_NAME: &str = "jobid";

const WORKDIR_KEY: &str = "workdir";

/// Executes scheduler commands. Swapped for a scripted fake in tests.
pub trait CommandRunner {
    fn run(&mut self, arguments: &[&str], workdir: &Path) -> anyhow::Result<Output>;
}

pub struct LocalCommandRunner;

impl CommandRunner for LocalCommandRunner {
    fn run(&mut self, arguments: &[&str], workdir: &Path) -> anyhow::Result<Output> {
        let Some((program, args)) = arguments.split_first() else {
            anyhow::bail!("Empty command");
        };
        log::debug!("Running command `{}`", arguments.join(" "));
        Command::new(program)
            .args(args)
            .current_dir(workdir)
            .output()
            .with_context(|| format!("{program} start failed"))
    }
}

pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Scheduler specific commands and output formats.
pub trait BatchDialect {
    /// Type tag, also used as a prefix of job directories.
    fn kind(&self) -> &'static str;

    fn submit_program(&self) -> &'static str;

    fn cancel_program(&self) -> &'static str;

    fn build_script(&self, name: &str, spec: &JobSpec, workdir: &Path) -> String;

    fn parse_job_id(&self, output: &str) -> anyhow::Result<String>;

    fn status_command(&self, job_id: &str) -> Vec<String>;

    /// `Ok(None)` when the scheduler does not know the job (anymore).
    fn parse_status(&self, job_id: &str, output: &[u8]) -> anyhow::Result<Option<JobStatus>>;
}

struct TrackedJob {
    state: RunState,
    cores: u32,
}

pub struct BatchLrms<D> {
    limits: ResourceLimits,
    status: ResourceStatus,
    spooldir: PathBuf,
    dialect: D,
    runner: Box<dyn CommandRunner>,
    jobs: Map<String, TrackedJob>,
    job_counter: u64,
}

impl<D: BatchDialect> BatchLrms<D> {
    pub fn new(limits: ResourceLimits, spooldir: PathBuf, dialect: D) -> Result<Self> {
        Self::with_runner(limits, spooldir, dialect, Box::new(LocalCommandRunner))
    }

    pub fn with_runner(
        limits: ResourceLimits,
        spooldir: PathBuf,
        dialect: D,
        runner: Box<dyn CommandRunner>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&spooldir)?;
        Ok(Self {
            status: ResourceStatus::new(limits.max_cores as i64),
            limits,
            spooldir,
            dialect,
            runner,
            jobs: Map::new(),
            job_counter: 0,
        })
    }

    fn create_job_dir(&mut self) -> std::io::Result<PathBuf> {
        self.job_counter += 1;
        let dir = self.spooldir.join(format!(
            "{}-{}-{:03}",
            self.dialect.kind(),
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            self.job_counter
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn submit_script(&mut self, spec: &JobSpec, directory: &Path) -> anyhow::Result<String> {
        let name = format!("gridflow-{}", self.job_counter);
        let script = self.dialect.build_script(&name, spec, directory);
        let script_path = directory.join(SUBMIT_SCRIPT_NAME);
        std::fs::write(&script_path, script)
            .with_context(|| format!("Cannot write script into {}", script_path.display()))?;

        let program = self.dialect.submit_program();
        let script_path = script_path.display().to_string();
        let output = self.runner.run(&[program, script_path.as_str()], directory)?;
        let output =
            check_command_output(output).with_context(|| format!("{program} execution failed"))?;
        let output = output
            .stdout
            .to_str()
            .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", program, e))?
            .trim()
            .to_string();
        let job_id = self.dialect.parse_job_id(&output)?;

        // Write the job id to the job directory as a debug information
        std::fs::write(directory.join(JOBID_FILE_NAME), &job_id)?;
        Ok(job_id)
    }

    fn query_status(&mut self, job_id: &str, workdir: &Path) -> anyhow::Result<Option<JobStatus>> {
        let arguments = self.dialect.status_command(job_id);
        let arguments: Vec<&str> = arguments.iter().map(String::as_str).collect();
        let output = self.runner.run(&arguments, workdir)?;
        let output = check_command_output(output)
            .with_context(|| format!("{} execution failed", arguments[0]))?;
        log::trace!(
            "{} status output\nStdout\n{}Stderr\n{}",
            self.dialect.kind(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        self.dialect.parse_status(job_id, &output.stdout)
    }
}

fn workdir(job: &JobInfo) -> Result<PathBuf> {
    job.extra
        .get(WORKDIR_KEY)
        .map(PathBuf::from)
        .ok_or_else(|| GridError::UnknownJob("job has no working directory".to_string()))
}

fn stage_inputs(spec: &JobSpec, directory: &Path) -> Result<()> {
    for input in &spec.inputs {
        let source = local_path(input)
            .ok_or_else(|| GridError::DataStaging(format!("cannot stage remote input {input}")))?;
        let file_name = source
            .file_name()
            .ok_or_else(|| GridError::DataStaging(format!("input {input} has no file name")))?;
        std::fs::copy(&source, directory.join(file_name)).map_err(|error| {
            GridError::DataStaging(format!("cannot stage input {input}: {error}"))
        })?;
    }
    Ok(())
}

impl<D: BatchDialect> Lrms for BatchLrms<D> {
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
        if spec.arguments.is_empty() {
            return Err(GridError::Submission(
                "job has no command to execute".to_string(),
            ));
        }
        let directory = self.create_job_dir()?;
        let submitted = match stage_inputs(spec, &directory) {
            Ok(()) => self.submit_script(spec, &directory).map_err(|error| {
                GridError::Submission(format!("resource {}: {error:#}", self.limits.name))
            }),
            Err(error) => Err(error),
        };
        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(error) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&directory) {
                    log::warn!(
                        "Cannot remove job directory {}: {cleanup}",
                        directory.display()
                    );
                }
                return Err(error);
            }
        };
        log::debug!(
            "Submitted job {job_id} to {} resource {}",
            self.dialect.kind(),
            self.limits.name
        );
        self.jobs.insert(
            job_id.clone(),
            TrackedJob {
                state: RunState::Submitted,
                cores: spec.requested_cores,
            },
        );
        job.lrms_jobid = Some(job_id);
        job.resource_name = Some(self.limits.name.clone());
        job.extra
            .insert(WORKDIR_KEY.to_string(), directory.display().to_string());
        Ok(Some(RunState::Submitted))
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        let (Some(id), Ok(workdir)) = (job.lrms_jobid.as_deref(), workdir(job)) else {
            return JobStatus::unknown();
        };
        let status = match self.query_status(id, &workdir) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::debug!("Job {id} is not known to resource {}", self.limits.name);
                JobStatus::unknown()
            }
            Err(error) => {
                log::warn!(
                    "Cannot get state of job {id} from resource {}: {error:#}",
                    self.limits.name
                );
                JobStatus::unknown()
            }
        };
        if let Some(tracked) = self.jobs.get_mut(id) {
            tracked.state = status.state;
        }
        status
    }

    fn get_results(
        &mut self,
        spec: &JobSpec,
        job: &JobInfo,
        download_dir: &Path,
        overwrite: bool,
    ) -> Result<()> {
        copy_results(&workdir(job)?, &spec.result_files(), download_dir, overwrite)
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        let id = job_id(job)?;
        let workdir = workdir(job)?;
        let program = self.dialect.cancel_program();
        log::debug!("Running {} command `{program} {id}`", self.dialect.kind());
        let output = self.runner.run(&[program, id], &workdir)?;
        check_command_output(output)?;
        if let Some(tracked) = self.jobs.get_mut(id) {
            tracked.state = RunState::Terminated;
        }
        Ok(())
    }

    fn peek(
        &mut self,
        job: &JobInfo,
        remote_file: &str,
        sink: &mut dyn Write,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()> {
        peek_file(&workdir(job)?.join(remote_file), sink, offset, size)
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        let mut used_cores = 0;
        let mut user_run = 0;
        let mut user_queued = 0;
        for job in self.jobs.values() {
            match job.state {
                RunState::Submitted => user_queued += 1,
                RunState::Running | RunState::Stopped | RunState::Unknown => user_run += 1,
                _ => continue,
            }
            used_cores += job.cores as i64;
        }
        self.status.free_slots = self.limits.max_cores as i64 - used_cores;
        self.status.user_run = user_run;
        self.status.user_queued = user_queued;
        self.status.queued = user_queued;
        self.status.updated = Some(chrono::Utc::now());
        Ok(&self.status)
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        if let Some(id) = job.lrms_jobid.as_deref() {
            self.jobs.remove(id);
        }
        let workdir = workdir(job)?;
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir)?;
        }
        Ok(())
    }

    fn validate_data(&self, inputs: &[String]) -> bool {
        inputs.iter().all(|input| local_path(input).is_some())
    }
}

/// Format a duration as a PBS/Slurm time string, e.g. 01:05:02
pub(crate) fn format_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Quote an argument for a POSIX shell.
pub(crate) fn shell_quote(argument: &str) -> String {
    if !argument.is_empty()
        && argument
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return argument.to_string();
    }
    format!("'{}'", argument.replace('\'', r"'\''"))
}

/// Common tail of every job script: environment and the command itself.
pub(crate) fn script_body(spec: &JobSpec, workdir: &Path) -> String {
    let mut body = String::new();
    body.push('\n');
    body.push_str(&format!("cd {}\n", shell_quote(&workdir.display().to_string())));
    let mut environment: Vec<_> = spec.environment.iter().collect();
    environment.sort();
    for (key, value) in environment {
        body.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    let command: Vec<String> = spec.arguments.iter().map(|arg| shell_quote(arg)).collect();
    body.push_str(&command.join(" "));
    body.push('\n');
    body
}

pub(crate) fn stream_path(workdir: &Path, file: Option<&str>) -> String {
    match file {
        Some(file) => workdir.join(file).display().to_string(),
        None => "/dev/null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::{ExitStatus, Output};
    use std::rc::Rc;
    use std::time::Duration;

    use super::{BatchLrms, CommandRunner, Pbs, Slurm, format_duration, shell_quote};
    use crate::backend::Lrms;
    use crate::common::error::GridError;
    use crate::run::{JobInfo, ReturnCode, RunState};
    use crate::task::JobSpec;
    use crate::tests::utils::test_limits;

    /// Replays canned outputs and records the commands it was asked to run.
    #[derive(Default, Clone)]
    struct ScriptedRunner {
        outputs: Rc<RefCell<VecDeque<(i32, String)>>>,
        commands: Rc<RefCell<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn push(&self, code: i32, stdout: &str) {
            self.outputs
                .borrow_mut()
                .push_back((code, stdout.to_string()));
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&mut self, arguments: &[&str], _workdir: &Path) -> anyhow::Result<Output> {
            self.commands.borrow_mut().push(arguments.join(" "));
            let (code, stdout) = self
                .outputs
                .borrow_mut()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no output scripted"))?;
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: Vec::new(),
            })
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(&Duration::from_secs(61)), "00:01:01");
        assert_eq!(format_duration(&Duration::from_secs(3661)), "01:01:01");
        assert_eq!(format_duration(&Duration::from_secs(100 * 3600)), "100:00:00");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-arg_1.txt"), "plain-arg_1.txt");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_slurm_lifecycle() {
        let spool = tempfile::TempDir::new().unwrap();
        let runner = ScriptedRunner::default();
        let mut lrms = BatchLrms::with_runner(
            test_limits("cluster"),
            spool.path().to_path_buf(),
            Slurm,
            Box::new(runner.clone()),
        )
        .unwrap();

        runner.push(0, "Submitted batch job 4242\n");
        let mut job = JobInfo::default();
        let state = lrms
            .submit_job(&JobSpec::new(["echo", "hi"]), &mut job)
            .unwrap();
        assert_eq!(state, Some(RunState::Submitted));
        assert_eq!(job.lrms_jobid.as_deref(), Some("4242"));
        assert_eq!(lrms.get_resource_status().unwrap().user_queued, 1);

        runner.push(0, "JobId=4242 JobName=gridflow-1\n   JobState=RUNNING Reason=None\n");
        assert_eq!(lrms.update_job_state(&job).state, RunState::Running);

        runner.push(
            0,
            "JobId=4242 JobName=gridflow-1\n   JobState=FAILED Reason=NonZeroExitCode ExitCode=2:0\n",
        );
        let status = lrms.update_job_state(&job);
        assert_eq!(status.state, RunState::Terminated);
        assert_eq!(status.returncode, Some(ReturnCode::exited(2)));

        // purged from the scheduler
        runner.push(1, "slurm_load_jobs error: Invalid job id specified");
        assert_eq!(lrms.update_job_state(&job).state, RunState::Unknown);

        let commands = runner.commands.borrow();
        assert!(commands[0].starts_with("sbatch "));
        assert_eq!(commands[1], "scontrol show job 4242");
    }

    #[test]
    fn test_pbs_submission_failure() {
        let spool = tempfile::TempDir::new().unwrap();
        let runner = ScriptedRunner::default();
        let mut lrms = BatchLrms::with_runner(
            test_limits("cluster"),
            spool.path().to_path_buf(),
            Pbs,
            Box::new(runner.clone()),
        )
        .unwrap();

        runner.push(38, "qsub: Job exceeds queue resource limits");
        let mut job = JobInfo::default();
        let result = lrms.submit_job(&JobSpec::new(["true"]), &mut job);
        assert!(result.unwrap_err().is_recoverable());
        assert!(job.lrms_jobid.is_none());
        // the job directory does not outlive a rejected submission
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);

        let empty = lrms.submit_job(&JobSpec::new(Vec::<String>::new()), &mut job);
        assert!(matches!(empty, Err(GridError::Submission(_))));
        assert_eq!(runner.commands.borrow().len(), 1);
    }

    #[test]
    fn test_pbs_missing_job_is_unknown() {
        let spool = tempfile::TempDir::new().unwrap();
        let runner = ScriptedRunner::default();
        let mut lrms = BatchLrms::with_runner(
            test_limits("cluster"),
            spool.path().to_path_buf(),
            Pbs,
            Box::new(runner.clone()),
        )
        .unwrap();

        runner.push(0, "1234.pbs-server\n");
        let mut job = JobInfo::default();
        lrms.submit_job(&JobSpec::new(["true"]), &mut job).unwrap();

        runner.push(0, r#"{"timestamp": 1, "Jobs": {}}"#);
        assert_eq!(lrms.update_job_state(&job).state, RunState::Unknown);

        runner.push(0, "not json");
        assert_eq!(lrms.update_job_state(&job).state, RunState::Unknown);

        runner.push(0, "");
        lrms.cancel_job(&job).unwrap();
        assert_eq!(
            runner.commands.borrow().last().unwrap(),
            "qdel 1234.pbs-server"
        );
    }
}
