use nix::sys::signal::{Signal as PosixSignal, kill};
use nix::unistd::Pid;
use std::fs::File;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tempfile::TempDir;

use crate::backend::{
    JobStatus, Lrms, ResourceLimits, ResourceStatus, copy_results, job_id, local_path, peek_file,
};
use crate::common::error::GridError;
use crate::run::{JobInfo, ReturnCode, RunState};
use crate::task::JobSpec;
use crate::{Map, Result};

struct LocalJob {
    sandbox: TempDir,
    cores: u32,
    child: Option<Child>,
    returncode: Option<ReturnCode>,
}

impl LocalJob {
    fn is_running(&self) -> bool {
        self.returncode.is_none()
    }

    /// A return code recorded by a cancellation is kept even if the process
    /// exits afterwards with the signal it was sent.
    fn reap(&mut self) -> std::io::Result<()> {
        if let Some(child) = &mut self.child {
            if let Some(status) = child.try_wait()? {
                if self.returncode.is_none() {
                    self.returncode = Some(exit_status_to_returncode(status));
                }
                self.child = None;
            }
        }
        Ok(())
    }
}

fn exit_status_to_returncode(status: ExitStatus) -> ReturnCode {
    match (status.code(), status.signal()) {
        (Some(code), _) => ReturnCode::exited(code),
        (None, Some(signal)) => ReturnCode::new(signal, -1),
        (None, None) => ReturnCode::new(crate::Signal::REMOTE_ERROR, -1),
    }
}

/// Runs jobs as child processes of the current process, each one inside its own
/// sandbox directory under the spool directory.
pub struct ShellcmdLrms {
    limits: ResourceLimits,
    status: ResourceStatus,
    spooldir: PathBuf,
    jobs: Map<String, LocalJob>,
    job_counter: u64,
}

impl ShellcmdLrms {
    pub fn new(limits: ResourceLimits, spooldir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&spooldir)?;
        Ok(Self {
            status: ResourceStatus::new(limits.max_cores as i64),
            limits,
            spooldir,
            jobs: Map::new(),
            job_counter: 0,
        })
    }

    fn used_cores(&self) -> u32 {
        self.jobs
            .values()
            .filter(|job| job.is_running())
            .map(|job| job.cores)
            .sum()
    }

    fn sandbox(&self, job: &JobInfo) -> Result<&Path> {
        let id = job_id(job)?;
        self.jobs
            .get(id)
            .map(|job| job.sandbox.path())
            .ok_or_else(|| GridError::UnknownJob(id.to_string()))
    }

    fn stage_inputs(&self, spec: &JobSpec, sandbox: &Path) -> Result<()> {
        for input in &spec.inputs {
            let source = local_path(input).ok_or_else(|| {
                GridError::DataStaging(format!("cannot stage remote input {input}"))
            })?;
            let file_name = source.file_name().ok_or_else(|| {
                GridError::DataStaging(format!("input {input} has no file name"))
            })?;
            std::fs::copy(&source, sandbox.join(file_name)).map_err(|error| {
                GridError::DataStaging(format!("cannot stage input {input}: {error}"))
            })?;
        }
        Ok(())
    }

    fn create_stream(sandbox: &Path, file: Option<&str>) -> Result<Option<File>> {
        Ok(match file {
            Some(file) => Some(File::create(sandbox.join(file))?),
            None => None,
        })
    }
}

impl Lrms for ShellcmdLrms {
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
        let Some((program, args)) = spec.arguments.split_first() else {
            return Err(GridError::Submission(
                "job has no command to execute".to_string(),
            ));
        };
        let free_cores = self.limits.max_cores.saturating_sub(self.used_cores());
        if spec.requested_cores > free_cores {
            return Err(GridError::Submission(format!(
                "resource {}: {} cores requested, only {free_cores} free",
                self.limits.name, spec.requested_cores
            )));
        }

        let sandbox = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.spooldir)?;
        self.stage_inputs(spec, sandbox.path())?;

        let stdout = Self::create_stream(sandbox.path(), spec.stdout.as_deref())?;
        let stderr = match (&stdout, spec.join) {
            (Some(stdout), true) => Some(stdout.try_clone()?),
            _ => Self::create_stream(sandbox.path(), spec.stderr.as_deref())?,
        };
        let stdout = stdout.map(Stdio::from).unwrap_or_else(Stdio::null);
        let stderr = stderr.map(Stdio::from).unwrap_or_else(Stdio::null);

        log::debug!(
            "Running command `{}` in {}",
            spec.arguments.join(" "),
            sandbox.path().display()
        );
        let child = Command::new(program)
            .args(args)
            .envs(&spec.environment)
            .current_dir(sandbox.path())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|error| {
                GridError::Submission(format!("cannot start `{program}`: {error}"))
            })?;

        self.job_counter += 1;
        let id = format!("{}.{}", child.id(), self.job_counter);
        job.lrms_jobid = Some(id.clone());
        job.resource_name = Some(self.limits.name.clone());
        job.extra.insert(
            "sandbox".to_string(),
            sandbox.path().display().to_string(),
        );
        self.jobs.insert(
            id,
            LocalJob {
                sandbox,
                cores: spec.requested_cores,
                child: Some(child),
                returncode: None,
            },
        );
        Ok(Some(RunState::Running))
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        let Some(local) = job
            .lrms_jobid
            .as_deref()
            .and_then(|id| self.jobs.get_mut(id))
        else {
            return JobStatus::unknown();
        };
        if let Err(error) = local.reap() {
            log::warn!("Cannot query local process: {error}");
            return JobStatus::unknown();
        }
        match local.returncode {
            Some(returncode) => JobStatus::terminated(returncode),
            None => JobStatus::new(RunState::Running),
        }
    }

    fn get_results(
        &mut self,
        spec: &JobSpec,
        job: &JobInfo,
        download_dir: &Path,
        overwrite: bool,
    ) -> Result<()> {
        let sandbox = self.sandbox(job)?;
        copy_results(sandbox, &spec.result_files(), download_dir, overwrite)
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        let id = job_id(job)?;
        let Some(local) = self.jobs.get_mut(id) else {
            return Err(GridError::UnknownJob(id.to_string()));
        };
        local.reap()?;
        if let (Some(child), None) = (&local.child, local.returncode) {
            let pid = Pid::from_raw(child.id() as i32);
            log::debug!("Sending SIGTERM to local job {id} (pid {pid})");
            kill(pid, PosixSignal::SIGTERM)
                .map_err(|error| GridError::Generic(format!("cannot kill {pid}: {error}")))?;
            local.returncode = Some(ReturnCode::cancelled());
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
        let sandbox = self.sandbox(job)?;
        peek_file(&sandbox.join(remote_file), sink, offset, size)
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        for local in self.jobs.values_mut() {
            local.reap()?;
        }
        let used = self.used_cores();
        self.status.free_slots = self.limits.max_cores as i64 - used as i64;
        self.status.user_run = self.jobs.values().filter(|job| job.is_running()).count() as u32;
        self.status.updated = Some(chrono::Utc::now());
        Ok(&self.status)
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        let id = job_id(job)?;
        if let Some(mut local) = self.jobs.remove(id) {
            if let Some(child) = &mut local.child {
                // reap the process if it exited after being signalled
                let _ = child.try_wait();
            }
            log::debug!("Removing sandbox {}", local.sandbox.path().display());
            local.sandbox.close()?;
        }
        Ok(())
    }

    fn validate_data(&self, inputs: &[String]) -> bool {
        inputs.iter().all(|input| local_path(input).is_some())
    }

    fn close(&mut self) {
        let running: Vec<_> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        if !running.is_empty() {
            log::warn!(
                "Closing resource {} with {} jobs still running",
                self.limits.name,
                running.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::ShellcmdLrms;
    use crate::backend::{JobStatus, Lrms};
    use crate::run::{JobInfo, ReturnCode, RunState};
    use crate::task::JobSpec;
    use crate::tests::utils::test_limits;

    fn wait_for_termination(lrms: &mut ShellcmdLrms, job: &JobInfo) -> JobStatus {
        let start = Instant::now();
        loop {
            let status = lrms.update_job_state(job);
            if status.state == RunState::Terminated || start.elapsed() > Duration::from_secs(10) {
                return status;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_run_and_collect_output() {
        let spool = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        let mut lrms = ShellcmdLrms::new(test_limits("local"), spool.path().to_path_buf()).unwrap();

        let spec = JobSpec::new(["sh", "-c", "echo hello; exit 3"]);
        let mut job = JobInfo::default();
        assert_eq!(
            lrms.submit_job(&spec, &mut job).unwrap(),
            Some(RunState::Running)
        );

        let status = wait_for_termination(&mut lrms, &job);
        assert_eq!(status.state, RunState::Terminated);
        assert_eq!(status.returncode, Some(ReturnCode::exited(3)));

        let mut sink = Vec::new();
        lrms.peek(&job, "stdout.txt", &mut sink, 0, Some(5)).unwrap();
        assert_eq!(sink, b"hello");

        lrms.get_results(&spec, &job, results.path(), false).unwrap();
        let stdout = std::fs::read_to_string(results.path().join("stdout.txt")).unwrap();
        assert_eq!(stdout, "hello\n");

        lrms.free(&job).unwrap();
        assert_eq!(lrms.update_job_state(&job).state, RunState::Unknown);
    }

    #[test]
    fn test_results_are_not_overwritten() {
        let spool = tempfile::TempDir::new().unwrap();
        let results = tempfile::TempDir::new().unwrap();
        std::fs::write(results.path().join("stdout.txt"), "old").unwrap();
        let mut lrms = ShellcmdLrms::new(test_limits("local"), spool.path().to_path_buf()).unwrap();

        let spec = JobSpec::new(["sh", "-c", "echo new"]);
        let mut job = JobInfo::default();
        lrms.submit_job(&spec, &mut job).unwrap();
        wait_for_termination(&mut lrms, &job);

        lrms.get_results(&spec, &job, results.path(), false).unwrap();
        assert_eq!(
            std::fs::read_to_string(results.path().join("stdout.txt")).unwrap(),
            "old"
        );
        lrms.get_results(&spec, &job, results.path(), true).unwrap();
        assert_eq!(
            std::fs::read_to_string(results.path().join("stdout.txt")).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn test_inputs_are_staged() {
        let spool = tempfile::TempDir::new().unwrap();
        let inputs = tempfile::TempDir::new().unwrap();
        let input = inputs.path().join("data.txt");
        std::fs::write(&input, "payload").unwrap();
        let mut lrms = ShellcmdLrms::new(test_limits("local"), spool.path().to_path_buf()).unwrap();

        let mut spec = JobSpec::new(["cat", "data.txt"]);
        spec.inputs.push(input.display().to_string());
        let mut job = JobInfo::default();
        lrms.submit_job(&spec, &mut job).unwrap();
        let status = wait_for_termination(&mut lrms, &job);
        assert_eq!(status.returncode, Some(ReturnCode::OK));

        let mut sink = Vec::new();
        lrms.peek(&job, "stdout.txt", &mut sink, 0, None).unwrap();
        assert_eq!(sink, b"payload");
    }

    #[test]
    fn test_cancel_running_job() {
        let spool = tempfile::TempDir::new().unwrap();
        let mut lrms = ShellcmdLrms::new(test_limits("local"), spool.path().to_path_buf()).unwrap();
        let mut job = JobInfo::default();
        lrms.submit_job(&JobSpec::new(["sleep", "30"]), &mut job).unwrap();
        assert_eq!(lrms.status().free_slots, 8);
        assert_eq!(lrms.get_resource_status().unwrap().free_slots, 7);

        lrms.cancel_job(&job).unwrap();
        let status = lrms.update_job_state(&job);
        assert_eq!(status.returncode, Some(ReturnCode::cancelled()));
        assert_eq!(lrms.get_resource_status().unwrap().free_slots, 8);
    }

    #[test]
    fn test_missing_input_fails_submission() {
        let spool = tempfile::TempDir::new().unwrap();
        let mut lrms = ShellcmdLrms::new(test_limits("local"), spool.path().to_path_buf()).unwrap();
        let mut spec = JobSpec::new(["true"]);
        spec.inputs.push("/nonexistent/input.txt".to_string());
        let mut job = JobInfo::default();
        assert!(lrms.submit_job(&spec, &mut job).is_err());
        assert!(job.lrms_jobid.is_none());
    }
}
