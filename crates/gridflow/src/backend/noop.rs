use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::Path;

use crate::backend::{JobStatus, Lrms, ResourceLimits, ResourceStatus, job_id};
use crate::common::error::GridError;
use crate::run::{JobInfo, ReturnCode, RunState};
use crate::task::JobSpec;
use crate::{Map, Result};

/// For each state, the list of `(probability, target state)` transitions tried on
/// every poll. Remaining probability mass keeps the job in its state.
pub type TransitionGraph = Map<RunState, Vec<(f64, RunState)>>;

/// SUBMITTED -> RUNNING -> TERMINATED, one step per poll.
pub fn normal_transition_graph() -> TransitionGraph {
    let mut graph = TransitionGraph::new();
    graph.insert(RunState::Submitted, vec![(1.0, RunState::Running)]);
    graph.insert(RunState::Running, vec![(1.0, RunState::Terminated)]);
    graph
}

struct FakeJob {
    state: RunState,
    cores: u32,
    memory: u64,
}

/// Simulated resource: accounts slots and memory like a real one, but every job
/// just walks through the transition graph and terminates successfully.
pub struct NoOpLrms {
    limits: ResourceLimits,
    status: ResourceStatus,
    transition_graph: TransitionGraph,
    available_memory: u64,
    jobs: Map<String, FakeJob>,
    job_counter: u64,
    rng: SmallRng,
}

impl NoOpLrms {
    pub fn new(limits: ResourceLimits, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Self {
            status: ResourceStatus::new(limits.max_cores as i64),
            available_memory: limits.max_cores as u64 * limits.max_memory_per_core,
            limits,
            transition_graph: normal_transition_graph(),
            jobs: Map::new(),
            job_counter: 0,
            rng,
        }
    }

    pub fn with_transition_graph(mut self, graph: TransitionGraph) -> Self {
        self.transition_graph = graph;
        self
    }

    fn release(&mut self, job: &FakeJob) {
        self.status.free_slots += job.cores as i64;
        self.available_memory += job.memory;
    }
}

impl Lrms for NoOpLrms {
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
        let free_slots = self.status.free_slots - spec.requested_cores as i64;
        if free_slots <= 0 {
            return Err(GridError::Submission(format!(
                "resource {} already running maximum allowed number of jobs ({})",
                self.limits.name, self.limits.max_cores
            )));
        }
        let memory = spec.requested_memory.unwrap_or(0) * spec.requested_cores as u64;
        if memory > self.available_memory {
            return Err(GridError::Submission(format!(
                "resource {} does not have enough memory: {memory} GB requested, {} GB available",
                self.limits.name, self.available_memory
            )));
        }
        log::debug!("Faking execution of command `{}`", spec.arguments.join(" "));

        self.job_counter += 1;
        let id = format!("noop-{}", self.job_counter);
        self.status.free_slots = free_slots;
        self.available_memory -= memory;
        self.status.queued += 1;
        self.status.user_queued += 1;
        self.jobs.insert(
            id.clone(),
            FakeJob {
                state: RunState::Submitted,
                cores: spec.requested_cores,
                memory,
            },
        );
        job.lrms_jobid = Some(id);
        job.resource_name = Some(self.limits.name.clone());
        Ok(Some(RunState::Submitted))
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        let Some(id) = job.lrms_jobid.as_deref() else {
            return JobStatus::unknown();
        };
        let Some(current) = self.jobs.get(id).map(|job| job.state) else {
            log::debug!("NoOp resource {} has no job {id}", self.limits.name);
            return JobStatus::unknown();
        };
        let mut target = current;
        if let Some(transitions) = self.transition_graph.get(&current) {
            let mut dice: f64 = self.rng.random();
            for &(probability, state) in transitions {
                if dice < probability {
                    target = state;
                    break;
                }
                dice -= probability;
            }
        }
        if target != current {
            log::debug!("NoOp job {id} transitions from {current} to {target}");
            if current == RunState::Submitted {
                self.status.queued = self.status.queued.saturating_sub(1);
                self.status.user_queued = self.status.user_queued.saturating_sub(1);
            }
            if current == RunState::Running {
                self.status.user_run = self.status.user_run.saturating_sub(1);
            }
            if target == RunState::Running {
                self.status.user_run += 1;
            }
            if matches!(target, RunState::Terminating | RunState::Terminated) {
                if let Some(fake) = self.jobs.remove(id) {
                    self.release(&fake);
                }
                self.jobs.insert(
                    id.to_string(),
                    FakeJob {
                        state: RunState::Terminated,
                        cores: 0,
                        memory: 0,
                    },
                );
                return JobStatus::terminated(ReturnCode::OK);
            }
            if let Some(fake) = self.jobs.get_mut(id) {
                fake.state = target;
            }
        }
        if target == RunState::Terminated {
            return JobStatus::terminated(ReturnCode::OK);
        }
        JobStatus::new(target)
    }

    fn get_results(
        &mut self,
        spec: &JobSpec,
        _job: &JobInfo,
        _download_dir: &Path,
        _overwrite: bool,
    ) -> Result<()> {
        if !spec.outputs.is_empty() {
            return Err(GridError::DataStaging(
                "retrieval of output files is not supported by the noop backend".to_string(),
            ));
        }
        Ok(())
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        let id = job_id(job)?;
        let Some(fake) = self.jobs.remove(id) else {
            return Ok(());
        };
        match fake.state {
            RunState::Running => {
                self.status.user_run = self.status.user_run.saturating_sub(1);
            }
            RunState::Submitted => {
                self.status.user_queued = self.status.user_queued.saturating_sub(1);
                self.status.queued = self.status.queued.saturating_sub(1);
            }
            _ => {}
        }
        self.release(&fake);
        Ok(())
    }

    fn peek(
        &mut self,
        _job: &JobInfo,
        _remote_file: &str,
        _sink: &mut dyn Write,
        _offset: u64,
        _size: Option<u64>,
    ) -> Result<()> {
        Err(GridError::InvalidOperation(
            "peek is not supported by the noop backend".to_string(),
        ))
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        self.status.updated = Some(chrono::Utc::now());
        Ok(&self.status)
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        if let Some(id) = job.lrms_jobid.as_deref() {
            self.jobs.remove(id);
        }
        Ok(())
    }

    /// No I/O is possible here, so only plain local references are accepted.
    fn validate_data(&self, inputs: &[String]) -> bool {
        inputs.iter().all(|input| !input.contains("://"))
    }
}

#[cfg(test)]
mod tests {
    use super::{NoOpLrms, TransitionGraph};
    use crate::backend::Lrms;
    use crate::run::{JobInfo, ReturnCode, RunState};
    use crate::task::JobSpec;
    use crate::tests::utils::test_limits;

    #[test]
    fn test_normal_progression() {
        let mut lrms = NoOpLrms::new(test_limits("noop"), Some(0));
        let mut job = JobInfo::default();
        let state = lrms.submit_job(&JobSpec::new(["true"]), &mut job).unwrap();
        assert_eq!(state, Some(RunState::Submitted));
        assert_eq!(lrms.status().user_queued, 1);

        assert_eq!(lrms.update_job_state(&job).state, RunState::Running);
        assert_eq!(lrms.status().user_run, 1);
        assert_eq!(lrms.status().user_queued, 0);

        let status = lrms.update_job_state(&job);
        assert_eq!(status.state, RunState::Terminated);
        assert_eq!(status.returncode, Some(ReturnCode::OK));
        assert_eq!(lrms.status().free_slots, 8);

        // polling a finished job is idempotent
        assert_eq!(lrms.update_job_state(&job).state, RunState::Terminated);
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut limits = test_limits("noop");
        limits.max_cores = 2;
        limits.max_cores_per_job = 2;
        let mut lrms = NoOpLrms::new(limits, Some(0));

        let mut first = JobInfo::default();
        lrms.submit_job(&JobSpec::new(["true"]), &mut first).unwrap();
        let mut second = JobInfo::default();
        assert!(lrms.submit_job(&JobSpec::new(["true"]), &mut second).is_err());

        lrms.cancel_job(&first).unwrap();
        assert!(lrms.submit_job(&JobSpec::new(["true"]), &mut second).is_ok());
    }

    #[test]
    fn test_unknown_job() {
        let mut lrms = NoOpLrms::new(test_limits("noop"), Some(0));
        let job = JobInfo {
            lrms_jobid: Some("noop-42".to_string()),
            ..Default::default()
        };
        assert_eq!(lrms.update_job_state(&job).state, RunState::Unknown);
    }

    #[test]
    fn test_custom_graph_keeps_job_stopped() {
        let mut graph = TransitionGraph::new();
        graph.insert(RunState::Submitted, vec![(1.0, RunState::Stopped)]);
        let mut lrms = NoOpLrms::new(test_limits("noop"), Some(3)).with_transition_graph(graph);
        let mut job = JobInfo::default();
        lrms.submit_job(&JobSpec::new(["true"]), &mut job).unwrap();
        assert_eq!(lrms.update_job_state(&job).state, RunState::Stopped);
        assert_eq!(lrms.update_job_state(&job).state, RunState::Stopped);
    }

    #[test]
    fn test_validate_data() {
        let lrms = NoOpLrms::new(test_limits("noop"), Some(0));
        assert!(lrms.validate_data(&["input.txt".to_string()]));
        assert!(!lrms.validate_data(&["http://example.org/input.txt".to_string()]));
    }
}
