use std::cmp::Reverse;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::backend::{JobStatus, Lrms, LrmsRef, ResourceLimits, ResourceStatus};
use crate::common::error::GridError;
use crate::run::{JobInfo, RunState};
use crate::task::JobSpec;
use crate::{Result, Set};

/// Controller that spreads jobs over several resources.
///
/// Every job goes to the matching resource with the most free slots; once a job
/// is submitted, all further calls for it are routed to the resource recorded in
/// its [`JobInfo::resource_name`].
pub struct Broker {
    limits: ResourceLimits,
    status: ResourceStatus,
    resources: Vec<LrmsRef>,
}

impl Broker {
    pub fn new(resources: Vec<LrmsRef>) -> Result<Self> {
        if resources.is_empty() {
            return Err(GridError::NoResources(
                "no resources configured".to_string(),
            ));
        }
        let mut limits = ResourceLimits {
            name: "broker".to_string(),
            architecture: Set::new(),
            max_cores: 0,
            max_cores_per_job: 0,
            max_memory_per_core: 0,
            max_walltime: Duration::ZERO,
        };
        for resource in &resources {
            let resource = resource.get();
            let other = resource.limits();
            limits.architecture.extend(other.architecture.iter().copied());
            limits.max_cores += other.max_cores;
            limits.max_cores_per_job = limits.max_cores_per_job.max(other.max_cores_per_job);
            limits.max_memory_per_core = limits.max_memory_per_core.max(other.max_memory_per_core);
            limits.max_walltime = limits.max_walltime.max(other.max_walltime);
        }
        let mut broker = Self {
            status: ResourceStatus::new(0),
            limits,
            resources,
        };
        broker.aggregate_status();
        Ok(broker)
    }

    pub fn resources(&self) -> &[LrmsRef] {
        &self.resources
    }

    pub fn get_resource(&self, name: &str) -> Option<&LrmsRef> {
        self.resources
            .iter()
            .find(|resource| resource.get().name() == name)
    }

    fn route(&self, job: &JobInfo) -> Result<&LrmsRef> {
        let Some(name) = job.resource_name.as_deref() else {
            return Err(GridError::UnknownJob(
                "job was not submitted to any resource".to_string(),
            ));
        };
        self.get_resource(name)
            .ok_or_else(|| GridError::UnknownJob(format!("no resource named {name}")))
    }

    /// Resources that could run `spec`, best candidate first.
    fn candidates(&self, spec: &JobSpec) -> Vec<LrmsRef> {
        let mut candidates: Vec<(i64, LrmsRef)> = self
            .resources
            .iter()
            .filter_map(|resource| {
                let lrms = resource.get();
                if !lrms.status().enabled {
                    log::debug!("Resource {} is disabled", lrms.name());
                    return None;
                }
                if let Err(reason) = lrms.limits().check_job(spec) {
                    log::debug!("Resource {} does not match job: {reason}", lrms.name());
                    return None;
                }
                if !lrms.validate_data(&spec.inputs) {
                    log::debug!("Resource {} cannot stage the job inputs", lrms.name());
                    return None;
                }
                Some((lrms.status().free_slots, resource.clone()))
            })
            .collect();
        candidates.sort_by_key(|(free_slots, _)| Reverse(*free_slots));
        candidates.into_iter().map(|(_, resource)| resource).collect()
    }

    fn aggregate_status(&mut self) {
        let mut status = ResourceStatus::new(0);
        status.enabled = false;
        for resource in &self.resources {
            let resource = resource.get();
            let other = resource.status();
            if !other.enabled {
                continue;
            }
            status.enabled = true;
            status.free_slots += other.free_slots;
            status.user_run += other.user_run;
            status.user_queued += other.user_queued;
            status.queued += other.queued;
        }
        status.updated = Some(chrono::Utc::now());
        self.status = status;
    }
}

impl Lrms for Broker {
    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn status(&self) -> &ResourceStatus {
        &self.status
    }

    fn set_enabled(&mut self, enabled: bool) {
        for resource in &self.resources {
            resource.get_mut().set_enabled(enabled);
        }
        self.aggregate_status();
    }

    fn submit_job(&mut self, spec: &JobSpec, job: &mut JobInfo) -> Result<Option<RunState>> {
        let candidates = self.candidates(spec);
        if candidates.is_empty() {
            return Err(GridError::NoResources(format!(
                "no enabled resource can run `{}`",
                spec.arguments.join(" ")
            )));
        }
        let mut last_error = None;
        for resource in candidates {
            let name = resource.get().name().to_string();
            log::debug!("Submitting job to resource {name}");
            let result = resource.get_mut().submit_job(spec, job);
            match result {
                Ok(state) => {
                    job.resource_name = Some(name);
                    self.aggregate_status();
                    return Ok(state);
                }
                Err(error) => {
                    log::warn!("Resource {name} rejected job: {error}");
                    *job = JobInfo::default();
                    last_error = Some(error);
                }
            }
        }
        self.aggregate_status();
        Err(last_error
            .unwrap_or_else(|| GridError::NoResources("every resource failed".to_string())))
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        match self.route(job) {
            Ok(resource) => resource.get_mut().update_job_state(job),
            Err(error) => {
                log::warn!("Cannot poll job: {error}");
                JobStatus::unknown()
            }
        }
    }

    fn get_results(
        &mut self,
        spec: &JobSpec,
        job: &JobInfo,
        download_dir: &Path,
        overwrite: bool,
    ) -> Result<()> {
        self.route(job)?
            .get_mut()
            .get_results(spec, job, download_dir, overwrite)
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        let result = self.route(job)?.get_mut().cancel_job(job);
        self.aggregate_status();
        result
    }

    fn peek(
        &mut self,
        job: &JobInfo,
        remote_file: &str,
        sink: &mut dyn Write,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()> {
        self.route(job)?
            .get_mut()
            .peek(job, remote_file, sink, offset, size)
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        for resource in &self.resources {
            let mut lrms = resource.get_mut();
            if !lrms.status().enabled {
                continue;
            }
            if let Err(error) = lrms.get_resource_status() {
                log::warn!("Cannot update status of resource {}: {error}", lrms.name());
            }
        }
        self.aggregate_status();
        Ok(&self.status)
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        self.route(job)?.get_mut().free(job)
    }

    fn validate_data(&self, inputs: &[String]) -> bool {
        self.resources.iter().any(|resource| {
            let lrms = resource.get();
            lrms.status().enabled && lrms.validate_data(inputs)
        })
    }

    fn close(&mut self) {
        for resource in &self.resources {
            resource.get_mut().close();
        }
    }
}
