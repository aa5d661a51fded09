use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use crate::backend::{JobStatus, Lrms, ResourceLimits, ResourceStatus};
use crate::common::error::GridError;
use crate::run::{JobInfo, RunState};
use crate::task::JobSpec;
use crate::Result;

/// Hook that makes sure valid credentials exist before a backend is used.
pub type AuthHook = Rc<dyn Fn() -> anyhow::Result<()>>;

/// Runs an [`AuthHook`] in front of every operation of the wrapped backend.
///
/// When the hook fails, the resource is disabled so that the broker stops
/// selecting it, and the operation fails with [`GridError::Auth`]. Polls report
/// `UNKNOWN` instead of failing.
pub struct Authenticated<L: ?Sized + Lrms> {
    auth: AuthHook,
    inner: Box<L>,
}

impl<L: Lrms> Authenticated<L> {
    pub fn new(inner: L, auth: AuthHook) -> Self {
        Self {
            auth,
            inner: Box::new(inner),
        }
    }
}

impl Authenticated<dyn Lrms> {
    pub fn from_boxed(inner: Box<dyn Lrms>, auth: AuthHook) -> Self {
        Self { auth, inner }
    }
}

impl<L: ?Sized + Lrms> Authenticated<L> {
    pub fn inner(&self) -> &L {
        &self.inner
    }

    fn authenticate(&mut self) -> Result<()> {
        if let Err(error) = (self.auth)() {
            log::error!(
                "Authentication for resource {} failed, disabling it: {error:#}",
                self.inner.name()
            );
            self.inner.set_enabled(false);
            return Err(GridError::Auth(format!(
                "resource {}: {error:#}",
                self.inner.name()
            )));
        }
        Ok(())
    }
}

impl<L: ?Sized + Lrms> Lrms for Authenticated<L> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn limits(&self) -> &ResourceLimits {
        self.inner.limits()
    }

    fn status(&self) -> &ResourceStatus {
        self.inner.status()
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.inner.set_enabled(enabled)
    }

    fn submit_job(&mut self, spec: &JobSpec, job: &mut JobInfo) -> Result<Option<RunState>> {
        self.authenticate()?;
        self.inner.submit_job(spec, job)
    }

    fn update_job_state(&mut self, job: &JobInfo) -> JobStatus {
        match self.authenticate() {
            Ok(()) => self.inner.update_job_state(job),
            Err(_) => JobStatus::unknown(),
        }
    }

    fn get_results(
        &mut self,
        spec: &JobSpec,
        job: &JobInfo,
        download_dir: &Path,
        overwrite: bool,
    ) -> Result<()> {
        self.authenticate()?;
        self.inner.get_results(spec, job, download_dir, overwrite)
    }

    fn cancel_job(&mut self, job: &JobInfo) -> Result<()> {
        self.authenticate()?;
        self.inner.cancel_job(job)
    }

    fn peek(
        &mut self,
        job: &JobInfo,
        remote_file: &str,
        sink: &mut dyn Write,
        offset: u64,
        size: Option<u64>,
    ) -> Result<()> {
        self.authenticate()?;
        self.inner.peek(job, remote_file, sink, offset, size)
    }

    fn get_resource_status(&mut self) -> Result<&ResourceStatus> {
        self.authenticate()?;
        self.inner.get_resource_status()
    }

    fn free(&mut self, job: &JobInfo) -> Result<()> {
        self.authenticate()?;
        self.inner.free(job)
    }

    fn validate_data(&self, inputs: &[String]) -> bool {
        self.inner.validate_data(inputs)
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::backend::noop::NoOpLrms;
    use crate::backend::{Authenticated, Lrms};
    use crate::common::error::GridError;
    use crate::run::{JobInfo, RunState};
    use crate::task::JobSpec;
    use crate::tests::utils::test_limits;

    #[test]
    fn test_hook_runs_before_each_call() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut lrms = Authenticated::new(
            NoOpLrms::new(test_limits("noop"), Some(1)),
            Rc::new(move || -> anyhow::Result<()> {
                counter.set(counter.get() + 1);
                Ok(())
            }),
        );

        let mut job = JobInfo::default();
        lrms.submit_job(&JobSpec::new(["true"]), &mut job).unwrap();
        lrms.update_job_state(&job);
        assert_eq!(calls.get(), 2);
        assert!(lrms.status().enabled);
    }

    #[test]
    fn test_failed_hook_disables_resource() {
        let mut lrms = Authenticated::new(
            NoOpLrms::new(test_limits("noop"), Some(1)),
            Rc::new(|| -> anyhow::Result<()> { anyhow::bail!("certificate expired") }),
        );

        let mut job = JobInfo::default();
        let result = lrms.submit_job(&JobSpec::new(["true"]), &mut job);
        assert!(matches!(result, Err(GridError::Auth(_))));
        assert!(!lrms.status().enabled);
        assert_eq!(lrms.update_job_state(&job).state, RunState::Unknown);
    }
}
