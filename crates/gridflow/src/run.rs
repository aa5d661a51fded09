use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Map;

/// Lifecycle state of a task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    New,
    Submitted,
    Running,
    Stopped,
    Terminating,
    Terminated,
    Unknown,
}

impl RunState {
    pub const ALL: [RunState; 7] = [
        RunState::New,
        RunState::Submitted,
        RunState::Running,
        RunState::Stopped,
        RunState::Terminating,
        RunState::Terminated,
        RunState::Unknown,
    ];

    #[inline]
    pub fn is_terminal(self) -> bool {
        self == RunState::Terminated
    }

    /// States in which the remote side owns the job and must be polled.
    #[inline]
    pub fn in_flight(self) -> bool {
        matches!(
            self,
            RunState::Submitted | RunState::Running | RunState::Stopped | RunState::Unknown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::New => "NEW",
            RunState::Submitted => "SUBMITTED",
            RunState::Running => "RUNNING",
            RunState::Stopped => "STOPPED",
            RunState::Terminating => "TERMINATING",
            RunState::Terminated => "TERMINATED",
            RunState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pseudo-signal numbers used to report middleware errors in [`ReturnCode::signal`].
pub struct Signal;

impl Signal {
    /// The job was lost on the remote side.
    pub const LOST: i32 = 120;
    pub const CANCELLED: i32 = 121;
    pub const REMOTE_KILL: i32 = 122;
    pub const DATA_STAGING_FAILURE: i32 = 123;
    pub const REMOTE_ERROR: i32 = 124;
    pub const SUBMISSION_FAILED: i32 = 125;
}

/// Termination status of a job as a `(signal, exitcode)` pair.
///
/// Unlike a POSIX wait status both halves can be significant: a middleware error
/// (reported as one of the [`Signal`] pseudo-signals) may happen after the program
/// itself exited.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReturnCode {
    pub signal: i32,
    pub exitcode: i32,
}

impl ReturnCode {
    pub const OK: ReturnCode = ReturnCode {
        signal: 0,
        exitcode: 0,
    };

    #[inline]
    pub fn new(signal: i32, exitcode: i32) -> Self {
        Self { signal, exitcode }
    }

    #[inline]
    pub fn exited(exitcode: i32) -> Self {
        Self::new(0, exitcode)
    }

    #[inline]
    pub fn cancelled() -> Self {
        Self::new(Signal::CANCELLED, -1)
    }

    /// Convert the exit status of a POSIX shell: values above 128 mean that the last
    /// program was killed by signal `rc - 128`, and then there is no exit code.
    pub fn from_shell_exit(rc: i32) -> Self {
        if rc > 128 {
            Self::new(rc - 128, -1)
        } else {
            Self::exited(rc)
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.signal == 0 && self.exitcode == 0
    }

    /// Ordering used when several failures have to be collapsed into one:
    /// any signal is worse than any exit code, then larger numbers are worse.
    pub(crate) fn badness(&self) -> (bool, i32, i32) {
        (self.signal != 0, self.signal, self.exitcode)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.signal, self.exitcode)
    }
}

/// Backend-side bookkeeping attached to a job by [`crate::backend::Lrms::submit_job`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobInfo {
    pub lrms_jobid: Option<String>,
    pub resource_name: Option<String>,
    #[serde(default)]
    pub extra: Map<String, String>,
}

impl JobInfo {
    pub fn is_submitted(&self) -> bool {
        self.lrms_jobid.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Execution record of a task.
///
/// Everything is readable from outside, but state and return code are changed
/// only by the owning task's own lifecycle methods.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    state: RunState,
    returncode: Option<ReturnCode>,
    exitcode: Option<i32>,
    info: Option<String>,
    history: Vec<HistoryEntry>,
    last_change: DateTime<Utc>,
    job: JobInfo,
    #[serde(skip)]
    changed: bool,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            state: RunState::New,
            returncode: None,
            exitcode: None,
            info: None,
            history: Vec::new(),
            last_change: Utc::now(),
            job: JobInfo::default(),
            changed: true,
        }
    }
}

impl Execution {
    #[inline]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[inline]
    pub fn returncode(&self) -> Option<ReturnCode> {
        self.returncode
    }

    /// Exit code, defaults to the exit code half of the return code unless it was
    /// overridden (collections report a summary exit code of their own).
    #[inline]
    pub fn exitcode(&self) -> Option<i32> {
        self.exitcode.or_else(|| self.returncode.map(|rc| rc.exitcode))
    }

    #[inline]
    pub fn signal(&self) -> Option<i32> {
        self.returncode.map(|rc| rc.signal)
    }

    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn last_change(&self) -> DateTime<Utc> {
        self.last_change
    }

    pub fn job(&self) -> &JobInfo {
        &self.job
    }

    #[inline]
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn mark_saved(&mut self) {
        self.changed = false;
    }

    /// The return code as reported to a parent: the exit code half is replaced by
    /// the overridden exit code, if any.
    pub fn outcome(&self) -> Option<ReturnCode> {
        self.returncode.map(|rc| ReturnCode {
            signal: rc.signal,
            exitcode: self.exitcode.unwrap_or(rc.exitcode),
        })
    }

    /// `TERMINATED` with no signal and a zero exit code.
    pub fn is_ok(&self) -> bool {
        self.state == RunState::Terminated
            && self.returncode.is_some_and(|rc| rc.signal == 0)
            && self.exitcode() == Some(0)
    }

    /// `TERMINATED` with a nonzero (or missing) return code.
    pub fn is_failed(&self) -> bool {
        self.state == RunState::Terminated && !self.is_ok()
    }

    /// Returns `true` if the state actually changed.
    pub(crate) fn set_state(&mut self, state: RunState) -> bool {
        if self.state == state {
            return false;
        }
        if self.state == RunState::Terminated {
            log::warn!("Refusing transition from state TERMINATED to state {state}");
            return false;
        }
        let message = if state == RunState::Terminated {
            match self.returncode {
                Some(rc) => format!(
                    "Transition from state {} to state {state} (returncode: {rc})",
                    self.state
                ),
                None => format!("Transition from state {} to state {state}", self.state),
            }
        } else {
            format!("Transition from state {} to state {state}", self.state)
        };
        log::debug!("{message}");
        self.state = state;
        self.push_history(message);
        true
    }

    pub(crate) fn set_returncode(&mut self, returncode: ReturnCode) {
        if self.returncode != Some(returncode) {
            self.returncode = Some(returncode);
            self.exitcode = None;
            self.changed = true;
        }
    }

    pub(crate) fn set_exitcode(&mut self, exitcode: i32) {
        self.exitcode = Some(exitcode);
        self.changed = true;
    }

    pub(crate) fn set_info(&mut self, info: impl Into<String>) {
        let info = info.into();
        self.push_history(info.clone());
        self.info = Some(info);
    }

    pub(crate) fn job_mut(&mut self) -> &mut JobInfo {
        self.changed = true;
        &mut self.job
    }

    pub(crate) fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Put the record back into `NEW`, the only way out of `TERMINATED`.
    pub(crate) fn reset(&mut self) {
        if self.state != RunState::New {
            let message = format!("Transition from state {} to state NEW", self.state);
            log::debug!("{message}");
            self.state = RunState::New;
            self.push_history(message);
        }
        self.returncode = None;
        self.exitcode = None;
        self.job = JobInfo::default();
        self.changed = true;
    }

    fn push_history(&mut self, message: String) {
        let now = Utc::now();
        self.last_change = now;
        self.history.push(HistoryEntry { time: now, message });
        self.changed = true;
    }
}
