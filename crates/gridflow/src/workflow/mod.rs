//! Composite tasks.
//!
//! Every collection owns its children through a [`TaskCollection`] and
//! implements [`Task`] itself, so collections nest freely. The state of a
//! collection is never set from outside: it is recomputed from the children
//! every time the collection is advanced.
use serde::Serialize;
use std::ops::Index;
use std::path::Path;

use crate::backend::LrmsRef;
use crate::common::error::{GridError, invalid_operation};
use crate::run::{Execution, ReturnCode, RunState};
use crate::task::{Attachment, Task, TaskId};
use crate::Result;

pub mod dependent;
pub mod parallel;
pub mod retry;
pub mod sequential;
pub mod staged;
pub mod sweep;

pub use dependent::DependentTaskCollection;
pub use parallel::ParallelTaskCollection;
pub use retry::{RetryOnExitCodes, RetryOnFailure, RetryPolicy, RetryableTask};
pub use sequential::{
    AbortOnError, InOrder, Next, SequencePolicy, SequentialTaskCollection, StopOnError,
};
pub use staged::{Stage, StageFn, StagedTaskCollection, Stages};
pub use sweep::{ChunkedParameterSweep, TaskFactory};

/// Per-state counts of a set of tasks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    states: [usize; RunState::ALL.len()],
    /// `TERMINATED` and successful.
    pub ok: usize,
    /// `TERMINATED` with a nonzero return code.
    pub failed: usize,
    pub total: usize,
}

impl TaskStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a dyn Task>) -> Self {
        let mut stats = TaskStats::default();
        for task in tasks {
            stats.add(task);
        }
        stats
    }

    pub fn add(&mut self, task: &dyn Task) {
        let execution = task.execution();
        self.states[execution.state() as usize] += 1;
        if execution.is_ok() {
            self.ok += 1;
        } else if execution.is_failed() {
            self.failed += 1;
        }
        self.total += 1;
    }

    pub fn count(&self, state: RunState) -> usize {
        self.states[state as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (RunState, usize)> + '_ {
        RunState::ALL
            .iter()
            .map(|&state| (state, self.count(state)))
    }

    /// Tasks that are neither `NEW` nor `TERMINATED`.
    pub fn active(&self) -> usize {
        self.total - self.count(RunState::New) - self.count(RunState::Terminated)
    }
}

impl Index<RunState> for TaskStats {
    type Output = usize;

    fn index(&self, state: RunState) -> &usize {
        &self.states[state as usize]
    }
}

/// Identity, execution record and children shared by all collections.
pub struct TaskCollection {
    id: TaskId,
    name: String,
    execution: Execution,
    attachment: Attachment,
    tasks: Vec<Box<dyn Task>>,
}

impl TaskCollection {
    pub fn new(name: impl Into<String>, tasks: Vec<Box<dyn Task>>) -> Self {
        Self {
            id: TaskId::next(),
            name: name.into(),
            execution: Execution::default(),
            attachment: Attachment::default(),
            tasks,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    #[inline]
    pub(crate) fn execution_mut(&mut self) -> &mut Execution {
        &mut self.execution
    }

    #[inline]
    pub fn state(&self) -> RunState {
        self.execution.state()
    }

    pub fn changed(&self) -> bool {
        self.execution.changed() || self.tasks.iter().any(|task| task.changed())
    }

    pub fn mark_saved(&mut self) {
        self.execution.mark_saved();
        for task in &mut self.tasks {
            task.mark_saved();
        }
    }

    pub fn controller(&self) -> Option<&LrmsRef> {
        self.attachment.get()
    }

    pub fn attach(&mut self, controller: &LrmsRef) -> Result<()> {
        self.attachment.attach(controller, &self.name)?;
        for task in &mut self.tasks {
            task.attach(controller)?;
        }
        Ok(())
    }

    pub fn detach(&mut self) {
        self.attachment.detach();
        for task in &mut self.tasks {
            task.detach();
        }
    }

    #[inline]
    pub fn tasks(&self) -> &[Box<dyn Task>] {
        &self.tasks
    }

    #[inline]
    pub(crate) fn tasks_mut(&mut self) -> &mut [Box<dyn Task>] {
        &mut self.tasks
    }

    pub fn get(&self, index: usize) -> Option<&dyn Task> {
        self.tasks.get(index).map(|task| task.as_ref())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Append a task, attaching it to the collection's controller. Returns its index.
    pub fn add(&mut self, mut task: Box<dyn Task>) -> Result<usize> {
        match self.attachment.get() {
            Some(controller) => task.attach(controller)?,
            None => task.detach(),
        }
        self.tasks.push(task);
        self.execution.mark_changed();
        Ok(self.tasks.len() - 1)
    }

    /// Move every task out, leaving the collection empty. Tasks stay attached.
    pub(crate) fn take_tasks(&mut self) -> Vec<Box<dyn Task>> {
        self.execution.mark_changed();
        std::mem::take(&mut self.tasks)
    }

    /// Take a task out of the collection; it is returned detached.
    pub fn remove(&mut self, index: usize) -> Result<Box<dyn Task>> {
        if index >= self.tasks.len() {
            return Err(GridError::InvalidArgument(format!(
                "collection {} has no task at index {index}",
                self.name
            )));
        }
        let mut task = self.tasks.remove(index);
        task.detach();
        self.execution.mark_changed();
        Ok(task)
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats::from_tasks(self.tasks.iter().map(|task| task.as_ref()))
    }

    /// Counts only the children of concrete type `T`.
    pub fn stats_of<T: Task>(&self) -> TaskStats {
        self.stats_matching(|task| task.as_any().is::<T>())
    }

    pub fn stats_matching(&self, only: impl Fn(&dyn Task) -> bool) -> TaskStats {
        TaskStats::from_tasks(
            self.tasks
                .iter()
                .map(|task| task.as_ref())
                .filter(|task| only(*task)),
        )
    }

    pub fn free(&mut self) -> Result<()> {
        if self.state() != RunState::Terminated {
            return invalid_operation(format!(
                "collection {} is in state {}, only TERMINATED tasks can be freed",
                self.name,
                self.state()
            ));
        }
        for task in &mut self.tasks {
            if task.state() == RunState::Terminated {
                task.free()?;
            }
        }
        Ok(())
    }

    /// Fetch the output of every child that ran and is not `TERMINATED` yet.
    /// With an explicit directory, each child gets a subdirectory named after it.
    pub(crate) fn fetch_children(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<()> {
        for task in &mut self.tasks {
            if matches!(task.state(), RunState::New | RunState::Terminated) {
                continue;
            }
            let directory = output_dir.map(|dir| dir.join(task.name()));
            task.fetch_output(directory.as_deref(), overwrite)?;
        }
        Ok(())
    }

    /// Reset the given children and the collection itself to `NEW`.
    pub(crate) fn redo_from(&mut self, from: usize) -> Result<()> {
        check_redo_allowed_collection(self)?;
        for task in self.tasks.iter_mut().skip(from) {
            if task.state() != RunState::New {
                task.redo()?;
            }
        }
        self.execution.reset();
        Ok(())
    }

    /// Kill every child that has not terminated yet.
    pub(crate) fn kill_from(&mut self, from: usize) -> Result<()> {
        for task in self.tasks.iter_mut().skip(from) {
            task.kill()?;
        }
        Ok(())
    }

    /// Terminate the collection itself with `returncode`.
    pub(crate) fn finish(&mut self, returncode: ReturnCode) -> RunState {
        self.execution.set_returncode(returncode);
        self.execution.set_state(RunState::Terminated);
        RunState::Terminated
    }

    /// Worst outcome among the failed children, if any failed.
    pub(crate) fn worst_failure(&self) -> Option<ReturnCode> {
        self.tasks
            .iter()
            .filter(|task| task.execution().is_failed())
            .filter_map(|task| task.execution().outcome())
            .max_by_key(|rc| rc.badness())
    }
}

fn check_redo_allowed_collection(collection: &TaskCollection) -> Result<()> {
    match collection.state() {
        RunState::Submitted | RunState::Running => invalid_operation(format!(
            "collection {} is in state {} and cannot be redone",
            collection.name(),
            collection.state()
        )),
        _ => Ok(()),
    }
}

/// Copy the outcome of `from` into `to`, keeping an overridden exit code.
pub(crate) fn copy_outcome(from: &Execution, to: &mut Execution) {
    if let Some(rc) = from.returncode() {
        to.set_returncode(rc);
        if let Some(exitcode) = from.exitcode() {
            if exitcode != rc.exitcode {
                to.set_exitcode(exitcode);
            }
        }
    }
}
