use std::path::Path;

use crate::common::error::invalid_operation;
use crate::delegate_collection_accessors;
use crate::run::{ReturnCode, RunState};
use crate::task::Task;
use crate::workflow::{TaskCollection, TaskStats};
use crate::Result;

/// Collective state is the first of these held by at least one child.
const STATE_PRIORITY: [RunState; 6] = [
    RunState::Stopped,
    RunState::Running,
    RunState::Submitted,
    RunState::Unknown,
    RunState::Terminating,
    RunState::Terminated,
];

/// Runs all of its tasks at the same time.
///
/// The collection terminates once every task terminated. Failed tasks do not fail
/// the collection: its return code is always `(0, 0)`, and its exit code is `1`
/// when at least one task failed.
pub struct ParallelTaskCollection {
    collection: TaskCollection,
}

impl ParallelTaskCollection {
    pub fn new(name: impl Into<String>, tasks: Vec<Box<dyn Task>>) -> Self {
        Self {
            collection: TaskCollection::new(name, tasks),
        }
    }

    pub fn collection(&self) -> &TaskCollection {
        &self.collection
    }

    pub(crate) fn collection_mut(&mut self) -> &mut TaskCollection {
        &mut self.collection
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        self.collection.tasks()
    }

    pub fn stats(&self) -> TaskStats {
        self.collection.stats()
    }

    pub fn add(&mut self, task: Box<dyn Task>) -> Result<usize> {
        self.collection.add(task)
    }

    pub fn remove(&mut self, index: usize) -> Result<Box<dyn Task>> {
        self.collection.remove(index)
    }

    pub(crate) fn update_children(&mut self) -> Result<()> {
        for task in self.collection.tasks_mut() {
            if !matches!(task.state(), RunState::New | RunState::Terminated) {
                task.update_state()?;
            }
        }
        Ok(())
    }

    pub(crate) fn progress_children(&mut self) -> Result<()> {
        for task in self.collection.tasks_mut() {
            if task.state() != RunState::Terminated {
                task.progress()?;
            }
        }
        Ok(())
    }

    /// Derive the collective state from the children.
    pub(crate) fn recompute(&mut self) -> RunState {
        let current = self.collection.state();
        if current == RunState::Terminated {
            return current;
        }
        if self.collection.is_empty() {
            log::warn!(
                "Parallel collection {} has no tasks, terminating it",
                self.collection.name()
            );
            return self.collection.finish(ReturnCode::OK);
        }
        let stats = self.collection.stats();
        if stats[RunState::Terminated] == stats.total {
            let execution = self.collection.execution_mut();
            execution.set_returncode(ReturnCode::OK);
            if stats.failed > 0 {
                execution.set_exitcode(1);
            }
            execution.set_state(RunState::Terminated);
            return RunState::Terminated;
        }
        let state = if stats[RunState::New] + stats[RunState::Terminated] == stats.total
            && stats[RunState::Terminated] > 0
        {
            RunState::Running
        } else {
            STATE_PRIORITY
                .into_iter()
                .find(|&state| stats[state] > 0)
                .unwrap_or(RunState::New)
        };
        if state != current {
            self.collection.execution_mut().set_state(state);
        }
        state
    }
}

impl Task for ParallelTaskCollection {
    delegate_collection_accessors!(collection);

    /// Submit every task that is `NEW`; with `resubmit`, restart the others too.
    fn submit(&mut self, resubmit: bool) -> Result<RunState> {
        let state = self.collection.state();
        if state != RunState::New && !resubmit {
            return invalid_operation(format!(
                "parallel collection {} is in state {state}, only NEW tasks can be submitted",
                self.collection.name()
            ));
        }
        if state == RunState::Terminated {
            self.collection.execution_mut().reset();
        }
        for task in self.collection.tasks_mut() {
            if task.state() == RunState::New {
                task.submit(false)?;
            } else if resubmit {
                task.submit(true)?;
            }
        }
        Ok(self.recompute())
    }

    fn update_state(&mut self) -> Result<RunState> {
        self.update_children()?;
        Ok(self.recompute())
    }

    fn kill(&mut self) -> Result<()> {
        if self.collection.state() == RunState::Terminated {
            return Ok(());
        }
        self.collection.kill_from(0)?;
        self.collection.finish(ReturnCode::cancelled());
        Ok(())
    }

    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState> {
        self.collection.fetch_children(output_dir, overwrite)?;
        Ok(self.recompute())
    }

    fn redo(&mut self) -> Result<()> {
        self.collection.redo_from(0)
    }

    fn progress(&mut self) -> Result<RunState> {
        if self.collection.state() == RunState::Terminated {
            return Ok(RunState::Terminated);
        }
        self.progress_children()?;
        Ok(self.recompute())
    }
}
