use std::path::Path;

use crate::common::error::{GridError, invalid_operation};
use crate::delegate_collection_accessors;
use crate::run::{ReturnCode, RunState};
use crate::task::Task;
use crate::workflow::TaskCollection;
use crate::Result;

/// What a sequence does after one of its tasks terminated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// End the sequence. Without an explicit return code, the sequence reports the
    /// return code of its last task, or the worst one if any task failed.
    Terminate(Option<ReturnCode>),
    /// Run the task following the one that terminated.
    Continue,
    /// Halt the sequence in `STOPPED` until it is redone or resubmitted.
    Stop,
    /// Run the task at the given index, rerunning it if it already ran.
    Goto(usize),
}

/// Decides how a [`SequentialTaskCollection`] continues.
///
/// `next` is called once the task at index `done` reached `TERMINATED`. A policy
/// may grow the sequence by adding tasks to `tasks` before returning. An error
/// is propagated to whoever advanced the sequence.
pub trait SequencePolicy {
    fn next(&mut self, done: usize, tasks: &mut TaskCollection) -> Result<Next>;
}

fn is_last(done: usize, tasks: &TaskCollection) -> bool {
    done + 1 >= tasks.len()
}

/// Run every task once, in order.
#[derive(Copy, Clone, Debug, Default)]
pub struct InOrder;

impl SequencePolicy for InOrder {
    fn next(&mut self, done: usize, tasks: &mut TaskCollection) -> Result<Next> {
        if is_last(done, tasks) {
            Ok(Next::Terminate(None))
        } else {
            Ok(Next::Continue)
        }
    }
}

/// Terminate the sequence as soon as a task fails.
#[derive(Copy, Clone, Debug, Default)]
pub struct AbortOnError;

impl SequencePolicy for AbortOnError {
    fn next(&mut self, done: usize, tasks: &mut TaskCollection) -> Result<Next> {
        if is_last(done, tasks) {
            return Ok(Next::Terminate(None));
        }
        Ok(match tasks.get(done).map(|task| task.execution()) {
            Some(execution) if execution.is_failed() => Next::Terminate(execution.outcome()),
            _ => Next::Continue,
        })
    }
}

/// Stop the sequence as soon as a task fails, so that it can be fixed and resumed.
#[derive(Copy, Clone, Debug, Default)]
pub struct StopOnError;

impl SequencePolicy for StopOnError {
    fn next(&mut self, done: usize, tasks: &mut TaskCollection) -> Result<Next> {
        if is_last(done, tasks) {
            return Ok(Next::Terminate(None));
        }
        Ok(match tasks.get(done) {
            Some(task) if task.execution().is_failed() => Next::Stop,
            _ => Next::Continue,
        })
    }
}

/// Runs its tasks one at a time. At most one task is ever active.
pub struct SequentialTaskCollection<P: SequencePolicy = InOrder> {
    collection: TaskCollection,
    policy: P,
    /// Index of the active task, `None` until the sequence is first submitted.
    current: Option<usize>,
}

impl<P: SequencePolicy + Default> SequentialTaskCollection<P> {
    pub fn new(name: impl Into<String>, tasks: Vec<Box<dyn Task>>) -> Result<Self> {
        Self::with_policy(name, tasks, P::default())
    }
}

impl<P: SequencePolicy> SequentialTaskCollection<P> {
    pub fn with_policy(
        name: impl Into<String>,
        tasks: Vec<Box<dyn Task>>,
        policy: P,
    ) -> Result<Self> {
        let name = name.into();
        if tasks.is_empty() {
            return Err(GridError::InvalidArgument(format!(
                "sequence {name} needs at least one task"
            )));
        }
        Ok(Self::from_collection(TaskCollection::new(name, tasks), policy))
    }

    /// No emptiness check: staged collections may be born without tasks.
    pub(crate) fn from_collection(collection: TaskCollection, policy: P) -> Self {
        Self {
            collection,
            policy,
            current: None,
        }
    }

    pub fn collection(&self) -> &TaskCollection {
        &self.collection
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Index of the task that is currently executing.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// The task that is currently executing.
    pub fn stage(&self) -> Option<&dyn Task> {
        self.current.and_then(|index| self.collection.get(index))
    }

    /// Append a task; it runs after the tasks already in the sequence.
    pub fn add(&mut self, task: Box<dyn Task>) -> Result<usize> {
        self.collection.add(task)
    }

    /// Rewind the sequence to `from_stage` and reset it to `NEW`, so that the tasks
    /// from there on run again. Redoing from `len()` continues a terminated
    /// sequence by asking the policy for the next step.
    pub fn redo_from(&mut self, from_stage: usize) -> Result<()> {
        let len = self.collection.len();
        if from_stage > len {
            return Err(GridError::InvalidArgument(format!(
                "cannot redo sequence {} from stage {from_stage}, it only has {len} tasks",
                self.collection.name()
            )));
        }
        if len == 0 {
            return invalid_operation(format!(
                "sequence {} has no tasks to redo",
                self.collection.name()
            ));
        }
        if from_stage < len {
            self.collection.redo_from(from_stage)?;
            self.current = Some(from_stage);
            return Ok(());
        }
        let last = len - 1;
        if self.collection.tasks()[last].state() != RunState::Terminated {
            return invalid_operation(format!(
                "cannot continue sequence {}, its last task has not terminated",
                self.collection.name()
            ));
        }
        let execution = self.collection.execution_mut();
        execution.reset();
        execution.set_state(RunState::Running);
        self.current = Some(last);
        self.advance()?;
        Ok(())
    }

    /// Recompute the state from the active task, moving on to the next task when
    /// the active one terminated. Does not poll.
    fn advance(&mut self) -> Result<RunState> {
        let state = self.collection.state();
        if state == RunState::Terminated {
            return Ok(state);
        }
        let Some(index) = self.current else {
            return Ok(state);
        };
        let task_state = self.collection.tasks()[index].state();
        if index == 0 && matches!(task_state, RunState::New | RunState::Submitted) {
            if state == RunState::New {
                self.collection.execution_mut().set_state(task_state);
            }
            return Ok(self.collection.state());
        }
        let new_state = match task_state {
            RunState::Terminated => return self.task_done(index),
            RunState::Stopped => RunState::Stopped,
            _ => RunState::Running,
        };
        self.collection.execution_mut().set_state(new_state);
        Ok(new_state)
    }

    fn task_done(&mut self, done: usize) -> Result<RunState> {
        let target = match self.policy.next(done, &mut self.collection)? {
            Next::Terminate(returncode) => return Ok(self.terminate(done, returncode)),
            Next::Stop => {
                self.collection.execution_mut().set_state(RunState::Stopped);
                return Ok(RunState::Stopped);
            }
            Next::Continue if done + 1 >= self.collection.len() => {
                return Ok(self.terminate(done, None));
            }
            Next::Continue => done + 1,
            Next::Goto(index) if index >= self.collection.len() => {
                return Err(GridError::InvalidArgument(format!(
                    "sequence {} has no task at index {index}",
                    self.collection.name()
                )));
            }
            Next::Goto(index) => index,
        };
        log::debug!(
            "Sequence {} moves from task {done} to task {target}",
            self.collection.name()
        );
        self.current = Some(target);
        let task = &mut self.collection.tasks_mut()[target];
        let resubmit = task.state() != RunState::New;
        task.submit(resubmit)?;
        self.collection.execution_mut().set_state(RunState::Running);
        Ok(RunState::Running)
    }

    fn terminate(&mut self, last: usize, returncode: Option<ReturnCode>) -> RunState {
        let returncode = returncode
            .or_else(|| self.collection.worst_failure())
            .or_else(|| {
                self.collection
                    .get(last)
                    .and_then(|task| task.execution().outcome())
            })
            .unwrap_or(ReturnCode::OK);
        self.collection.finish(returncode)
    }
}

impl<P: SequencePolicy + 'static> Task for SequentialTaskCollection<P> {
    delegate_collection_accessors!(collection);

    /// Start the active task. Resubmitting a terminated sequence starts it over.
    fn submit(&mut self, resubmit: bool) -> Result<RunState> {
        let state = self.collection.state();
        if state != RunState::New && !resubmit {
            return invalid_operation(format!(
                "sequence {} is in state {state}, only NEW tasks can be submitted",
                self.collection.name()
            ));
        }
        if self.collection.is_empty() {
            if state != RunState::Terminated {
                self.collection.finish(ReturnCode::OK);
            }
            return Ok(self.collection.state());
        }
        if state == RunState::Terminated {
            self.collection.redo_from(0)?;
            self.current = None;
        }
        let index = *self.current.get_or_insert(0);
        let task = &mut self.collection.tasks_mut()[index];
        let resubmit_task = task.state() != RunState::New;
        task.submit(resubmit_task)?;
        let new_state = match task.state() {
            RunState::New => RunState::New,
            RunState::Submitted => RunState::Submitted,
            _ => RunState::Running,
        };
        if new_state != RunState::New {
            self.collection.execution_mut().set_state(new_state);
        }
        Ok(self.collection.state())
    }

    fn update_state(&mut self) -> Result<RunState> {
        if let Some(index) = self.current {
            let task = &mut self.collection.tasks_mut()[index];
            if !matches!(task.state(), RunState::New | RunState::Terminated) {
                task.update_state()?;
            }
        }
        self.advance()
    }

    /// Kill the active task and cancel the ones that did not run yet.
    fn kill(&mut self) -> Result<()> {
        if self.collection.state() == RunState::Terminated {
            return Ok(());
        }
        self.collection.kill_from(self.current.unwrap_or(0))?;
        self.collection.finish(ReturnCode::cancelled());
        Ok(())
    }

    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState> {
        self.collection.fetch_children(output_dir, overwrite)?;
        self.advance()
    }

    fn redo(&mut self) -> Result<()> {
        self.redo_from(0)
    }

    fn progress(&mut self) -> Result<RunState> {
        if self.collection.state() == RunState::Terminated {
            return Ok(RunState::Terminated);
        }
        let Some(index) = self.current else {
            return self.submit(false);
        };
        self.collection.tasks_mut()[index].progress()?;
        self.advance()
    }
}
