use std::any::Any;
use std::path::Path;

use crate::backend::LrmsRef;
use crate::common::error::invalid_operation;
use crate::run::{Execution, RunState};
use crate::task::{Attachment, OutputStream, Task, TaskId, check_redo_allowed};
use crate::workflow::copy_outcome;
use crate::{Result, Set};

/// Decides whether a terminated task is run again.
pub trait RetryPolicy {
    /// `retried` counts the retries done so far. A `max_retries` of 0 means no limit.
    fn retry(&self, task: &dyn Task, retried: u32, max_retries: u32) -> bool;
}

fn below_limit(retried: u32, max_retries: u32) -> bool {
    max_retries == 0 || retried < max_retries
}

/// Retry every failed run.
#[derive(Copy, Clone, Debug, Default)]
pub struct RetryOnFailure;

impl RetryPolicy for RetryOnFailure {
    fn retry(&self, task: &dyn Task, retried: u32, max_retries: u32) -> bool {
        task.execution().is_failed() && below_limit(retried, max_retries)
    }
}

/// Retry only runs that exited with one of the given exit codes.
#[derive(Clone, Debug, Default)]
pub struct RetryOnExitCodes(pub Set<i32>);

impl RetryPolicy for RetryOnExitCodes {
    fn retry(&self, task: &dyn Task, retried: u32, max_retries: u32) -> bool {
        let execution = task.execution();
        execution.is_failed()
            && execution
                .exitcode()
                .is_some_and(|code| self.0.contains(&code))
            && below_limit(retried, max_retries)
    }
}

/// Runs the wrapped task again each time it terminates, for as long as the policy
/// allows it. Once the policy gives up, the wrapper terminates with the outcome of
/// the last run.
pub struct RetryableTask<P: RetryPolicy = RetryOnFailure> {
    id: TaskId,
    execution: Execution,
    attachment: Attachment,
    task: Box<dyn Task>,
    retried: u32,
    max_retries: u32,
    policy: P,
}

impl RetryableTask {
    pub fn new(task: Box<dyn Task>, max_retries: u32) -> Self {
        Self::with_policy(task, max_retries, RetryOnFailure)
    }
}

impl<P: RetryPolicy> RetryableTask<P> {
    pub fn with_policy(task: Box<dyn Task>, max_retries: u32, policy: P) -> Self {
        Self {
            id: TaskId::next(),
            execution: Execution::default(),
            attachment: Attachment::default(),
            task,
            retried: 0,
            max_retries,
            policy,
        }
    }

    pub fn inner(&self) -> &dyn Task {
        self.task.as_ref()
    }

    pub fn inner_mut(&mut self) -> &mut dyn Task {
        self.task.as_mut()
    }

    pub fn into_inner(self) -> Box<dyn Task> {
        self.task
    }

    pub fn retried(&self) -> u32 {
        self.retried
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Bring the own state in line with the wrapped task, retrying it when it just
    /// terminated.
    fn reconcile(&mut self) -> Result<RunState> {
        let own = self.execution.state();
        if own == RunState::Terminated {
            return Ok(own);
        }
        let inner = self.task.state();
        if inner != RunState::Terminated {
            let state = merge_states(own, inner);
            self.execution.set_state(state);
            return Ok(state);
        }

        copy_outcome(self.task.execution(), &mut self.execution);
        if self
            .policy
            .retry(self.task.as_ref(), self.retried, self.max_retries)
        {
            self.retried += 1;
            log::info!(
                "Task {} terminated with {:?}, retrying ({}/{})",
                self.task.name(),
                self.task.execution().outcome(),
                self.retried,
                self.max_retries
            );
            self.task.submit(true)?;
            self.execution.set_state(RunState::Running);
        } else {
            self.execution.set_state(RunState::Terminated);
        }
        Ok(self.execution.state())
    }
}

/// Own state of the wrapper given its previous state and the state of the wrapped
/// task, which has not just terminated.
fn merge_states(own: RunState, task: RunState) -> RunState {
    use RunState::*;

    if own == task {
        return own;
    }
    match own {
        New => match task {
            Submitted | Running | Stopped | Unknown => task,
            _ => Running,
        },
        Submitted => match task {
            New | Submitted => Submitted,
            Running | Terminating | Terminated => Running,
            _ => task,
        },
        Running => match task {
            Stopped | Unknown => task,
            _ => Running,
        },
        Terminating | Terminated => {
            debug_assert_eq!(task, Terminated, "terminated wrapper around a live task");
            Terminated
        }
        Stopped | Unknown => match task {
            New | Submitted | Running | Terminating | Terminated => Running,
            _ => own,
        },
    }
}

impl<P: RetryPolicy + 'static> Task for RetryableTask<P> {
    fn id(&self) -> TaskId {
        self.id
    }

    /// Same as the wrapped task.
    fn name(&self) -> &str {
        self.task.name()
    }

    fn execution(&self) -> &Execution {
        &self.execution
    }

    fn changed(&self) -> bool {
        self.execution.changed() || self.task.changed()
    }

    fn mark_saved(&mut self) {
        self.execution.mark_saved();
        self.task.mark_saved();
    }

    fn controller(&self) -> Option<&LrmsRef> {
        self.attachment.get()
    }

    fn attach(&mut self, controller: &LrmsRef) -> Result<()> {
        self.attachment.attach(controller, self.task.name())?;
        self.task.attach(controller)
    }

    fn detach(&mut self) {
        self.attachment.detach();
        self.task.detach();
    }

    fn submit(&mut self, resubmit: bool) -> Result<RunState> {
        let state = self.execution.state();
        if state != RunState::New && !resubmit {
            return invalid_operation(format!(
                "task {} is in state {state}, only NEW tasks can be submitted",
                self.name()
            ));
        }
        if state == RunState::Terminated {
            self.execution.reset();
            self.retried = 0;
        }
        let resubmit_task = self.task.state() != RunState::New;
        self.task.submit(resubmit_task)?;
        if self.task.state() == RunState::New {
            return Ok(self.execution.state());
        }
        self.reconcile()
    }

    fn update_state(&mut self) -> Result<RunState> {
        if !matches!(self.task.state(), RunState::New | RunState::Terminated) {
            self.task.update_state()?;
        }
        self.reconcile()
    }

    fn kill(&mut self) -> Result<()> {
        if self.execution.state() == RunState::Terminated {
            return Ok(());
        }
        self.task.kill()?;
        copy_outcome(self.task.execution(), &mut self.execution);
        if self.task.state() == RunState::Terminated {
            self.execution.set_state(RunState::Terminated);
        }
        Ok(())
    }

    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState> {
        self.task.fetch_output(output_dir, overwrite)?;
        self.reconcile()
    }

    fn peek(&self, stream: OutputStream, offset: u64, size: Option<u64>) -> Result<Vec<u8>> {
        self.task.peek(stream, offset, size)
    }

    fn free(&mut self) -> Result<()> {
        self.task.free()
    }

    fn redo(&mut self) -> Result<()> {
        check_redo_allowed(self)?;
        self.task.redo()?;
        self.retried = 0;
        self.execution.reset();
        Ok(())
    }

    fn progress(&mut self) -> Result<RunState> {
        let state = self.execution.state();
        if state == RunState::Terminated {
            return Ok(state);
        }
        if state == RunState::New && self.task.state() == RunState::New {
            return self.submit(false);
        }
        self.task.progress()?;
        self.reconcile()
    }

    fn children(&self) -> &[Box<dyn Task>] {
        std::slice::from_ref(&self.task)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use crate::run::{ReturnCode, RunState};
    use crate::task::{Application, OutputStream, Task};
    use crate::tests::utils::{app, exited, run_to_completion, running, scripted_controller};
    use crate::workflow::retry::merge_states;
    use crate::workflow::{RetryOnExitCodes, RetryableTask};
    use crate::Set;

    #[test]
    fn test_gives_up_after_max_retries() {
        let (controller, handle) = scripted_controller();
        handle.get_mut().set_script("fail", vec![exited(1)]);
        let mut task = RetryableTask::new(app("fail"), 2);
        task.attach(&controller).unwrap();

        let mut retried = vec![];
        while task.state() != RunState::Terminated {
            task.progress().unwrap();
            assert!(task.retried() <= 2);
            if retried.last() != Some(&task.retried()) {
                retried.push(task.retried());
            }
        }
        assert_eq!(retried, vec![0, 1, 2]);
        assert_eq!(task.retried(), 2);
        assert_eq!(task.execution().returncode(), Some(ReturnCode::exited(1)));
        assert_eq!(handle.get().count("submit"), 3);
    }

    #[test]
    fn test_successful_task_is_not_retried() {
        let (controller, handle) = scripted_controller();
        let mut task = RetryableTask::new(app("ok"), 3);
        task.attach(&controller).unwrap();
        run_to_completion(&mut task, 10);
        assert_eq!(task.retried(), 0);
        assert!(task.execution().is_ok());
        assert_eq!(handle.get().count("submit"), 1);
    }

    #[test]
    fn test_unlimited_retries() {
        let (controller, handle) = scripted_controller();
        handle.get_mut().set_script("flaky", vec![exited(1)]);
        let mut task = RetryableTask::new(app("flaky"), 0);
        task.attach(&controller).unwrap();

        for _ in 0..30 {
            task.progress().unwrap();
            if task.retried() == 5 {
                handle.get_mut().set_script("flaky", vec![running(), exited(0)]);
            }
        }
        assert_eq!(task.state(), RunState::Terminated);
        assert!(task.execution().is_ok());
        // the run started by the fifth retry still follows the old script
        assert_eq!(task.retried(), 6);
    }

    #[test]
    fn test_retry_on_exit_codes() {
        let (controller, handle) = scripted_controller();
        handle.get_mut().set_script("a", vec![exited(3)]);
        let mut task =
            RetryableTask::with_policy(app("a"), 5, RetryOnExitCodes(Set::from_iter([2])));
        task.attach(&controller).unwrap();
        run_to_completion(&mut task, 10);
        assert_eq!(task.retried(), 0);
        assert_eq!(task.execution().exitcode(), Some(3));

        handle.get_mut().set_script("b", vec![exited(2)]);
        let mut task =
            RetryableTask::with_policy(app("b"), 2, RetryOnExitCodes(Set::from_iter([2])));
        task.attach(&controller).unwrap();
        run_to_completion(&mut task, 20);
        assert_eq!(task.retried(), 2);
    }

    #[test]
    fn test_kill_keeps_returncode_of_terminated_task() {
        let (controller, _) = scripted_controller();
        let mut task = RetryableTask::new(app("ok"), 1);
        task.attach(&controller).unwrap();
        run_to_completion(&mut task, 10);

        task.kill().unwrap();
        assert_eq!(task.execution().returncode(), Some(ReturnCode::OK));
        assert_eq!(task.inner().execution().returncode(), Some(ReturnCode::OK));
    }

    #[test]
    fn test_kill_cancels_wrapped_task() {
        let (controller, handle) = scripted_controller();
        let mut task = RetryableTask::new(app("long"), 1);
        task.attach(&controller).unwrap();
        task.submit(false).unwrap();
        assert_eq!(task.state(), RunState::Submitted);

        task.kill().unwrap();
        task.kill().unwrap();
        assert_eq!(task.state(), RunState::Terminated);
        assert_eq!(task.execution().returncode(), Some(ReturnCode::cancelled()));
        assert_eq!(task.retried(), 0);
        assert_eq!(handle.get().count("cancel"), 1);
    }

    #[test]
    fn test_redo_resets_retries() {
        let (controller, handle) = scripted_controller();
        handle.get_mut().set_script("fail", vec![exited(1)]);
        let mut task = RetryableTask::new(app("fail"), 1);
        task.attach(&controller).unwrap();
        run_to_completion(&mut task, 20);
        assert_eq!(task.retried(), 1);

        task.redo().unwrap();
        assert_eq!(task.retried(), 0);
        assert_eq!(task.state(), RunState::New);
        assert_eq!(task.inner().state(), RunState::New);
    }

    #[test]
    fn test_forwards_to_wrapped_task() {
        let (controller, _) = scripted_controller();
        let mut task = RetryableTask::new(app("echo hello"), 1);
        assert_eq!(task.name(), "echo hello");
        assert_eq!(task.children().len(), 1);
        let application = task.inner().as_any().downcast_ref::<Application>().unwrap();
        assert_eq!(application.spec().arguments, ["echo", "hello"]);

        task.attach(&controller).unwrap();
        assert!(task.inner().is_attached());
        task.submit(false).unwrap();
        let output = task.peek(OutputStream::Stdout, 0, None).unwrap();
        assert_eq!(output, b"stdout.txt");
    }

    #[test]
    fn test_merge_states() {
        use RunState::*;

        assert_eq!(merge_states(New, New), New);
        assert_eq!(merge_states(New, Submitted), Submitted);
        assert_eq!(merge_states(New, Stopped), Stopped);
        assert_eq!(merge_states(New, Terminating), Running);
        assert_eq!(merge_states(Submitted, New), Submitted);
        assert_eq!(merge_states(Submitted, Terminating), Running);
        assert_eq!(merge_states(Submitted, Unknown), Unknown);
        assert_eq!(merge_states(Running, Stopped), Stopped);
        assert_eq!(merge_states(Running, Submitted), Running);
        assert_eq!(merge_states(Stopped, Running), Running);
        assert_eq!(merge_states(Unknown, Stopped), Unknown);
        assert_eq!(merge_states(Terminated, Terminated), Terminated);
    }
}
