use crate::common::error::GridError;
use crate::run::ReturnCode;
use crate::task::Task;
use crate::workflow::{Next, SequencePolicy, SequentialTaskCollection, TaskCollection};
use crate::Result;

/// Result of a stage function.
pub enum Stage {
    /// Run this task next.
    Task(Box<dyn Task>),
    /// End the collection with this return code.
    Exit(ReturnCode),
}

/// Builds the task of one stage. Receives the tasks of the previous stages, which
/// have all terminated by then.
pub type StageFn = Box<dyn FnMut(&[Box<dyn Task>]) -> Stage>;

/// Sequence policy that materializes the task of stage `n + 1` only after the task
/// of stage `n` terminated.
pub struct Stages {
    stages: Vec<StageFn>,
}

impl Stages {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl SequencePolicy for Stages {
    fn next(&mut self, done: usize, tasks: &mut TaskCollection) -> Result<Next> {
        let following = done + 1;
        if following < tasks.len() {
            // materialized during an earlier run
            return Ok(Next::Continue);
        }
        let Some(stage) = self.stages.get_mut(following) else {
            return Ok(Next::Terminate(None));
        };
        match stage(tasks.tasks()) {
            Stage::Task(task) => {
                tasks.add(task)?;
                Ok(Next::Continue)
            }
            Stage::Exit(returncode) => {
                log::debug!(
                    "Stage {following} of {} ended the collection with {returncode}",
                    tasks.name()
                );
                Ok(Next::Terminate(Some(returncode)))
            }
        }
    }
}

/// Sequence whose tasks are created one stage at a time.
pub type StagedTaskCollection = SequentialTaskCollection<Stages>;

impl SequentialTaskCollection<Stages> {
    /// The first stage is evaluated right away. If it exits, the collection is
    /// born `TERMINATED` with no tasks.
    pub fn from_stages(name: impl Into<String>, mut stages: Vec<StageFn>) -> Result<Self> {
        let name = name.into();
        let Some(first) = stages.first_mut() else {
            return Err(GridError::InvalidArgument(format!(
                "staged collection {name} needs at least one stage"
            )));
        };
        let mut collection = TaskCollection::new(name, vec![]);
        match first(&[]) {
            Stage::Task(task) => {
                collection.add(task)?;
            }
            Stage::Exit(returncode) => {
                collection.finish(returncode);
            }
        }
        Ok(SequentialTaskCollection::from_collection(
            collection,
            Stages { stages },
        ))
    }
}
