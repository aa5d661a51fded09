use std::any::Any;
use std::path::Path;

use crate::backend::LrmsRef;
use crate::common::error::{GridError, invalid_operation};
use crate::run::{Execution, RunState};
use crate::task::{OutputStream, Task, TaskId};
use crate::workflow::{
    AbortOnError, ParallelTaskCollection, SequentialTaskCollection, TaskCollection,
};
use crate::{Result, Set};

enum Graph {
    /// Tasks and their dependencies, as added.
    Pending {
        collection: TaskCollection,
        deps: Vec<Set<usize>>,
    },
    /// One parallel collection per level of the dependency graph, run in order.
    Built(SequentialTaskCollection<AbortOnError>),
}

/// Runs each task once all the tasks it depends on terminated.
///
/// Tasks are grouped into levels: a task sits one level above the highest of its
/// dependencies. Levels run one after the other and a failing level ends the
/// collection. The grouping happens when the collection is first submitted, after
/// which no tasks can be added.
pub struct DependentTaskCollection {
    id: TaskId,
    graph: Graph,
}

impl DependentTaskCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::next(),
            graph: Graph::Pending {
                collection: TaskCollection::new(name, vec![]),
                deps: Vec::new(),
            },
        }
    }

    pub fn add(&mut self, task: Box<dyn Task>) -> Result<usize> {
        self.add_with_deps(task, &[])
    }

    /// Add a task that runs after the tasks with the given indices.
    pub fn add_with_deps(&mut self, task: Box<dyn Task>, after: &[usize]) -> Result<usize> {
        let (collection, deps) = self.pending_mut()?;
        if let Some(missing) = after.iter().find(|&&index| index >= collection.len()) {
            return Err(GridError::InvalidArgument(format!(
                "collection {} has no task at index {missing}",
                collection.name()
            )));
        }
        let index = collection.add(task)?;
        deps.push(after.iter().copied().collect());
        Ok(index)
    }

    /// Make the task at `task` wait for the task at `on`.
    pub fn depend(&mut self, task: usize, on: usize) -> Result<()> {
        let (collection, deps) = self.pending_mut()?;
        if task >= deps.len() || on >= deps.len() {
            return Err(GridError::InvalidArgument(format!(
                "collection {} has no task at index {}",
                collection.name(),
                task.max(on)
            )));
        }
        deps[task].insert(on);
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        matches!(self.graph, Graph::Built(_))
    }

    fn pending_mut(&mut self) -> Result<(&mut TaskCollection, &mut Vec<Set<usize>>)> {
        match &mut self.graph {
            Graph::Pending { collection, deps } => Ok((collection, deps)),
            Graph::Built(sequence) => invalid_operation(format!(
                "collection {} has already started, tasks cannot be added",
                sequence.name()
            )),
        }
    }

    fn built(&mut self) -> Result<&mut SequentialTaskCollection<AbortOnError>> {
        if let Graph::Pending { collection, deps } = &mut self.graph {
            let sequence = build_sequence(collection, deps)?;
            self.graph = Graph::Built(sequence);
        }
        match &mut self.graph {
            Graph::Built(sequence) => Ok(sequence),
            Graph::Pending { collection, .. } => invalid_operation(format!(
                "collection {} could not be built",
                collection.name()
            )),
        }
    }
}

fn build_sequence(
    collection: &mut TaskCollection,
    deps: &[Set<usize>],
) -> Result<SequentialTaskCollection<AbortOnError>> {
    let name = collection.name().to_string();
    let levels = topological_levels(deps).ok_or_else(|| {
        GridError::InvalidArgument(format!(
            "the tasks of collection {name} depend on each other"
        ))
    })?;
    log::debug!("Collection {name} runs its tasks in {} levels", levels.len());

    let controller = collection.controller().cloned();
    let mut slots: Vec<Option<Box<dyn Task>>> =
        collection.take_tasks().into_iter().map(Some).collect();
    let stages = levels
        .into_iter()
        .enumerate()
        .map(|(level, indices)| {
            let tasks = indices
                .into_iter()
                .filter_map(|index| slots[index].take())
                .collect();
            let parallel = ParallelTaskCollection::new(format!("{name}.{level}"), tasks);
            Box::new(parallel) as Box<dyn Task>
        })
        .collect();
    let mut sequence = SequentialTaskCollection::from_collection(
        TaskCollection::new(name, stages),
        AbortOnError,
    );
    if let Some(controller) = controller {
        sequence.attach(&controller)?;
    }
    Ok(sequence)
}

/// Group task indices so that every task comes after all of its dependencies.
/// Returns `None` when the dependencies contain a cycle.
fn topological_levels(deps: &[Set<usize>]) -> Option<Vec<Vec<usize>>> {
    let mut placed = vec![false; deps.len()];
    let mut remaining: Vec<usize> = (0..deps.len()).collect();
    let mut levels = Vec::new();
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining
            .into_iter()
            .partition(|&index| deps[index].iter().all(|&dep| placed[dep]));
        if ready.is_empty() {
            return None;
        }
        for &index in &ready {
            placed[index] = true;
        }
        levels.push(ready);
        remaining = blocked;
    }
    Some(levels)
}

impl Task for DependentTaskCollection {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        match &self.graph {
            Graph::Pending { collection, .. } => collection.name(),
            Graph::Built(sequence) => sequence.name(),
        }
    }

    fn execution(&self) -> &Execution {
        match &self.graph {
            Graph::Pending { collection, .. } => collection.execution(),
            Graph::Built(sequence) => sequence.execution(),
        }
    }

    fn changed(&self) -> bool {
        match &self.graph {
            Graph::Pending { collection, .. } => collection.changed(),
            Graph::Built(sequence) => sequence.changed(),
        }
    }

    fn mark_saved(&mut self) {
        match &mut self.graph {
            Graph::Pending { collection, .. } => collection.mark_saved(),
            Graph::Built(sequence) => sequence.mark_saved(),
        }
    }

    fn controller(&self) -> Option<&LrmsRef> {
        match &self.graph {
            Graph::Pending { collection, .. } => collection.controller(),
            Graph::Built(sequence) => sequence.controller(),
        }
    }

    fn attach(&mut self, controller: &LrmsRef) -> Result<()> {
        match &mut self.graph {
            Graph::Pending { collection, .. } => collection.attach(controller),
            Graph::Built(sequence) => sequence.attach(controller),
        }
    }

    fn detach(&mut self) {
        match &mut self.graph {
            Graph::Pending { collection, .. } => collection.detach(),
            Graph::Built(sequence) => sequence.detach(),
        }
    }

    fn submit(&mut self, resubmit: bool) -> Result<RunState> {
        self.built()?.submit(resubmit)
    }

    fn update_state(&mut self) -> Result<RunState> {
        match &mut self.graph {
            Graph::Pending { collection, .. } => Ok(collection.state()),
            Graph::Built(sequence) => sequence.update_state(),
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.built()?.kill()
    }

    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState> {
        match &mut self.graph {
            Graph::Pending { collection, .. } => Ok(collection.state()),
            Graph::Built(sequence) => sequence.fetch_output(output_dir, overwrite),
        }
    }

    fn peek(&self, _stream: OutputStream, _offset: u64, _size: Option<u64>) -> Result<Vec<u8>> {
        invalid_operation(format!("cannot peek into task collection {}", self.name()))
    }

    fn free(&mut self) -> Result<()> {
        match &mut self.graph {
            Graph::Pending { collection, .. } => collection.free(),
            Graph::Built(sequence) => sequence.free(),
        }
    }

    fn redo(&mut self) -> Result<()> {
        self.built()?.redo()
    }

    fn progress(&mut self) -> Result<RunState> {
        self.built()?.progress()
    }

    /// The tasks as added until the collection starts, the levels afterwards.
    fn children(&self) -> &[Box<dyn Task>] {
        match &self.graph {
            Graph::Pending { collection, .. } => collection.tasks(),
            Graph::Built(sequence) => sequence.children(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
