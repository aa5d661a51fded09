//! Driver that advances a set of top-level tasks.
//!
//! The engine owns the tasks, attaches them to one controller (usually a
//! [`Broker`] over every configured resource) and moves them forward each time
//! [`Engine::progress`] is called. [`Engine::run`] calls it periodically until
//! every task terminated.
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::broker::Broker;
use crate::backend::registry::LrmsRegistry;
use crate::backend::{LrmsRef, wrap_lrms};
use crate::common::error::{GridError, invalid_operation};
use crate::config::GridConfig;
use crate::run::{HistoryEntry, JobInfo, ReturnCode, RunState};
use crate::task::{Task, TaskId};
use crate::workflow::TaskStats;
use crate::{Result, Set};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on leaf jobs in SUBMITTED or RUNNING state, 0 for no limit.
    /// Only NEW top-level tasks are held back to honour it.
    pub max_in_flight: usize,
    /// Drop tasks from the engine once they terminated.
    pub forget_terminated: bool,
    /// Release backend resources of each task once it terminated.
    pub free_on_terminated: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub state: RunState,
    pub returncode: Option<ReturnCode>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskDetail {
    pub id: TaskId,
    pub name: String,
    pub state: RunState,
    pub returncode: Option<ReturnCode>,
    pub exitcode: Option<i32>,
    pub info: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub job: JobInfo,
    pub children: Vec<TaskDetail>,
}

impl TaskDetail {
    fn from_task(task: &dyn Task) -> Self {
        let execution = task.execution();
        Self {
            id: task.id(),
            name: task.name().to_string(),
            state: execution.state(),
            returncode: execution.returncode(),
            exitcode: execution.exitcode(),
            info: execution.info().map(str::to_string),
            history: execution.history().to_vec(),
            job: execution.job().clone(),
            children: task
                .children()
                .iter()
                .map(|child| TaskDetail::from_task(child.as_ref()))
                .collect(),
        }
    }
}

pub struct Engine {
    controller: LrmsRef,
    tasks: Vec<Box<dyn Task>>,
    /// Terminated tasks whose backend resources were already released.
    freed: Set<TaskId>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(controller: LrmsRef, config: EngineConfig) -> Self {
        Self {
            controller,
            tasks: Vec::new(),
            freed: Set::new(),
            config,
        }
    }

    /// Engine that spreads jobs over `resources`.
    pub fn from_resources(resources: Vec<LrmsRef>, config: EngineConfig) -> Result<Self> {
        let broker = Broker::new(resources)?;
        Ok(Self::new(wrap_lrms(broker), config))
    }

    pub fn from_config(config: &GridConfig, registry: &LrmsRegistry) -> Result<Self> {
        let resources = registry.build(config)?;
        log::info!("Engine starts with {} resource(s)", resources.len());
        Self::from_resources(resources, config.engine.clone())
    }

    pub fn controller(&self) -> &LrmsRef {
        &self.controller
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Take ownership of a task and attach it to the engine's controller.
    pub fn add(&mut self, mut task: Box<dyn Task>) -> Result<TaskId> {
        task.attach(&self.controller)?;
        let id = task.id();
        log::debug!("Task {} ({id}) added to the engine", task.name());
        self.tasks.push(task);
        Ok(id)
    }

    /// Give a terminated task back, detached.
    pub fn remove(&mut self, id: TaskId) -> Result<Box<dyn Task>> {
        let index = self.position(id)?;
        let state = self.tasks[index].state();
        if state != RunState::Terminated {
            return invalid_operation(format!(
                "task {id} is in state {state}, only TERMINATED tasks can be removed"
            ));
        }
        let mut task = self.tasks.remove(index);
        task.detach();
        self.freed.remove(&id);
        Ok(task)
    }

    pub fn get(&self, id: TaskId) -> Option<&dyn Task> {
        self.tasks
            .iter()
            .find(|task| task.id() == id)
            .map(|task| task.as_ref())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &dyn Task> {
        self.tasks.iter().map(|task| task.as_ref())
    }

    fn position(&self, id: TaskId) -> Result<usize> {
        self.tasks
            .iter()
            .position(|task| task.id() == id)
            .ok_or_else(|| GridError::InvalidArgument(format!("unknown task {id}")))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Box<dyn Task>> {
        let index = self.position(id)?;
        Ok(&mut self.tasks[index])
    }

    /// Advance every task by one step.
    ///
    /// Tasks that already started are advanced first, then NEW tasks are submitted
    /// for as long as the in-flight limit allows. Recoverable errors of single
    /// tasks are logged and retried on the next call; a task failing otherwise is
    /// cancelled. Only a controller without enabled resources fails the call.
    pub fn progress(&mut self) -> Result<()> {
        self.refresh_resources()?;

        for task in &mut self.tasks {
            if matches!(task.state(), RunState::New | RunState::Terminated) {
                continue;
            }
            if let Err(error) = task.progress() {
                absorb(error, task.as_mut());
            }
        }

        let limit = self.config.max_in_flight;
        let mut in_flight: usize = self
            .tasks
            .iter()
            .map(|task| leaves_in_flight(task.as_ref()))
            .sum();
        for task in &mut self.tasks {
            if task.state() != RunState::New {
                continue;
            }
            if limit > 0 && in_flight >= limit {
                log::debug!("{in_flight} jobs in flight, postponing submissions");
                break;
            }
            match task.progress() {
                Ok(_) => in_flight += leaves_in_flight(task.as_ref()),
                Err(error) => absorb(error, task.as_mut()),
            }
        }

        if self.config.free_on_terminated {
            for task in &mut self.tasks {
                if task.state() != RunState::Terminated || self.freed.contains(&task.id()) {
                    continue;
                }
                if let Err(error) = task.free() {
                    log::warn!("Cannot free task {}: {error}", task.name());
                }
                self.freed.insert(task.id());
            }
        }
        if self.config.forget_terminated {
            let freed = &mut self.freed;
            self.tasks.retain_mut(|task| {
                if task.state() != RunState::Terminated {
                    return true;
                }
                log::debug!("Forgetting terminated task {}", task.name());
                task.detach();
                freed.remove(&task.id());
                false
            });
        }
        Ok(())
    }

    fn refresh_resources(&mut self) -> Result<()> {
        let enabled = {
            let mut controller = self.controller.get_mut();
            if let Err(error) = controller.get_resource_status() {
                log::warn!("Cannot refresh status of {}: {error}", controller.name());
            }
            controller.status().enabled
        };
        if !enabled {
            return Err(GridError::NoResources(
                "every resource is disabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn all_terminated(&self) -> bool {
        self.tasks
            .iter()
            .all(|task| task.state() == RunState::Terminated)
    }

    /// Call [`Engine::progress`] every `interval` until every task terminated.
    pub async fn run(&mut self, interval: Duration) -> Result<()> {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            self.progress()?;
            if self.all_terminated() {
                break;
            }
        }
        log::info!("All {} task(s) terminated", self.tasks.len());
        Ok(())
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats::from_tasks(self.tasks())
    }

    pub fn stats_matching(&self, only: impl Fn(&dyn Task) -> bool) -> TaskStats {
        TaskStats::from_tasks(self.tasks().filter(|task| only(*task)))
    }

    pub fn list(&self) -> Vec<TaskSummary> {
        self.tasks()
            .map(|task| TaskSummary {
                id: task.id(),
                name: task.name().to_string(),
                state: task.state(),
                returncode: task.execution().returncode(),
            })
            .collect()
    }

    pub fn show(&self, id: TaskId) -> Result<TaskDetail> {
        let task = self
            .get(id)
            .ok_or_else(|| GridError::InvalidArgument(format!("unknown task {id}")))?;
        Ok(TaskDetail::from_task(task))
    }

    pub fn kill(&mut self, id: TaskId) -> Result<()> {
        self.task_mut(id)?.kill()
    }

    pub fn resubmit(&mut self, id: TaskId) -> Result<RunState> {
        self.freed.remove(&id);
        self.task_mut(id)?.submit(true)
    }

    pub fn redo(&mut self, id: TaskId) -> Result<()> {
        self.freed.remove(&id);
        self.task_mut(id)?.redo()
    }

    pub fn close(&mut self) {
        self.controller.get_mut().close();
    }
}

/// Jobs of `task` that are SUBMITTED or RUNNING.
fn leaves_in_flight(task: &dyn Task) -> usize {
    let children = task.children();
    if children.is_empty() {
        usize::from(matches!(
            task.state(),
            RunState::Submitted | RunState::Running
        ))
    } else {
        children
            .iter()
            .map(|child| leaves_in_flight(child.as_ref()))
            .sum()
    }
}

/// A task that fails with an error that will not go away is cancelled, so that it
/// cannot hold up the other tasks round after round.
fn absorb(error: GridError, task: &mut dyn Task) {
    if error.is_recoverable() {
        log::warn!("Task {} could not progress: {error}", task.name());
        return;
    }
    log::error!("Task {} failed and is cancelled: {error}", task.name());
    if let Err(error) = task.kill() {
        log::error!("Cannot cancel task {}: {error}", task.name());
    }
}
