use std::path::Path;

use crate::common::error::GridError;
use crate::delegate_collection_accessors;
use crate::run::{ReturnCode, RunState};
use crate::task::Task;
use crate::workflow::{ParallelTaskCollection, TaskStats};
use crate::Result;

/// Creates the task for one parameter value.
pub type TaskFactory = Box<dyn FnMut(i64) -> Box<dyn Task>>;

/// Parallel collection over the parameters `min, min + step, ...` below `max`.
///
/// Tasks are created at most `chunk_size` at a time. A new chunk is created when
/// less than half of a chunk is still waiting or running.
pub struct ChunkedParameterSweep {
    parallel: ParallelTaskCollection,
    max: i64,
    step: i64,
    chunk_size: usize,
    /// First parameter without a task.
    floor: i64,
    factory: TaskFactory,
}

impl ChunkedParameterSweep {
    pub fn new(
        name: impl Into<String>,
        min: i64,
        max: i64,
        step: i64,
        chunk_size: usize,
        factory: TaskFactory,
    ) -> Result<Self> {
        let name = name.into();
        if step <= 0 {
            return Err(GridError::InvalidArgument(format!(
                "sweep {name}: step must be positive, got {step}"
            )));
        }
        if chunk_size < 1 {
            return Err(GridError::InvalidArgument(format!(
                "sweep {name}: chunk size must be at least 1"
            )));
        }
        if min > max {
            return Err(GridError::InvalidArgument(format!(
                "sweep {name}: empty range {min}..{max}"
            )));
        }
        let mut sweep = Self {
            parallel: ParallelTaskCollection::new(name, vec![]),
            max,
            step,
            chunk_size,
            floor: min,
            factory,
        };
        if min == max {
            sweep.parallel.collection_mut().finish(ReturnCode::OK);
        } else {
            sweep.add_chunk()?;
        }
        Ok(sweep)
    }

    /// First parameter value that has no task yet.
    pub fn floor(&self) -> i64 {
        self.floor
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn tasks(&self) -> &[Box<dyn Task>] {
        self.parallel.tasks()
    }

    pub fn stats(&self) -> TaskStats {
        self.parallel.stats()
    }

    fn add_chunk(&mut self) -> Result<()> {
        let chunk = i64::try_from(self.chunk_size).unwrap_or(i64::MAX);
        let chunk_end = self
            .floor
            .saturating_add(self.step.saturating_mul(chunk))
            .min(self.max);
        let mut param = self.floor;
        while param < chunk_end {
            let task = (self.factory)(param);
            self.parallel.add(task)?;
            match param.checked_add(self.step) {
                Some(next) => param = next,
                None => break,
            }
        }
        log::debug!(
            "Sweep {} created tasks for parameters {}..{chunk_end}",
            self.parallel.collection().name(),
            self.floor
        );
        self.floor = chunk_end;
        Ok(())
    }

    fn expand(&mut self) -> Result<()> {
        if self.floor >= self.max || self.parallel.collection().state() == RunState::Terminated {
            return Ok(());
        }
        let stats = self.parallel.stats();
        let waiting =
            stats[RunState::New] + stats[RunState::Submitted] + stats[RunState::Running];
        if waiting.saturating_mul(2) < self.chunk_size {
            self.add_chunk()?;
        }
        Ok(())
    }
}

impl Task for ChunkedParameterSweep {
    delegate_collection_accessors!(parallel);

    fn submit(&mut self, resubmit: bool) -> Result<RunState> {
        self.parallel.submit(resubmit)
    }

    fn update_state(&mut self) -> Result<RunState> {
        self.parallel.update_children()?;
        self.expand()?;
        Ok(self.parallel.recompute())
    }

    fn kill(&mut self) -> Result<()> {
        self.parallel.kill()
    }

    fn fetch_output(&mut self, output_dir: Option<&Path>, overwrite: bool) -> Result<RunState> {
        self.parallel.fetch_output(output_dir, overwrite)
    }

    fn redo(&mut self) -> Result<()> {
        self.parallel.redo()
    }

    fn progress(&mut self) -> Result<RunState> {
        if self.parallel.collection().state() == RunState::Terminated {
            return Ok(RunState::Terminated);
        }
        self.parallel.progress_children()?;
        self.expand()?;
        Ok(self.parallel.recompute())
    }
}
