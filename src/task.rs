//! Background flow field generation.
//!
//! A task copies what it needs out of the engine under a read lock, solves the field
//! without holding the lock, and leaves the result for the tick thread to commit.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bevy::{log, math::IVec2};

use crate::{
    engine::{PathEngine, StatCounters},
    flow_field::{FieldKey, FlowField},
};

pub(crate) fn read_engine(engine: &RwLock<PathEngine>) -> RwLockReadGuard<'_, PathEngine> {
    engine.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_engine(engine: &RwLock<PathEngine>) -> RwLockWriteGuard<'_, PathEngine> {
    engine.write().unwrap_or_else(PoisonError::into_inner)
}

/// Completion and cancellation flags shared between a task and its handle.
#[derive(Debug, Default)]
pub(crate) struct TaskState {
    cancelled: AtomicBool,
    done: AtomicBool,
    result: Mutex<Option<FlowField>>,
}

impl TaskState {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Takes the solved field. `None` if the task was abandoned or already drained.
    pub(crate) fn take_result(&self) -> Option<FlowField> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn finish(&self, field: Option<FlowField>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = field;
        self.done.store(true, Ordering::Release);
    }
}

/// Handle to one field being generated for a tile build.
#[derive(Debug, Clone)]
pub(crate) struct FlowTask {
    pub(crate) tile: IVec2,
    pub(crate) generation: u32,
    pub(crate) key: FieldKey,
    pub(crate) state: Arc<TaskState>,
}

impl FlowTask {
    pub(crate) fn new(tile: IVec2, generation: u32, key: FieldKey) -> Self {
        FlowTask {
            tile,
            generation,
            key,
            state: Arc::new(TaskState::default()),
        }
    }

    /// Returns true if a rebuild of the tile at `coord` makes this task's result stale.
    pub(crate) fn depends_on(&self, coord: IVec2) -> bool {
        self.tile == coord || self.key.touches_tile(coord)
    }

    /// The work to hand to a [`TaskPool`].
    pub(crate) fn job(&self, engine: Arc<RwLock<PathEngine>>) -> impl FnOnce() + Send + Sync + 'static {
        let tile = self.tile;
        let generation = self.generation;
        let key = self.key.clone();
        let state = self.state.clone();

        move || generate(&engine, tile, generation, &key, &state)
    }
}

fn generate(
    engine: &RwLock<PathEngine>,
    tile: IVec2,
    generation: u32,
    key: &FieldKey,
    state: &TaskState,
) {
    if state.is_cancelled() {
        state.finish(None);
        return;
    }

    let job = {
        let engine = read_engine(engine);
        if engine.tile(tile).map(|t| t.generation()) != Some(generation) {
            log::debug!("Abandoning field for rebuilt tile {}", tile);
            state.finish(None);
            return;
        }

        match engine.prepare_flow_job(tile, key) {
            Ok(job) => job,
            Err(e) => {
                log::debug!("Abandoning field for tile {}: {}", tile, e);
                state.finish(None);
                return;
            }
        }
    };

    let field = crate::timed!("Generated flow field", { job.run() });

    if state.is_cancelled() {
        state.finish(None);
        return;
    }

    StatCounters::add(&read_engine(engine).stats.fields_solved, 1);
    state.finish(Some(field));
}

type Work = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Runs generation work on a dedicated rayon pool, or defers it to the next
/// [`TaskPool::run_pending`] call when no pool is available.
pub(crate) struct TaskPool {
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
    deferred: VecDeque<Work>,
}

impl TaskPool {
    pub(crate) fn new(threads: usize) -> Self {
        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("flowpath-worker-{}", i))
                .build();

            let pool = match pool {
                Ok(pool) => Some(pool),
                Err(e) => {
                    log::warn!("Failed to create flow field worker pool: {}, running on the tick thread", e);
                    None
                }
            };

            TaskPool {
                pool,
                deferred: VecDeque::new(),
            }
        }

        #[cfg(not(feature = "parallel"))]
        {
            let _ = threads;
            TaskPool {
                deferred: VecDeque::new(),
            }
        }
    }

    pub(crate) fn submit<F>(&mut self, work: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            pool.spawn(work);
            return;
        }

        self.deferred.push_back(Box::new(work));
    }

    /// Runs every deferred job on the calling thread.
    pub(crate) fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Some(work) = self.deferred.pop_front() {
            work();
            ran += 1;
        }
        ran
    }

    /// True if submitted work runs on worker threads.
    pub(crate) fn is_threaded(&self) -> bool {
        #[cfg(feature = "parallel")]
        {
            self.pool.is_some()
        }

        #[cfg(not(feature = "parallel"))]
        {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::open_engine;
    use crate::point::TilePoint;

    fn wait(state: &TaskState, pool: &mut TaskPool) {
        pool.run_pending();
        while !state.is_done() {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_task_generates_field() {
        let engine = Arc::new(RwLock::new(open_engine(6, &[(0, 0)])));
        let generation = read_engine(&engine).tile(IVec2::ZERO).unwrap().generation();
        let task = FlowTask::new(IVec2::ZERO, generation, FieldKey::Points(vec![IVec2::new(3, 3)]));

        let mut pool = TaskPool::new(1);
        pool.submit(task.job(engine.clone()));
        wait(&task.state, &mut pool);

        let field = task.state.take_result().unwrap();
        assert_eq!(field.value(IVec2::new(3, 3)), 0.0);
        assert!(task.state.take_result().is_none());
        assert_eq!(read_engine(&engine).stats().fields_solved, 1);
    }

    #[test]
    fn test_cancelled_task_is_abandoned() {
        let engine = Arc::new(RwLock::new(open_engine(6, &[(0, 0)])));
        let task = FlowTask::new(IVec2::ZERO, 0, FieldKey::Points(vec![IVec2::new(3, 3)]));
        task.state.cancel();

        let mut pool = TaskPool::new(1);
        pool.submit(task.job(engine));
        wait(&task.state, &mut pool);

        assert!(task.state.is_cancelled());
        assert!(task.state.take_result().is_none());
    }

    #[test]
    fn test_rebuilt_tile_abandons_task() {
        let engine = Arc::new(RwLock::new(open_engine(6, &[(0, 0)])));
        let generation = read_engine(&engine).tile(IVec2::ZERO).unwrap().generation();
        write_engine(&engine)
            .update_map_tile(IVec2::ZERO, &[2; 36])
            .unwrap();

        let task = FlowTask::new(IVec2::ZERO, generation, FieldKey::Points(vec![IVec2::ONE]));
        let mut pool = TaskPool::new(1);
        pool.submit(task.job(engine.clone()));
        wait(&task.state, &mut pool);

        assert!(task.state.take_result().is_none());
        let point = TilePoint::new(IVec2::ZERO, IVec2::ONE);
        assert_eq!(read_engine(&engine).get_data_for(point), 2);
    }

    #[test]
    fn test_depends_on() {
        let task = FlowTask::new(IVec2::new(1, 1), 0, FieldKey::Points(vec![IVec2::ZERO]));
        assert!(task.depends_on(IVec2::new(1, 1)));
        assert!(!task.depends_on(IVec2::new(2, 1)));
    }
}
