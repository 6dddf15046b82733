use crate::depth::store::FrameStore;
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

/// Lifecycle of one extraction run. At most one run is ever past `Idle`
/// per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Opening,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Terminal value of a run. Nothing is thrown across the engine boundary;
/// every outcome, including cancellation, arrives as one of these.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub success: bool,
    pub cancelled: bool,
    pub output_path: Option<PathBuf>,
    pub frames_processed: usize,
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn completed(output_path: PathBuf, frames_processed: usize) -> Self {
        Self {
            success: true,
            cancelled: false,
            output_path: Some(output_path),
            frames_processed,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            cancelled: false,
            output_path: None,
            frames_processed: 0,
            error: Some(message.into()),
        }
    }

    pub fn cancelled(output_path: Option<PathBuf>, frames_processed: usize) -> Self {
        Self {
            success: false,
            cancelled: true,
            output_path,
            frames_processed,
            error: None,
        }
    }
}

/// Progress stream from a worker-thread run to its observer.
#[derive(Debug)]
pub enum ProgressEvent {
    Update { progress: f32, message: String },
    Finished(ExtractionResult),
}

/// Drives extraction runs and owns everything shared with observers: the
/// cooperative cancellation flag (checked once per frame), the state
/// machine, and the frame store with the live preview.
pub struct ExtractionEngine {
    cancel_requested: AtomicBool,
    running: AtomicBool,
    state: Mutex<EngineState>,
    store: FrameStore,
}

impl ExtractionEngine {
    pub fn new() -> Self {
        Self {
            cancel_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            state: Mutex::new(EngineState::Idle),
            store: FrameStore::new(),
        }
    }

    /// Requests a cooperative stop. Takes effect at the next per-frame
    /// check; a frame already being processed finishes first.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn should_cancel(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> EngineState {
        match self.state.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    /// Claims the engine for one run. Fails immediately when a run is
    /// already active; a second start never queues.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.set_state(EngineState::Opening);
        Some(RunGuard {
            engine: self,
            finished: false,
        })
    }

    fn set_state(&self, state: EngineState) {
        match self.state.lock() {
            Ok(mut g) => *g = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

impl Default for ExtractionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the engine's single run slot. Dropping without `finish` (a bug or
/// a panic unwinding through the run) records the run as failed and frees
/// the slot.
pub struct RunGuard<'a> {
    engine: &'a ExtractionEngine,
    finished: bool,
}

impl RunGuard<'_> {
    pub fn mark_running(&self) {
        self.engine.set_state(EngineState::Running);
    }

    pub fn finish(mut self, result: &ExtractionResult) {
        let state = if result.cancelled {
            EngineState::Cancelled
        } else if result.success {
            EngineState::Completed
        } else {
            EngineState::Failed
        };
        self.engine.set_state(state);
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.set_state(EngineState::Failed);
        }
        self.engine.running.store(false, Ordering::SeqCst);
    }
}

/// Runs a job on a worker thread, forwarding progress and the final result
/// over the channel. The controlling thread stays free to poll engine
/// state and request cancellation.
pub fn spawn_run<F>(events: Sender<ProgressEvent>, job: F) -> JoinHandle<()>
where
    F: FnOnce(&dyn Fn(f32, &str)) -> ExtractionResult + Send + 'static,
{
    std::thread::spawn(move || {
        let tx = events.clone();
        let progress = move |p: f32, message: &str| {
            let _ = tx.send(ProgressEvent::Update {
                progress: p,
                message: message.to_string(),
            });
        };
        let result = job(&progress);
        let _ = events.send(ProgressEvent::Finished(result));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_run_slot() {
        let engine = ExtractionEngine::new();
        let guard = engine.try_begin().expect("first claim succeeds");
        assert!(engine.is_running());
        assert_eq!(engine.state(), EngineState::Opening);
        assert!(engine.try_begin().is_none());

        guard.finish(&ExtractionResult::completed("/tmp/x".into(), 3));
        assert!(!engine.is_running());
        assert_eq!(engine.state(), EngineState::Completed);

        // The slot is free again
        assert!(engine.try_begin().is_some());
    }

    #[test]
    fn test_begin_clears_stale_cancel_request() {
        let engine = ExtractionEngine::new();
        engine.cancel();
        let guard = engine.try_begin().unwrap();
        assert!(!engine.should_cancel());
        engine.cancel();
        assert!(engine.should_cancel());
        guard.finish(&ExtractionResult::cancelled(None, 0));
        assert_eq!(engine.state(), EngineState::Cancelled);
    }

    #[test]
    fn test_dropped_guard_records_failure() {
        let engine = ExtractionEngine::new();
        {
            let guard = engine.try_begin().unwrap();
            guard.mark_running();
            assert_eq!(engine.state(), EngineState::Running);
        }
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_spawn_run_streams_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn_run(tx, |progress| {
            progress(0.5, "halfway");
            ExtractionResult::completed("/tmp/out".into(), 7)
        });
        handle.join().unwrap();

        let mut saw_update = false;
        let mut final_result = None;
        for event in rx.iter() {
            match event {
                ProgressEvent::Update { progress, message } => {
                    assert!((progress - 0.5).abs() < 1e-6);
                    assert_eq!(message, "halfway");
                    saw_update = true;
                }
                ProgressEvent::Finished(result) => final_result = Some(result),
            }
        }
        assert!(saw_update);
        let result = final_result.unwrap();
        assert!(result.success);
        assert_eq!(result.frames_processed, 7);
    }
}
