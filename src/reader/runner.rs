//! Code runner panel state: source text, streamed output, busy flag.
//!
//! A run is split into [`CodeRunner::begin_run`] (synchronous state change)
//! and [`CodeRunner::drive`] (the engine call), so callers can hold a session
//! lock only for the first half. Each run takes a ticket; output and
//! completion from a run that has since been superseded are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;

use super::engine::ExecutionEngine;

pub const DEFAULT_SOURCE: &str = "# Write your Python code here\n\
print(\"Hello from Pagewise!\")\n\
\n\
for i in range(5):\n    print(f\"Count: {i}\")\n";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeRunState {
    pub source_text: String,
    pub output_lines: Vec<String>,
    pub busy: bool,
}

impl Default for CodeRunState {
    fn default() -> Self {
        Self {
            source_text: DEFAULT_SOURCE.to_string(),
            output_lines: Vec::new(),
            busy: false,
        }
    }
}

/// Observable runner changes, for pushing to connected clients.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started { ticket: u64 },
    Output { ticket: u64, line: String },
    Finished { ticket: u64, failed: bool },
    Cleared,
}

pub type RunListener = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// A run accepted by [`CodeRunner::begin_run`], to be passed to
/// [`CodeRunner::drive`].
pub struct PendingRun {
    pub ticket: u64,
    source: String,
    engine: Arc<dyn ExecutionEngine>,
}

#[derive(Default)]
struct RunnerInner {
    state: CodeRunState,
    ticket: u64,
}

#[derive(Clone, Default)]
pub struct CodeRunner {
    inner: Arc<Mutex<RunnerInner>>,
    listener: Option<RunListener>,
}

impl std::fmt::Debug for CodeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRunner")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CodeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: RunListener) -> Self {
        Self {
            inner: Arc::default(),
            listener: Some(listener),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunnerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RunEvent) {
        if let Some(listener) = &self.listener {
            listener(event);
        }
    }

    pub fn state(&self) -> CodeRunState {
        self.lock().state.clone()
    }

    pub fn set_source(&self, source: impl Into<String>) {
        self.lock().state.source_text = source.into();
    }

    /// Start a run. Does nothing and returns `None` when no engine is loaded.
    /// `source` replaces the current source text first, if given.
    pub fn begin_run(
        &self,
        engine: Option<Arc<dyn ExecutionEngine>>,
        source: Option<String>,
    ) -> Option<PendingRun> {
        let Some(engine) = engine else {
            tracing::debug!("run ignored: execution engine not initialized");
            return None;
        };
        let pending = {
            let mut inner = self.lock();
            if let Some(source) = source {
                inner.state.source_text = source;
            }
            inner.ticket += 1;
            inner.state.output_lines.clear();
            inner.state.busy = true;
            PendingRun {
                ticket: inner.ticket,
                source: inner.state.source_text.clone(),
                engine,
            }
        };
        self.emit(RunEvent::Started {
            ticket: pending.ticket,
        });
        Some(pending)
    }

    /// Execute a started run, appending output as it streams in.
    pub async fn drive(&self, run: PendingRun) {
        let PendingRun {
            ticket,
            source,
            engine,
        } = run;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let execute = async move { engine.run(&source, tx).await };
        let collect = async {
            while let Some(line) = rx.recv().await {
                self.append_line(ticket, line);
            }
        };
        let (result, ()) = tokio::join!(execute, collect);

        let failed = match result {
            Ok(()) => false,
            Err(e) => {
                tracing::debug!(ticket, error = %e, "code run failed");
                self.append_line(ticket, format!("Error: {}", e));
                true
            }
        };
        self.finish(ticket, failed);
    }

    /// Begin and drive in one call.
    pub async fn run(&self, engine: Option<Arc<dyn ExecutionEngine>>, source: Option<String>) {
        if let Some(pending) = self.begin_run(engine, source) {
            self.drive(pending).await;
        }
    }

    /// Empty the output. Allowed at any time, including mid-run.
    pub fn clear(&self) {
        self.lock().state.output_lines.clear();
        self.emit(RunEvent::Cleared);
    }

    fn append_line(&self, ticket: u64, line: String) -> bool {
        {
            let mut inner = self.lock();
            if inner.ticket != ticket {
                return false;
            }
            inner.state.output_lines.push(line.clone());
        }
        self.emit(RunEvent::Output { ticket, line });
        true
    }

    fn finish(&self, ticket: u64, failed: bool) -> bool {
        {
            let mut inner = self.lock();
            if inner.ticket != ticket {
                tracing::debug!(ticket, current = inner.ticket, "dropping superseded run result");
                return false;
            }
            inner.state.busy = false;
        }
        self.emit(RunEvent::Finished { ticket, failed });
        true
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::reader::engine::testing::ScriptedEngine;

    fn engine(e: ScriptedEngine) -> Option<Arc<dyn ExecutionEngine>> {
        Some(Arc::new(e))
    }

    async fn wait_until(runner: &CodeRunner, pred: impl Fn(&CodeRunState) -> bool) {
        while !pred(&runner.state()) {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_default_state() {
        let state = CodeRunner::new().state();
        assert!(state.source_text.contains("print(\"Hello"));
        assert!(state.output_lines.is_empty());
        assert!(!state.busy);
    }

    #[tokio::test]
    async fn test_run_without_engine_is_noop() {
        let runner = CodeRunner::new();
        runner.run(None, Some("print(1)".into())).await;
        let state = runner.state();
        assert!(state.output_lines.is_empty());
        assert!(!state.busy);
        assert_eq!(state.source_text, DEFAULT_SOURCE);
    }

    #[tokio::test]
    async fn test_run_streams_output_and_settles() {
        let runner = CodeRunner::new();
        runner
            .run(engine(ScriptedEngine::new(&["Hello", "Count: 0"])), Some("src".into()))
            .await;
        let state = runner.state();
        assert_eq!(state.output_lines, vec!["Hello", "Count: 0"]);
        assert_eq!(state.source_text, "src");
        assert!(!state.busy);
    }

    #[tokio::test]
    async fn test_fault_appends_single_error_line() {
        let runner = CodeRunner::new();
        runner
            .run(
                engine(ScriptedEngine::failing(&["partial"], "NameError: name 'x' is not defined")),
                None,
            )
            .await;
        assert_eq!(
            runner.state().output_lines,
            vec!["partial", "Error: NameError: name 'x' is not defined"]
        );
        assert!(!runner.state().busy);
    }

    #[tokio::test]
    async fn test_new_run_clears_previous_output() {
        let runner = CodeRunner::new();
        runner.run(engine(ScriptedEngine::new(&["first"])), None).await;
        runner.run(engine(ScriptedEngine::new(&["second"])), None).await;
        assert_eq!(runner.state().output_lines, vec!["second"]);
    }

    #[tokio::test]
    async fn test_clear_while_busy() {
        let gate = Arc::new(Notify::new());
        let runner = CodeRunner::new();
        runner.run(engine(ScriptedEngine::new(&["old"])), None).await;

        let pending = runner
            .begin_run(engine(ScriptedEngine::gated(&["late"], gate.clone())), None)
            .unwrap();
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.drive(pending).await }
        });
        assert!(runner.state().busy);

        runner.clear();
        let state = runner.state();
        assert!(state.output_lines.is_empty());
        assert!(state.busy);

        gate.notify_one();
        task.await.unwrap();
        let state = runner.state();
        assert_eq!(state.output_lines, vec!["late"]);
        assert!(!state.busy);
    }

    #[test]
    fn test_clear_when_idle() {
        let runner = CodeRunner::new();
        runner.clear();
        runner.clear();
        assert!(runner.state().output_lines.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_run_output_is_dropped() {
        let gate = Arc::new(Notify::new());
        let runner = CodeRunner::new();

        let slow = runner
            .begin_run(engine(ScriptedEngine::gated(&["from A"], gate.clone())), None)
            .unwrap();
        let slow_task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.drive(slow).await }
        });

        runner.run(engine(ScriptedEngine::new(&["from B"])), None).await;
        assert_eq!(runner.state().output_lines, vec!["from B"]);
        assert!(!runner.state().busy);

        gate.notify_one();
        slow_task.await.unwrap();
        let state = runner.state();
        assert_eq!(state.output_lines, vec!["from B"]);
        assert!(!state.busy);
    }

    #[tokio::test]
    async fn test_busy_tracks_latest_run() {
        let gate = Arc::new(Notify::new());
        let runner = CodeRunner::new();
        runner
            .begin_run(engine(ScriptedEngine::new(&["A"])), None)
            .unwrap();
        // A was never driven; B is now the current run and is still pending
        let b = runner
            .begin_run(engine(ScriptedEngine::gated(&["B"], gate.clone())), None)
            .unwrap();
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.drive(b).await }
        });
        assert!(runner.state().busy);
        gate.notify_one();
        task.await.unwrap();
        wait_until(&runner, |s| !s.busy).await;
        assert_eq!(runner.state().output_lines, vec!["B"]);
    }

    #[tokio::test]
    async fn test_listener_receives_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let runner = CodeRunner::with_listener({
            let events = events.clone();
            Arc::new(move |e: RunEvent| events.lock().unwrap().push(e))
        });
        runner
            .run(engine(ScriptedEngine::failing(&["x"], "boom")), None)
            .await;
        runner.clear();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                RunEvent::Started { ticket: 1 },
                RunEvent::Output {
                    ticket: 1,
                    line: "x".into()
                },
                RunEvent::Output {
                    ticket: 1,
                    line: "Error: boom".into()
                },
                RunEvent::Finished {
                    ticket: 1,
                    failed: true
                },
                RunEvent::Cleared,
            ]
        );
    }
}
