//! Side-effect tasks a turn starts but does not wait on until its end.

use std::future::Future;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinHandle;

/// A detached task failure. Never part of the user-facing turn result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub session_id: String,
    pub task: String,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct DiagnosticsSink {
    tx: Option<flume::Sender<Diagnostic>>,
}

impl DiagnosticsSink {
    pub fn new(tx: flume::Sender<Diagnostic>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, flume::Receiver<Diagnostic>) {
        let (tx, rx) = flume::unbounded();
        (Self::new(tx), rx)
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        let undelivered = match &self.tx {
            Some(tx) => tx.send(diagnostic).err().map(|e| e.into_inner()),
            None => Some(diagnostic),
        };
        if let Some(diagnostic) = undelivered {
            log_diagnostic(&diagnostic);
        }
    }
}

pub fn log_diagnostic(diagnostic: &Diagnostic) {
    tracing::warn!(
        "Detached task '{}' failed for session {}: {}",
        diagnostic.task,
        diagnostic.session_id,
        diagnostic.message
    );
}

/// Fan-out set joined once at end of turn. Tasks run on the runtime, so they
/// finish even if the turn's caller goes away first.
pub struct DetachedTasks {
    session_id: String,
    sink: DiagnosticsSink,
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl DetachedTasks {
    pub fn new(session_id: impl Into<String>, sink: DiagnosticsSink) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            handles: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.handles.push((task, tokio::spawn(future)));
    }

    /// Await every task, routing failures to the sink. Returns the failure count.
    pub async fn join(self) -> usize {
        let mut failures = 0;
        for (task, handle) in self.handles {
            let message = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => format!("task aborted: {}", e),
            };
            failures += 1;
            self.sink.report(Diagnostic {
                session_id: self.session_id.clone(),
                task: task.to_string(),
                message,
            });
        }
        failures
    }
}
