//! The agent's dispatch loop.
//!
//! Messages are handled one at a time on a single task. Anything that runs a
//! process is spawned onto its own task, and the loop checks for its
//! completion after every receive window, so `ping` is answered while an
//! execution is in flight.

use crate::config::AgentConfig;
use crate::exec::{self, ExecOutcome};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use testbed_proto::{
    ApplyPatchRequest, Communicator, CommunicatorExt, ErrorReport, ExecRequest, ExecutionKind,
    ExecutionRecord, ExecutionStatus, Message, MessageType, RunEvaluationRequest,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct InFlight {
    record: ExecutionRecord,
    handle: JoinHandle<ExecOutcome>,
}

/// The current or last execution, shared with the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct ExecutionBoard {
    latest: Arc<RwLock<Option<ExecutionRecord>>>,
}

impl ExecutionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, record: &ExecutionRecord) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
    }

    pub fn latest(&self) -> Option<ExecutionRecord> {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Protocol server for one sandbox.
pub struct Agent {
    comm: Arc<dyn Communicator>,
    config: AgentConfig,
    current: Option<InFlight>,
    history: VecDeque<ExecutionRecord>,
    board: ExecutionBoard,
}

impl Agent {
    pub fn new(comm: Arc<dyn Communicator>, config: AgentConfig) -> Self {
        Self {
            comm,
            config,
            current: None,
            history: VecDeque::new(),
            board: ExecutionBoard::new(),
        }
    }

    /// Post execution records to `board` as they start and finish.
    pub fn with_board(mut self, board: ExecutionBoard) -> Self {
        self.board = board;
        self
    }

    /// Serve until `shutdown` is cancelled. Work still running at that point
    /// is aborted.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(testbed_id = %self.comm.owner_id(), "Dispatch loop started");
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.comm.receive() => batch,
            };
            for message in batch {
                self.dispatch(message);
            }
            self.reap().await;
        }
        if let Some(in_flight) = self.current.take() {
            warn!(execution_id = %in_flight.record.execution_id, "Aborting running execution");
            in_flight.handle.abort();
        }
        info!(testbed_id = %self.comm.owner_id(), "Dispatch loop stopped");
    }

    /// Handle one message without waiting on any process.
    pub fn dispatch(&mut self, message: Message) {
        let message_type = message.message_type();
        debug!(%message_type, "Dispatching message");

        match message_type {
            MessageType::Ping => {
                self.comm.send(MessageType::Pong, message.into_payload());
            }
            MessageType::ExecRequest => match message.parse_payload::<ExecRequest>() {
                Ok(request) => {
                    let timeout = self.timeout_for(request.timeout_secs);
                    let workdir = self.config.workdir.clone();
                    self.start(request.execution_id, ExecutionKind::Command, async move {
                        exec::run_shell(&request.command, &workdir, timeout).await
                    });
                }
                Err(e) => self.report_error(message_type, e.to_string()),
            },
            MessageType::ApplyPatch => match message.parse_payload::<ApplyPatchRequest>() {
                Ok(request) => {
                    let timeout = self.config.exec_timeout;
                    let workdir = self.config.workdir.clone();
                    self.start(request.execution_id, ExecutionKind::Patch, async move {
                        exec::apply_patch(&request.patch, &workdir, timeout).await
                    });
                }
                Err(e) => self.report_error(message_type, e.to_string()),
            },
            MessageType::RunEvaluation => match message.parse_payload::<RunEvaluationRequest>() {
                Ok(request) => {
                    let timeout = self.timeout_for(request.timeout_secs);
                    let workdir = self.config.workdir.clone();
                    let script = self.config.eval_script.clone();
                    self.start(request.execution_id, ExecutionKind::Evaluation, async move {
                        exec::run_script(&script, &workdir, timeout).await
                    });
                }
                Err(e) => self.report_error(message_type, e.to_string()),
            },
            other => {
                warn!(message_type = %other, "Unsupported message type");
                self.report_error(other, format!("unsupported message type: {other}"));
            }
        }
    }

    fn timeout_for(&self, requested: Option<u64>) -> Duration {
        requested
            .map(Duration::from_secs)
            .unwrap_or(self.config.exec_timeout)
    }

    /// Start `work` unless the id is already known or another execution is
    /// running.
    fn start<F>(&mut self, execution_id: Uuid, kind: ExecutionKind, work: F)
    where
        F: Future<Output = ExecOutcome> + Send + 'static,
    {
        if let Some(done) = self.history.iter().find(|r| r.execution_id == execution_id) {
            debug!(%execution_id, "Repeating final status for known execution");
            self.publish(done);
            return;
        }

        if let Some(in_flight) = &self.current {
            if in_flight.record.execution_id == execution_id {
                debug!(%execution_id, "Execution already running");
                self.publish(&in_flight.record);
            } else {
                let running = in_flight.record.execution_id;
                info!(%execution_id, %running, "Rejecting request, agent busy");
                self.publish(&ExecutionRecord::busy(execution_id, kind, running));
            }
            return;
        }

        let record = ExecutionRecord::running(execution_id, kind);
        info!(%execution_id, ?kind, "Execution started");
        self.board.post(&record);
        self.publish(&record);
        self.current = Some(InFlight {
            record,
            handle: tokio::spawn(work),
        });
    }

    /// Publish the final record of a finished execution.
    async fn reap(&mut self) {
        match &self.current {
            Some(in_flight) if in_flight.handle.is_finished() => {}
            _ => return,
        }
        let Some(in_flight) = self.current.take() else {
            return;
        };

        let record = match in_flight.handle.await {
            Ok(outcome) => complete(in_flight.record, outcome),
            Err(e) => in_flight.record.fail(format!("execution task failed: {e}")),
        };
        info!(
            execution_id = %record.execution_id,
            status = %record.status,
            exit_code = ?record.exit_code,
            "Execution finished"
        );
        self.board.post(&record);
        self.publish(&record);
        self.remember(record);
    }

    fn remember(&mut self, record: ExecutionRecord) {
        self.history.push_back(record);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    fn publish(&self, record: &ExecutionRecord) {
        if let Err(e) = self.comm.send_payload(MessageType::ExecStatus, record) {
            warn!(error = %e, "Failed to encode execution status");
            return;
        }
        if record.kind == ExecutionKind::Evaluation && record.is_terminal() {
            if let Err(e) = self.comm.send_payload(MessageType::Result, record) {
                warn!(error = %e, "Failed to encode evaluation result");
            }
        }
    }

    fn report_error(&self, in_reply_to: MessageType, reason: String) {
        let report = ErrorReport {
            reason,
            in_reply_to: Some(in_reply_to),
        };
        if let Err(e) = self.comm.send_payload(MessageType::Error, &report) {
            warn!(error = %e, "Failed to encode error report");
        }
    }
}

/// Turn a process outcome into the final record.
pub(crate) fn complete(record: ExecutionRecord, outcome: ExecOutcome) -> ExecutionRecord {
    let status = match (record.kind, outcome.success()) {
        (ExecutionKind::Patch, true) => ExecutionStatus::PatchApplied,
        (_, true) => ExecutionStatus::Ready,
        (_, false) => ExecutionStatus::Failed,
    };
    let error = if outcome.timed_out {
        Some(outcome.stderr.clone())
    } else if outcome.success() {
        None
    } else {
        Some(format!("exit code {}", outcome.exit_code))
    };
    let mut record = record.finish(status, Some(outcome.exit_code), outcome.combined_output());
    record.error = error;
    record
}
