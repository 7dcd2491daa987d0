//! Protocol client bound to one sandbox.
//!
//! Every operation is a bounded polling loop over the communicator's
//! non-blocking `receive`. Requests that expect an execution record are
//! resent while the agent stays silent, which is safe because the agent
//! treats a repeated execution id as the same request.

use crate::config::ClientConfig;
use crate::error::{CoreError, Result};
use crate::eval::{EvaluationResult, TestResult, TestSpec};
use crate::sandbox::SandboxId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use testbed_proto::{
    ApplyPatchRequest, Communicator, CommunicatorExt, ErrorReport, ExecRequest, ExecutionRecord,
    ExecutionStatus, MessageType, Ping, RunEvaluationRequest, Waiter,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Client for one sandbox's agent.
///
/// Operations take `&mut self` so that two waits never compete for the same
/// incoming messages.
pub struct TestbedClient {
    id: SandboxId,
    comm: Arc<dyn Communicator>,
    spec: TestSpec,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TestbedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestbedClient")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("config", &self.config)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl TestbedClient {
    pub fn new(
        id: SandboxId,
        comm: Arc<dyn Communicator>,
        spec: TestSpec,
        config: ClientConfig,
    ) -> Self {
        Self {
            id,
            comm,
            spec,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn test_spec(&self) -> &TestSpec {
        &self.spec
    }

    /// Token that aborts the current and future waits of this client.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn waiter(&self, timeout: Duration) -> Waiter {
        Waiter::new(timeout, self.config.poll_interval).with_cancellation(self.cancel.clone())
    }

    /// Check that the agent answers. Returns `false` on timeout, never errors.
    pub async fn ping(&mut self, timeout: Duration) -> bool {
        let ping = Ping::new();
        let mut waiter = self.waiter(timeout);
        let mut attempts = 0u32;

        while waiter.tick().await {
            attempts += 1;
            if let Err(e) = self.comm.send_payload(MessageType::Ping, &ping) {
                tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to encode ping");
                return false;
            }
            for message in self.comm.receive().await {
                if message.message_type() != MessageType::Pong {
                    continue;
                }
                match message.parse_payload::<Ping>() {
                    Ok(pong) if pong.nonce == ping.nonce => {
                        tracing::debug!(
                            sandbox_id = %self.id,
                            attempts,
                            elapsed_ms = waiter.elapsed().as_millis() as u64,
                            "Agent answered ping"
                        );
                        return true;
                    }
                    Ok(_) => tracing::trace!(sandbox_id = %self.id, "Ignoring stale pong"),
                    Err(e) => tracing::debug!(sandbox_id = %self.id, error = %e, "Malformed pong"),
                }
            }
        }

        tracing::warn!(
            sandbox_id = %self.id,
            attempts,
            timeout_secs = timeout.as_secs(),
            "Agent did not answer ping"
        );
        false
    }

    /// Like [`ping`](Self::ping) but fails with `Connectivity` on timeout.
    pub async fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        if self.ping(timeout).await {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled(self.id.clone()));
        }
        Err(CoreError::Connectivity {
            id: self.id.clone(),
            waited: timeout,
        })
    }

    /// Run a shell command in the sandbox's checkout.
    ///
    /// A command that fails is a `Failed` record, not an error. Hitting the
    /// timeout only abandons the wait: the agent keeps running the command
    /// under its own configured limit.
    pub async fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecutionRecord> {
        let execution_id = Uuid::new_v4();
        tracing::info!(sandbox_id = %self.id, %execution_id, command, "Executing command");
        let request = ExecRequest {
            execution_id,
            command: command.to_string(),
            timeout_secs: None,
        };
        self.await_execution(MessageType::ExecRequest, &request, execution_id, timeout)
            .await
    }

    /// Apply a unified diff to the checkout. A diff that does not apply is
    /// a `Failed` record.
    pub async fn apply_patch(&mut self, patch: &str) -> Result<ExecutionRecord> {
        let timeout = self.config.patch_timeout;
        self.apply_patch_within(patch, timeout).await
    }

    async fn apply_patch_within(&mut self, patch: &str, timeout: Duration) -> Result<ExecutionRecord> {
        let execution_id = Uuid::new_v4();
        let mut patch = patch.to_string();
        if !patch.ends_with('\n') {
            patch.push('\n');
        }
        tracing::info!(sandbox_id = %self.id, %execution_id, bytes = patch.len(), "Applying patch");
        let request = ApplyPatchRequest {
            execution_id,
            patch,
        };
        self.await_execution(MessageType::ApplyPatch, &request, execution_id, timeout)
            .await
    }

    /// Apply `patch` if given, run `test_files` and grade the outcomes.
    pub async fn run_tests(
        &mut self,
        test_files: &[String],
        patch: Option<&str>,
        timeout: Duration,
    ) -> Result<TestResult> {
        if test_files.is_empty() {
            return Err(CoreError::InvalidArgument("no test files given".into()));
        }
        let started = Instant::now();

        if let Some(patch) = patch {
            let budget = self.config.patch_timeout.min(timeout);
            let record = self.apply_patch_within(patch, budget).await?;
            if !record.success() {
                tracing::warn!(sandbox_id = %self.id, "Patch did not apply, skipping tests");
                return Ok(TestResult::patch_failed(test_files, record_output(&record)));
            }
        }

        let command = self.spec.test_command(test_files);
        let remaining = timeout.saturating_sub(started.elapsed());
        let record = self.exec(&command, remaining).await?;
        let output = record_output(&record);

        let outcomes = self.spec.drop_ignored(self.spec.parser().parse(&output));
        let result = TestResult::from_outcomes(&self.spec, test_files, outcomes, output);
        tracing::info!(
            sandbox_id = %self.id,
            status = ?result.status,
            outcomes = result.outcomes.len(),
            regressions = result.regressions().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Test run graded"
        );
        Ok(result)
    }

    /// Apply `patch` (or the instance's gold patch), run the instance's
    /// evaluation script and grade it against both declared sets.
    pub async fn run_evaluation(
        &mut self,
        patch: Option<&str>,
        timeout: Duration,
    ) -> Result<EvaluationResult> {
        let started = Instant::now();
        let patch = patch
            .map(str::to_string)
            .or_else(|| self.spec.gold_patch.clone());

        match patch {
            Some(patch) => {
                let budget = self.config.patch_timeout.min(timeout);
                let record = self.apply_patch_within(&patch, budget).await?;
                if !record.success() {
                    tracing::warn!(sandbox_id = %self.id, "Patch did not apply, skipping evaluation");
                    return Ok(EvaluationResult::patch_failed(
                        self.spec.instance_id.clone(),
                        record_output(&record),
                    ));
                }
            }
            None => tracing::warn!(
                sandbox_id = %self.id,
                instance_id = %self.spec.instance_id,
                "No patch and no gold patch, evaluating the checkout as is"
            ),
        }

        let execution_id = Uuid::new_v4();
        let remaining = timeout.saturating_sub(started.elapsed());
        let request = RunEvaluationRequest {
            execution_id,
            timeout_secs: None,
        };
        tracing::info!(sandbox_id = %self.id, %execution_id, "Running evaluation");
        let record = self
            .await_execution(MessageType::RunEvaluation, &request, execution_id, remaining)
            .await?;
        let output = record_output(&record);

        let outcomes = self.spec.drop_ignored(self.spec.parser().parse(&output));
        let result = EvaluationResult::from_outcomes(&self.spec, outcomes, output);
        tracing::info!(
            sandbox_id = %self.id,
            instance_id = %result.instance_id,
            resolution = ?result.resolution,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Evaluation graded"
        );
        Ok(result)
    }

    /// Send `request` and wait for a terminal record for `execution_id`,
    /// resending while the agent stays silent.
    async fn await_execution<T: Serialize>(
        &mut self,
        message_type: MessageType,
        request: &T,
        execution_id: Uuid,
        timeout: Duration,
    ) -> Result<ExecutionRecord> {
        let payload = serde_json::to_value(request)?;
        let mut waiter = self.waiter(timeout);
        let mut last_activity: Option<Instant> = None;
        let mut sends = 0u32;

        while waiter.tick().await {
            let quiet = last_activity.map_or(true, |at| at.elapsed() >= self.config.resend_after);
            if quiet {
                if sends > 0 {
                    tracing::debug!(sandbox_id = %self.id, %execution_id, sends, "No status yet, resending");
                }
                self.comm.send(message_type, payload.clone());
                sends += 1;
                last_activity = Some(Instant::now());
            }

            for message in self.comm.receive().await {
                match message.message_type() {
                    MessageType::ExecStatus | MessageType::Result => {}
                    MessageType::Error => {
                        if let Ok(report) = message.parse_payload::<ErrorReport>() {
                            tracing::warn!(
                                sandbox_id = %self.id,
                                reason = %report.reason,
                                "Agent reported a protocol error"
                            );
                        }
                        continue;
                    }
                    _ => continue,
                }

                let record: ExecutionRecord = match message.parse_payload() {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::debug!(sandbox_id = %self.id, error = %e, "Malformed execution record");
                        continue;
                    }
                };
                if record.execution_id != execution_id {
                    continue;
                }
                last_activity = Some(Instant::now());

                if record.status == ExecutionStatus::Busy {
                    return Err(CoreError::AgentBusy {
                        id: self.id.clone(),
                        reason: record.error.unwrap_or_else(|| "agent is busy".into()),
                    });
                }
                if record.is_terminal() {
                    tracing::info!(
                        sandbox_id = %self.id,
                        %execution_id,
                        status = %record.status,
                        exit_code = ?record.exit_code,
                        elapsed_ms = waiter.elapsed().as_millis() as u64,
                        "Execution finished"
                    );
                    return Ok(record);
                }
                tracing::trace!(sandbox_id = %self.id, %execution_id, status = %record.status, "Execution progress");
            }
        }

        if waiter.is_cancelled() {
            return Err(CoreError::Cancelled(self.id.clone()));
        }
        tracing::warn!(
            sandbox_id = %self.id,
            %execution_id,
            timeout_secs = timeout.as_secs(),
            "Gave up waiting for execution"
        );
        Err(CoreError::ExecutionTimeout {
            id: self.id.clone(),
            execution_id,
            waited: waiter.elapsed(),
        })
    }
}

/// Output of a record, falling back to its error when nothing was captured.
fn record_output(record: &ExecutionRecord) -> String {
    if record.output.is_empty() {
        record.error.clone().unwrap_or_default()
    } else {
        record.output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{ResolvedStatus, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use testbed_proto::{ExecutionKind, MemoryBus, MemoryCommunicator, Message};
    use tokio::task::JoinHandle;

    const ID: &str = "demo-testbed-abcde";

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_resend_after(Duration::from_millis(150))
            .with_patch_timeout(Duration::from_secs(5))
    }

    fn client(bus: &MemoryBus, spec: TestSpec) -> TestbedClient {
        let comm = bus.client(ID).with_poll_window(Duration::from_millis(20));
        TestbedClient::new(SandboxId::from(ID), Arc::new(comm), spec, config())
    }

    /// Agent stand-in that answers each message with `respond`.
    fn responder<F>(bus: &MemoryBus, mut respond: F) -> JoinHandle<()>
    where
        F: FnMut(&MemoryCommunicator, Message) + Send + 'static,
    {
        let agent = bus.agent(ID).with_poll_window(Duration::from_millis(20));
        tokio::spawn(async move {
            loop {
                for message in agent.receive().await {
                    respond(&agent, message);
                }
            }
        })
    }

    fn report(agent: &MemoryCommunicator, record: &ExecutionRecord) {
        agent
            .send_payload(MessageType::ExecStatus, record)
            .unwrap();
    }

    /// Answers pings, applies patches and runs commands with canned output.
    fn scripted_agent(bus: &MemoryBus, command_output: &'static str, exit_code: i32) -> JoinHandle<()> {
        responder(bus, move |agent, message| match message.message_type() {
            MessageType::Ping => agent.send(MessageType::Pong, message.into_payload()),
            MessageType::ApplyPatch => {
                let request: ApplyPatchRequest = message.parse_payload().unwrap();
                let status = if request.patch.starts_with("diff") {
                    ExecutionStatus::PatchApplied
                } else {
                    ExecutionStatus::Failed
                };
                let record = ExecutionRecord::running(request.execution_id, ExecutionKind::Patch)
                    .finish(status, Some(0), "patching file t.py".into());
                report(agent, &record);
            }
            MessageType::ExecRequest | MessageType::RunEvaluation => {
                let execution_id = message.payload()["execution_id"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap();
                let running = ExecutionRecord::running(execution_id, ExecutionKind::Command);
                report(agent, &running);
                let status = if exit_code == 0 {
                    ExecutionStatus::Ready
                } else {
                    ExecutionStatus::Failed
                };
                report(agent, &running.finish(status, Some(exit_code), command_output.into()));
            }
            _ => {}
        })
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let bus = MemoryBus::new();
        let agent = scripted_agent(&bus, "", 0);
        let mut client = client(&bus, TestSpec::new("demo"));
        assert!(client.ping(Duration::from_secs(5)).await);
        agent.abort();
    }

    #[tokio::test]
    async fn test_ping_times_out_without_agent() {
        let bus = MemoryBus::new();
        let mut client = client(&bus, TestSpec::new("demo"));
        let started = Instant::now();
        assert!(!client.ping(Duration::from_millis(200)).await);
        assert!(started.elapsed() < Duration::from_secs(2));

        let err = client
            .wait_until_ready(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn test_ping_ignores_other_nonce() {
        let bus = MemoryBus::new();
        let agent = responder(&bus, |agent, message| {
            if message.message_type() == MessageType::Ping {
                agent.send_payload(MessageType::Pong, &Ping::new()).unwrap();
            }
        });
        let mut client = client(&bus, TestSpec::new("demo"));
        assert!(!client.ping(Duration::from_millis(200)).await);
        agent.abort();
    }

    #[tokio::test]
    async fn test_exec_returns_terminal_record() {
        let bus = MemoryBus::new();
        let agent = scripted_agent(&bus, "hello\n", 0);
        let mut client = client(&bus, TestSpec::new("demo"));
        let record = client.exec("echo hello", Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Ready);
        assert_eq!(record.output, "hello\n");
        agent.abort();
    }

    #[tokio::test]
    async fn test_exec_failure_is_data() {
        let bus = MemoryBus::new();
        let agent = scripted_agent(&bus, "boom", 2);
        let mut client = client(&bus, TestSpec::new("demo"));
        let record = client.exec("false", Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.exit_code, Some(2));
        agent.abort();
    }

    #[tokio::test]
    async fn test_exec_resends_after_loss() {
        let bus = MemoryBus::new();
        bus.drop_next_to_agent(1);
        let agent = scripted_agent(&bus, "ok", 0);
        let mut client = client(&bus, TestSpec::new("demo"));
        let record = client.exec("true", Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Ready);
        agent.abort();
    }

    #[tokio::test]
    async fn test_exec_times_out_when_never_finished() {
        let bus = MemoryBus::new();
        let agent = responder(&bus, |agent, message| {
            if let Ok(request) = message.parse_payload::<ExecRequest>() {
                report(
                    agent,
                    &ExecutionRecord::running(request.execution_id, ExecutionKind::Command),
                );
            }
        });
        let mut client = client(&bus, TestSpec::new("demo"));
        let err = client
            .exec("sleep 100", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ExecutionTimeout { .. }));
        assert!(err.is_retryable());
        agent.abort();
    }

    #[tokio::test]
    async fn test_exec_timeout_leaves_agent_running() {
        let bus = MemoryBus::new();
        let mut agent_config = testbed_agent::AgentConfig::new(ID);
        agent_config.workdir = std::env::temp_dir();
        let agent = testbed_agent::Agent::new(
            Arc::new(bus.agent(ID).with_poll_window(Duration::from_millis(20))),
            agent_config,
        );
        let shutdown = tokio_util::sync::CancellationToken::new();
        tokio::spawn(agent.run(shutdown.clone()));

        let comm = Arc::new(bus.client(ID).with_poll_window(Duration::from_millis(20)));
        let mut client = TestbedClient::new(
            SandboxId::from(ID),
            comm.clone(),
            TestSpec::new("demo"),
            config(),
        );

        let err = client
            .exec("sleep 2; echo finished", Duration::from_millis(300))
            .await
            .unwrap_err();
        let execution_id = match err {
            CoreError::ExecutionTimeout { execution_id, .. } => execution_id,
            other => panic!("expected execution timeout, got {other:?}"),
        };

        // The command outlives the client's wait and still completes.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut finished = None;
        while finished.is_none() && Instant::now() < deadline {
            finished = comm
                .receive()
                .await
                .into_iter()
                .filter(|m| m.message_type() == MessageType::ExecStatus)
                .filter_map(|m| m.parse_payload::<ExecutionRecord>().ok())
                .find(|r| r.execution_id == execution_id && r.is_terminal());
        }
        let record = finished.expect("agent should report the command's completion");
        assert_eq!(record.status, ExecutionStatus::Ready);
        assert!(record.output.contains("finished"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_exec_busy_is_error() {
        let bus = MemoryBus::new();
        let agent = responder(&bus, |agent, message| {
            if let Ok(request) = message.parse_payload::<ExecRequest>() {
                let record = ExecutionRecord::busy(
                    request.execution_id,
                    ExecutionKind::Command,
                    Uuid::new_v4(),
                );
                report(agent, &record);
            }
        });
        let mut client = client(&bus, TestSpec::new("demo"));
        let err = client.exec("ls", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CoreError::AgentBusy { .. }));
        agent.abort();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let bus = MemoryBus::new();
        let mut client = client(&bus, TestSpec::new("demo"));
        let token = client.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let err = client.exec("ls", Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_apply_patch_appends_newline() {
        let bus = MemoryBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let agent = responder(&bus, move |agent, message| {
            if let Ok(request) = message.parse_payload::<ApplyPatchRequest>() {
                if request.patch.ends_with('\n') {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                let record = ExecutionRecord::running(request.execution_id, ExecutionKind::Patch)
                    .finish(ExecutionStatus::PatchApplied, Some(0), String::new());
                report(agent, &record);
            }
        });
        let mut client = client(&bus, TestSpec::new("demo"));
        let record = client.apply_patch("diff --git a/x b/x").await.unwrap();
        assert_eq!(record.status, ExecutionStatus::PatchApplied);
        assert!(seen.load(Ordering::SeqCst) >= 1);
        agent.abort();
    }

    #[tokio::test]
    async fn test_run_tests_grades_output() {
        let bus = MemoryBus::new();
        let agent = scripted_agent(
            &bus,
            "PASSED t.py::test_keep\nFAILED t.py::test_fix - assert False\n",
            1,
        );
        let mut spec = TestSpec::new("demo");
        spec.fail_to_pass = vec!["t.py::test_fix".into()];
        spec.pass_to_pass = vec!["t.py::test_keep".into()];
        let mut client = client(&bus, spec);

        let result = client
            .run_tests(&["t.py".to_string()], Some("diff --git a/t.py b/t.py"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.patch_applied);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.tests_status.fail_to_pass.failure, vec!["t.py::test_fix"]);
        assert!(!result.has_regressions());
        assert_eq!(result.outcomes.len(), 2);
        agent.abort();
    }

    #[tokio::test]
    async fn test_run_tests_with_bad_patch() {
        let bus = MemoryBus::new();
        let agent = scripted_agent(&bus, "", 0);
        let mut client = client(&bus, TestSpec::new("demo"));
        let files = vec!["a.py".to_string(), "b.py".to_string()];
        let result = client
            .run_tests(&files, Some("not a diff"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.patch_applied);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.outcomes_by_file().len(), 2);
        agent.abort();
    }

    #[tokio::test]
    async fn test_run_tests_requires_files() {
        let bus = MemoryBus::new();
        let mut client = client(&bus, TestSpec::new("demo"));
        let err = client
            .run_tests(&[], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_run_evaluation_uses_gold_patch() {
        let bus = MemoryBus::new();
        let agent = scripted_agent(
            &bus,
            "PASSED t.py::test_fix\nPASSED t.py::test_keep\n",
            0,
        );
        let mut spec = TestSpec::new("demo");
        spec.fail_to_pass = vec!["t.py::test_fix".into()];
        spec.pass_to_pass = vec!["t.py::test_keep".into()];
        spec.gold_patch = Some("diff --git a/t.py b/t.py\n".into());
        let mut client = client(&bus, spec);

        let result = client
            .run_evaluation(None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.patch_applied);
        assert!(result.resolved);
        assert_eq!(result.resolution, ResolvedStatus::Full);
        agent.abort();
    }
}
