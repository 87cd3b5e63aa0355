use async_trait::async_trait;
use devicehub_protocol::action::{LogLevel, TestDetails};
use devicehub_protocol::{ActionType, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::action::{Action, TestStart};
use crate::device::{ActionHandler, Device, LogWriter};
use crate::error::{HubError, Result};
use crate::manager::DeviceManager;
use crate::sync::ExtendedWaitGroup;

/// Runs one action in push mode: attaches itself as the device's action
/// handler, posts the request and waits on a wait group whose deadline the
/// caller may extend while the device works.
pub struct ActionExecutor {
    devices: Arc<DeviceManager>,
}

struct Pending {
    action_type: ActionType,
    action_id: String,
    log_writer: Arc<dyn LogWriter>,
    outcome: Mutex<Option<Option<Response>>>,
    finished: AtomicBool,
    group: Arc<ExtendedWaitGroup>,
}

impl Pending {
    async fn finish(&self, outcome: Option<Response>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.outcome.lock().await = Some(outcome);
        self.group.done();
    }
}

#[async_trait]
impl ActionHandler for Pending {
    async fn on_action_response(&self, device_id: &str, response: Option<&Response>) {
        let Some(response) = response else {
            self.log_writer.error("executor", "Device Disconnected");
            self.finish(None).await;
            return;
        };

        let ours = response.action_type == self.action_type
            && (response.action_id.is_empty() || response.action_id == self.action_id);
        if ours {
            self.finish(Some(response.clone())).await;
            return;
        }

        match response.action_type {
            ActionType::Log => {
                if let Some(log) = &response.payload.log_data {
                    self.log_writer.app_log(log);
                }
            }
            ActionType::Performance => {
                if let Some(perf) = &response.payload.performance_data {
                    self.log_writer.performance(perf, "");
                }
            }
            other => debug!("Executor on {} ignoring {} response", device_id, other),
        }
    }
}

impl ActionExecutor {
    pub fn new(devices: Arc<DeviceManager>) -> Self {
        Self { devices }
    }

    pub async fn execute(
        &self,
        device: &Arc<dyn Device>,
        action: &mut dyn Action,
        timeout: Duration,
    ) -> Result<()> {
        self.execute_with(device, action, Arc::new(ExtendedWaitGroup::new()), timeout)
            .await
    }

    /// Like [`execute`](Self::execute) with a caller-owned wait group, so the
    /// deadline can be moved with [`ExtendedWaitGroup::update_until`]
    pub async fn execute_with(
        &self,
        device: &Arc<dyn Device>,
        action: &mut dyn Action,
        group: Arc<ExtendedWaitGroup>,
        timeout: Duration,
    ) -> Result<()> {
        let mut request = action.request();
        request.action_id = uuid::Uuid::new_v4().to_string();

        group.add(1);
        let pending = Arc::new(Pending {
            action_type: request.action_type,
            action_id: request.action_id.clone(),
            log_writer: device.core().log_writer().await,
            outcome: Mutex::new(None),
            finished: AtomicBool::new(false),
            group: Arc::clone(&group),
        });

        let core = device.core();
        let handler_id = core.add_action_handler(pending.clone()).await;

        let waited = match self.devices.post_request(device, &request).await {
            Ok(()) => group.wait_with_timeout(timeout).await,
            Err(e) => {
                pending.finish(None).await;
                Err(e)
            }
        };
        core.remove_action_handler(handler_id).await;
        waited?;

        let outcome = pending.outcome.lock().await.take().flatten();
        match outcome {
            Some(response) => action.accept(&response),
            None => Err(HubError::DeviceDisconnected),
        }
    }
}

/// Bound for one test method when the app reports no timeout of its own
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outcome of one test run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRunReport {
    /// The app accepted the `ExecuteTest` request
    pub started: bool,
    /// Verdict carried by `ExecutionResult`
    pub passed: bool,
    /// Finished methods and their verdicts, in order
    pub methods: Vec<(String, bool)>,
}

/// Runs a test on the app and follows it until `ExecutionResult`
///
/// The wait starts with the caller's timeout. The app moves the deadline:
/// an accepted `ExecuteTest` with a timeout and every `ExecuteMethodStart`
/// push it to now plus the reported timeout (or [`DEFAULT_TEST_TIMEOUT`]).
pub struct TestRunExecutor {
    devices: Arc<DeviceManager>,
}

struct TestRun {
    action_id: String,
    log_writer: Arc<dyn LogWriter>,
    report: Mutex<TestRunReport>,
    disconnected: AtomicBool,
    finished: AtomicBool,
    group: Arc<ExtendedWaitGroup>,
}

fn reported_timeout(details: Option<&TestDetails>) -> Option<Duration> {
    details
        .filter(|d| d.timeout > 0)
        .map(|d| Duration::from_millis(d.timeout as u64))
}

impl TestRun {
    fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.group.done();
        }
    }

    fn extend(&self, timeout: Duration) {
        self.group.update_until(Instant::now() + timeout);
    }
}

#[async_trait]
impl ActionHandler for TestRun {
    async fn on_action_response(&self, device_id: &str, response: Option<&Response>) {
        let Some(response) = response else {
            self.log_writer.error("testrunner", "Device Disconnected");
            self.disconnected.store(true, Ordering::SeqCst);
            self.finish();
            return;
        };
        let details = response.payload.test_details.as_ref();

        match response.action_type {
            ActionType::ExecuteTest => {
                if !response.action_id.is_empty() && response.action_id != self.action_id {
                    debug!("Ignoring ExecuteTest {} on {}", response.action_id, device_id);
                    return;
                }
                if !response.success {
                    self.log_writer.error("testrunner", "Starting test failed");
                    self.finish();
                    return;
                }
                self.report.lock().await.started = true;
                if let Some(timeout) = reported_timeout(details) {
                    self.log_writer
                        .log("testrunner", &format!("Timeout: {:?}", timeout));
                    self.extend(timeout);
                }
            }
            ActionType::ExecuteMethodStart => {
                if !response.success {
                    return;
                }
                let name = details.map(|d| d.test.as_str()).unwrap_or_default();
                let timeout = reported_timeout(details).unwrap_or(DEFAULT_TEST_TIMEOUT);
                self.log_writer.log("testrunner", &format!("Start: {}", name));
                self.extend(timeout);
            }
            ActionType::ExecuteMethodFinished => {
                let name = details.map(|d| d.test.clone()).unwrap_or_default();
                if response.success {
                    self.log_writer
                        .log("testrunner", &format!("Test {} Passed", name));
                } else {
                    self.log_writer
                        .error("testrunner", &format!("Test {} Failed", name));
                }
                self.report.lock().await.methods.push((name, response.success));
            }
            ActionType::ExecutionResult => {
                if response.success {
                    self.log_writer.log("testrunner", "Test finished successfully");
                } else {
                    self.log_writer.error("testrunner", "Test finished with errors");
                }
                self.report.lock().await.passed = response.success;
                self.finish();
            }
            ActionType::Log => {
                if let Some(log) = &response.payload.log_data {
                    self.log_writer.app_log(log);
                    // an unhandled exception ends the run
                    if log.level == LogLevel::Exception {
                        self.finish();
                    }
                }
            }
            ActionType::Performance => {
                if let Some(perf) = &response.payload.performance_data {
                    self.log_writer.performance(perf, "");
                }
            }
            other => debug!("Test run on {} ignoring {} response", device_id, other),
        }
    }
}

impl TestRunExecutor {
    pub fn new(devices: Arc<DeviceManager>) -> Self {
        Self { devices }
    }

    /// Start `test` and wait for its `ExecutionResult`
    ///
    /// Fails with `WaitTimeout` once the current deadline passes without a
    /// result, and with `DeviceDisconnected` if the agent goes away.
    pub async fn execute(
        &self,
        device: &Arc<dyn Device>,
        test: &TestStart,
        timeout: Duration,
    ) -> Result<TestRunReport> {
        let mut request = test.request();
        request.action_id = uuid::Uuid::new_v4().to_string();

        let group = Arc::new(ExtendedWaitGroup::new());
        group.add(1);
        group.update_until(Instant::now() + timeout);
        let log_writer = device.core().log_writer().await;
        let run = Arc::new(TestRun {
            action_id: request.action_id.clone(),
            log_writer: Arc::clone(&log_writer),
            report: Mutex::new(TestRunReport::default()),
            disconnected: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            group: Arc::clone(&group),
        });

        let core = device.core();
        let handler_id = core.add_action_handler(run.clone()).await;
        let waited = match self.devices.post_request(device, &request).await {
            Ok(()) => group.wait_bounded().await,
            Err(e) => Err(e),
        };
        core.remove_action_handler(handler_id).await;

        if let Err(e) = waited {
            log_writer.error("testrunner", &e.to_string());
            return Err(e);
        }
        if run.disconnected.load(Ordering::SeqCst) {
            return Err(HubError::DeviceDisconnected);
        }
        let report = run.report.lock().await.clone();
        Ok(report)
    }
}
