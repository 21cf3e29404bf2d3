//! Command Executor.
//!
//! Builds and sends one parameterized statement at a time, classifies the
//! response, and drives the per-command review/retry/abort state machine.
//! Every command is appended to a shared, append-only log so an observer can
//! display in-flight and historical statements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Notify;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{ServerFault, SyncError, SyncResult};
use crate::protocol::{parse_managed_fault, CellValue, QueryOutcome, Record, ResultSet};
use crate::transport::Transport;

static PARAM_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+$").unwrap());

// `@name` placeholders, skipping `@@` server variables.
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|[^@])@(\w+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    PendingApproval,
    Executing,
    HasError,
    Completed,
    Aborted,
    Failed,
}

impl CommandState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Aborted | CommandState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Approve,
    Retry,
    Abort,
}

#[derive(Debug)]
struct CommandShared {
    state: CommandState,
    last_error: Option<String>,
    last_execute_at: Option<DateTime<Utc>>,
    control: Option<Control>,
}

/// One statement lifecycle instance in the command log.
///
/// The handle is shared between the log and the future returned by
/// [`CommandExecutor::execute`]; `approve`, `retry` and `abort` signal that
/// future and are legal only in the states the state machine allows.
pub struct Command {
    description: String,
    statement_text: String,
    abortable: bool,
    shared: Mutex<CommandShared>,
    signal: Notify,
}

impl Command {
    fn new(description: String, statement_text: String, abortable: bool, review: bool) -> Self {
        Self {
            description,
            statement_text,
            abortable,
            shared: Mutex::new(CommandShared {
                state: if review {
                    CommandState::PendingApproval
                } else {
                    CommandState::Executing
                },
                last_error: None,
                last_execute_at: None,
                control: None,
            }),
            signal: Notify::new(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The statement with parameter values inlined, for display only.
    pub fn statement_text(&self) -> &str {
        &self.statement_text
    }

    pub fn abortable(&self) -> bool {
        self.abortable
    }

    pub fn state(&self) -> CommandState {
        self.shared.lock().unwrap().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().unwrap().last_error.clone()
    }

    pub fn last_execute_at(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().unwrap().last_execute_at
    }

    /// Release a command held in review. Legal only from `PendingApproval`.
    pub fn approve(&self) -> SyncResult<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != CommandState::PendingApproval || shared.control.is_some() {
            return Err(SyncError::InvalidOperation(
                "the command is not awaiting approval".to_string(),
            ));
        }
        shared.state = CommandState::Executing;
        shared.control = Some(Control::Approve);
        drop(shared);
        self.signal.notify_waiters();
        Ok(())
    }

    /// Re-run a failed command. Legal only from `HasError`.
    pub fn retry(&self) -> SyncResult<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != CommandState::HasError || shared.control.is_some() {
            return Err(SyncError::InvalidOperation(
                "the command cannot be retried".to_string(),
            ));
        }
        shared.state = CommandState::Executing;
        shared.control = Some(Control::Retry);
        drop(shared);
        self.signal.notify_waiters();
        Ok(())
    }

    /// Give up on a failed command, rejecting its future. Legal only from
    /// `HasError` and only if the command was sent in error-allowed mode.
    pub fn abort(&self) -> SyncResult<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != CommandState::HasError || !self.abortable || shared.control.is_some() {
            return Err(SyncError::InvalidOperation(
                "the command cannot be aborted".to_string(),
            ));
        }
        shared.state = CommandState::Aborted;
        shared.control = Some(Control::Abort);
        drop(shared);
        self.signal.notify_waiters();
        Ok(())
    }

    fn begin_attempt(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.state = CommandState::Executing;
        shared.last_error = None;
        shared.last_execute_at = Some(Utc::now());
    }

    fn complete(&self) {
        self.shared.lock().unwrap().state = CommandState::Completed;
    }

    fn enter_error(&self, message: String) {
        let mut shared = self.shared.lock().unwrap();
        shared.state = CommandState::HasError;
        shared.last_error = Some(message);
    }

    fn set_failed(&self, message: String) {
        let mut shared = self.shared.lock().unwrap();
        shared.state = CommandState::Failed;
        shared.last_error = Some(message);
    }

    /// Transition to `Aborted` unless the command already reached a terminal
    /// state; a cancellation firing after completion is a no-op.
    fn cancel_if_running(&self, reason: &str) {
        let mut shared = self.shared.lock().unwrap();
        if !shared.state.is_terminal() {
            shared.state = CommandState::Aborted;
            shared.last_error = Some(reason.to_string());
        }
    }

    /// Wait until an approve/retry/abort call signals this command, or the
    /// cancel token fires.
    async fn wait_for_control(&self, cancel: Option<&CancelToken>) -> SyncResult<Control> {
        loop {
            let notified = self.signal.notified();
            if let Some(control) = self.shared.lock().unwrap().control.take() {
                return Ok(control);
            }
            match cancel {
                Some(token) => {
                    tokio::select! {
                        reason = token.cancelled() => {
                            self.cancel_if_running(&reason);
                            return Err(SyncError::Cancelled(reason));
                        }
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// One parameterized statement request, built up fluently.
pub struct Statement {
    description: String,
    text: String,
    parameters: Vec<(String, CellValue)>,
    allow_review: bool,
    allow_error: bool,
    single_result_set: bool,
    cancel: Option<CancelToken>,
}

impl Statement {
    pub fn new(description: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            text: text.into(),
            parameters: Vec::new(),
            allow_review: false,
            allow_error: false,
            single_result_set: false,
            cancel: None,
        }
    }

    pub fn param(mut self, name: &str, value: CellValue) -> Self {
        self.parameters.push((name.to_string(), value));
        self
    }

    /// Hold the command for explicit approval when the executor is in review
    /// mode.
    pub fn allow_review(mut self) -> Self {
        self.allow_review = true;
        self
    }

    /// Deliver recognized managed faults as rejections instead of parking the
    /// command in `HasError`. Also makes the command abortable.
    pub fn allow_error(mut self) -> Self {
        self.allow_error = true;
        self
    }

    /// Require exactly one result set in the response.
    pub fn single_result_set(mut self) -> Self {
        self.single_result_set = true;
        self
    }

    pub fn cancel_on(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn validate(&self) -> SyncResult<()> {
        if self.description.is_empty() {
            return Err(SyncError::argument("description", "must not be empty"));
        }
        if self.text.is_empty() {
            return Err(SyncError::argument("text", "statement text is missing"));
        }
        for (name, _) in &self.parameters {
            if !PARAM_NAME_RE.is_match(name) {
                return Err(SyncError::argument(
                    "parameters",
                    format!("'{}' is not a valid parameter name", name),
                ));
            }
        }
        Ok(())
    }
}

/// Stateless service shared by all tables: sends statements through the
/// transport and owns the process-wide command log.
pub struct CommandExecutor {
    transport: Arc<dyn Transport>,
    commands: Mutex<Vec<Arc<Command>>>,
    review_mode: AtomicBool,
}

impl CommandExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            commands: Mutex::new(Vec::new()),
            review_mode: AtomicBool::new(false),
        }
    }

    /// When set, statements sent with review allowed wait in
    /// `PendingApproval` until [`Command::approve`] is called.
    pub fn set_review_mode(&self, enabled: bool) {
        self.review_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn review_mode(&self) -> bool {
        self.review_mode.load(Ordering::SeqCst)
    }

    /// Snapshot of the append-only command log.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.commands.lock().unwrap().clone()
    }

    /// Execute a statement and return its result sets.
    pub async fn execute(&self, statement: Statement) -> SyncResult<Vec<ResultSet>> {
        statement.validate()?;

        let encoded: Vec<(String, String)> = statement
            .parameters
            .iter()
            .map(|(name, value)| (name.clone(), value.encode_param()))
            .collect();
        let review = self.review_mode() && statement.allow_review;

        let command = Arc::new(Command::new(
            statement.description.clone(),
            render_statement(&statement.text, &statement.parameters),
            statement.allow_error,
            review,
        ));
        self.commands.lock().unwrap().push(command.clone());
        debug!(description = %statement.description, review, "command enqueued");

        if review {
            // Only approve can arrive here: retry and abort are illegal from
            // PendingApproval.
            command.wait_for_control(statement.cancel.as_ref()).await?;
        }

        loop {
            command.begin_attempt();

            let outcome = match &statement.cancel {
                Some(token) => {
                    tokio::select! {
                        reason = token.cancelled() => {
                            command.cancel_if_running(&reason);
                            debug!(description = %statement.description, %reason, "command cancelled in flight");
                            return Err(SyncError::Cancelled(reason));
                        }
                        outcome = self.transport.query(&statement.text, &encoded) => outcome,
                    }
                }
                None => self.transport.query(&statement.text, &encoded).await,
            };

            match outcome {
                Ok(QueryOutcome::Results(sets)) => {
                    if statement.single_result_set && sets.len() != 1 {
                        let message = "zero or multiple result sets were returned".to_string();
                        command.enter_error(format!("invalid data: {}", message));
                        return Err(SyncError::InvalidData(message));
                    }
                    command.complete();
                    return Ok(sets);
                }
                Ok(QueryOutcome::Fault(body)) => {
                    let managed = parse_managed_fault(&body);
                    if let Some(fault) = &managed {
                        if statement.allow_error {
                            command.set_failed(format!("invalid data: {}", fault.message));
                            return Err(SyncError::Server(fault.clone()));
                        }
                    }
                    let message = match &managed {
                        Some(fault) => format!("invalid data: {}", fault.message),
                        None => format!("database error: {}", body.message),
                    };
                    command.enter_error(message);
                }
                Err(SyncError::Transport(message)) => {
                    command.enter_error(format!("transport error: {}", message));
                }
                Err(other) => {
                    // Decode-level faults indicate a protocol mismatch and
                    // fail fast instead of entering the retry loop.
                    command.set_failed(other.to_string());
                    return Err(other);
                }
            }

            match command.wait_for_control(statement.cancel.as_ref()).await? {
                Control::Retry => continue,
                Control::Abort => {
                    return Err(SyncError::Server(ServerFault::local(
                        "the operation was aborted",
                        None,
                        None,
                    )));
                }
                Control::Approve => unreachable!("approve is illegal outside PendingApproval"),
            }
        }
    }

    /// Execute a statement whose response may hold any number of result sets.
    pub async fn batch(&self, statement: Statement) -> SyncResult<Vec<ResultSet>> {
        self.execute(statement).await
    }

    /// Execute a read-only query and return its records.
    pub async fn query(&self, statement: Statement) -> SyncResult<Vec<Record>> {
        let set = self.single(statement).await?;
        if set.affected_rows > 0 {
            return Err(SyncError::InvalidData(
                "a query must not modify any rows".to_string(),
            ));
        }
        Ok(set.rows)
    }

    /// Execute a modifying statement and return the affected-row count.
    pub async fn non_query(&self, statement: Statement) -> SyncResult<i64> {
        let set = self.single(statement).await?;
        if !set.rows.is_empty() {
            return Err(SyncError::InvalidData(
                "a non-query statement must not return rows".to_string(),
            ));
        }
        Ok(set.affected_rows)
    }

    /// Execute a query expected to return at most one single-column row.
    pub async fn scalar(&self, statement: Statement) -> SyncResult<Option<CellValue>> {
        let set = self.single(statement).await?;
        if set.rows.len() > 1 {
            return Err(SyncError::InvalidData(
                "too many rows returned for a scalar value".to_string(),
            ));
        }
        match set.rows.into_iter().next() {
            None => Ok(None),
            Some(row) => {
                if row.len() != 1 {
                    return Err(SyncError::InvalidData(
                        "exactly one column must be queried for a scalar value".to_string(),
                    ));
                }
                Ok(row.into_values().next())
            }
        }
    }

    async fn single(&self, statement: Statement) -> SyncResult<ResultSet> {
        let sets = self.execute(statement.single_result_set()).await?;
        // execute() already enforced exactly one set.
        Ok(sets.into_iter().next().expect("single result set"))
    }
}

/// Inline parameter values into the statement text for display.
fn render_statement(text: &str, parameters: &[(String, CellValue)]) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[2];
            match parameters.iter().find(|(n, _)| n == name) {
                Some((_, value)) => format!("{}'{}'", &caps[1], inline_text(value)),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn inline_text(value: &CellValue) -> String {
    match value {
        CellValue::Text(s) => s.clone(),
        other => other.encode_param(),
    }
}
