use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::{Mutex, Weak};

use crate::error::{DomainError, ErrorInfo};
use crate::observer::{ObserverList, Subscription};
use crate::queue::QueueShared;
use crate::schema::validate_object;

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Cloud,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Cloud => "cloud",
        }
    }
}

/// Lifecycle state of a command.
///
/// ```text
/// queued → inProgress → done
/// queued → inProgress → paused → inProgress → …
/// queued → inProgress → error → inProgress → …
/// queued|inProgress|paused|error → cancelled|aborted|expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    InProgress,
    Paused,
    Error,
    Done,
    Cancelled,
    Aborted,
    Expired,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Done
                | CommandState::Cancelled
                | CommandState::Aborted
                | CommandState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::InProgress => "inProgress",
            CommandState::Paused => "paused",
            CommandState::Error => "error",
            CommandState::Done => "done",
            CommandState::Cancelled => "cancelled",
            CommandState::Aborted => "aborted",
            CommandState::Expired => "expired",
        }
    }
}

impl FromStr for CommandState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(CommandState::Queued),
            "inProgress" => Ok(CommandState::InProgress),
            "paused" => Ok(CommandState::Paused),
            "error" => Ok(CommandState::Error),
            "done" => Ok(CommandState::Done),
            "cancelled" => Ok(CommandState::Cancelled),
            "aborted" => Ok(CommandState::Aborted),
            "expired" => Ok(CommandState::Expired),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of a command changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    State,
    Progress,
    Results,
    Error,
}

#[derive(Debug)]
struct Dynamic {
    state: CommandState,
    progress: Map<String, Value>,
    results: Map<String, Value>,
    error: Option<ErrorInfo>,
}

impl Default for Dynamic {
    fn default() -> Self {
        Dynamic {
            state: CommandState::Queued,
            progress: Map::new(),
            results: Map::new(),
            error: None,
        }
    }
}

/// A single command instance, owned by the queue. Handlers hold a
/// [`Weak`] reference that goes dead once the queue removes the command.
pub struct Command {
    id: String,
    name: String,
    component: String,
    origin: Origin,
    parameters: Map<String, Value>,
    creation_time: DateTime<Utc>,
    progress_schema: Map<String, Value>,
    results_schema: Map<String, Value>,
    dynamic: Mutex<Dynamic>,
    observers: ObserverList<CommandEvent>,
    queue: Mutex<Weak<QueueShared>>,
}

impl Command {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        name: String,
        component: String,
        origin: Origin,
        parameters: Map<String, Value>,
        progress_schema: Map<String, Value>,
        results_schema: Map<String, Value>,
    ) -> Command {
        Command {
            id,
            name,
            component,
            origin,
            parameters,
            creation_time: Utc::now(),
            progress_schema,
            results_schema,
            dynamic: Mutex::new(Dynamic::default()),
            observers: ObserverList::new(),
            queue: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn state(&self) -> CommandState {
        self.lock().state
    }

    pub fn progress(&self) -> Map<String, Value> {
        self.lock().progress.clone()
    }

    pub fn results(&self) -> Map<String, Value> {
        self.lock().results.clone()
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.lock().error.clone()
    }

    pub fn observe(
        &self,
        callback: impl Fn(&CommandEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.add(callback)
    }

    /// Validate `progress` against the command definition and move to
    /// `inProgress`. Allowed even with unchanged progress, e.g. 0% → 0%.
    pub fn set_progress(&self, progress: Map<String, Value>) -> Result<(), DomainError> {
        validate_object(&progress, &self.progress_schema)?;
        self.transition(CommandState::InProgress)?;
        let changed = {
            let mut dynamic = self.lock();
            if dynamic.progress != progress {
                dynamic.progress = progress;
                true
            } else {
                false
            }
        };
        if changed {
            self.observers.notify(&CommandEvent::Progress);
        }
        Ok(())
    }

    /// Validate `results`, transition to `done` and schedule removal from
    /// the queue.
    pub fn complete(&self, results: Map<String, Value>) -> Result<(), DomainError> {
        validate_object(&results, &self.results_schema)?;
        let changed = {
            let mut dynamic = self.lock();
            if dynamic.results != results {
                dynamic.results = results;
                true
            } else {
                false
            }
        };
        if changed {
            self.observers.notify(&CommandEvent::Results);
        }
        self.transition(CommandState::Done)?;
        self.remove_from_queue();
        Ok(())
    }

    pub fn pause(&self) -> Result<(), DomainError> {
        self.transition(CommandState::Paused)
    }

    /// Record a structured error and move to the (recoverable) `error`
    /// state.
    pub fn set_error(&self, error: ErrorInfo) -> Result<(), DomainError> {
        self.lock().error = Some(error);
        self.observers.notify(&CommandEvent::Error);
        self.transition(CommandState::Error)
    }

    pub fn abort(&self, error: Option<ErrorInfo>) -> Result<(), DomainError> {
        if error.is_some() {
            self.lock().error = error;
            self.observers.notify(&CommandEvent::Error);
        }
        self.transition(CommandState::Aborted)?;
        self.remove_from_queue();
        Ok(())
    }

    pub fn cancel(&self) -> Result<(), DomainError> {
        self.transition(CommandState::Cancelled)?;
        self.remove_from_queue();
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        let dynamic = self.lock();
        let mut out = json!({
            "id": self.id,
            "name": self.name,
            "component": self.component,
            "parameters": Value::Object(self.parameters.clone()),
            "progress": Value::Object(dynamic.progress.clone()),
            "results": Value::Object(dynamic.results.clone()),
            "state": dynamic.state.as_str(),
        });
        if let Some(error) = &dynamic.error {
            out["error"] = json!(error);
        }
        out
    }

    pub(crate) fn attach_to_queue(&self, queue: Weak<QueueShared>) {
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = queue;
    }

    pub(crate) fn detach_from_queue(&self) {
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = Weak::new();
    }

    fn transition(&self, to: CommandState) -> Result<(), DomainError> {
        {
            let mut dynamic = self.lock();
            let from = dynamic.state;
            if from == to {
                return Ok(());
            }
            if to == CommandState::Queued || from.is_terminal() {
                return Err(DomainError::InvalidStateTransition {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            dynamic.state = to;
        }
        self.observers.notify(&CommandEvent::State);
        Ok(())
    }

    fn remove_from_queue(&self) {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(queue) = queue.upgrade() {
            queue.delayed_remove(&self.id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Dynamic> {
        self.dynamic.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("component", &self.component)
            .field("state", &self.state().as_str())
            .finish()
    }
}

/// Fields extracted from a command JSON document, before routing and id
/// assignment.
#[derive(Debug)]
pub(crate) struct ParsedCommand {
    pub id: Option<String>,
    pub name: String,
    pub component: String,
    pub parameters: Map<String, Value>,
}

pub(crate) fn parse_command(value: &Value) -> Result<ParsedCommand, DomainError> {
    let dict = value.as_object().ok_or(DomainError::ObjectExpected)?;
    let name = dict
        .get("name")
        .and_then(Value::as_str)
        .ok_or(DomainError::CommandNameMissing)?
        .to_string();
    let parameters = match dict.get("parameters") {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(DomainError::ObjectExpected),
    };
    Ok(ParsedCommand {
        id: dict.get("id").and_then(Value::as_str).map(str::to_string),
        name,
        component: dict
            .get("component")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> Command {
        Command::new(
            "1".into(),
            "t1.c".into(),
            "comp1".into(),
            Origin::Local,
            Map::new(),
            Map::new(),
            Map::new(),
        )
    }

    #[test]
    fn fresh_command_is_queued() {
        let cmd = command();
        assert_eq!(cmd.state(), CommandState::Queued);
        assert!(!cmd.state().is_terminal());
    }

    #[test]
    fn progress_moves_to_in_progress() {
        let cmd = command();
        cmd.set_progress(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
    }

    #[test]
    fn pause_and_resume() {
        let cmd = command();
        cmd.set_progress(Map::new()).unwrap();
        cmd.pause().unwrap();
        assert_eq!(cmd.state(), CommandState::Paused);
        cmd.set_progress(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
    }

    #[test]
    fn terminal_states_are_final() {
        let cmd = command();
        cmd.complete(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::Done);

        let err = cmd.set_progress(Map::new()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert!(cmd.cancel().is_err());
    }

    #[test]
    fn queued_is_never_a_target() {
        let cmd = command();
        cmd.set_progress(Map::new()).unwrap();
        let err = cmd.transition(CommandState::Queued).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    #[test]
    fn error_state_is_recoverable() {
        let cmd = command();
        cmd.set_progress(Map::new()).unwrap();
        cmd.set_error(ErrorInfo::new("commands", "boom", "went wrong"))
            .unwrap();
        assert_eq!(cmd.state(), CommandState::Error);
        cmd.set_progress(Map::new()).unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
        assert!(cmd.error().is_some());
    }

    #[test]
    fn abort_records_error_and_terminates() {
        let cmd = command();
        cmd.abort(Some(ErrorInfo::new("commands", "x", "y"))).unwrap();
        assert_eq!(cmd.state(), CommandState::Aborted);
        assert_eq!(cmd.error().unwrap().code, "x");
    }

    #[test]
    fn rejects_undeclared_results() {
        let cmd = command();
        let mut results = Map::new();
        results.insert("unknown".into(), Value::Bool(true));
        assert!(cmd.complete(results).is_err());
        // The failed validation must not have changed state.
        assert_eq!(cmd.state(), CommandState::Queued);
    }

    #[test]
    fn parses_command_json() {
        let parsed = parse_command(&serde_json::json!({
            "name": "t1.c",
            "component": "comp1",
            "parameters": {"level": 5},
        }))
        .unwrap();
        assert_eq!(parsed.name, "t1.c");
        assert_eq!(parsed.component, "comp1");
        assert_eq!(parsed.parameters.get("level"), Some(&serde_json::json!(5)));
        assert!(parsed.id.is_none());
    }

    #[test]
    fn missing_name_is_an_error() {
        let err = parse_command(&serde_json::json!({"parameters": {}})).unwrap_err();
        assert!(matches!(err, DomainError::CommandNameMissing));
    }
}
