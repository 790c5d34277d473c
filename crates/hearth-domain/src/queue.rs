use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use crate::command::{Command, CommandState};
use crate::error::DomainError;
use crate::observer::{ObserverList, Subscription};

/// Grace period between a command reaching a terminal state and its removal
/// from the queue.
const REMOVE_GRACE: Duration = Duration::minutes(5);

/// A non-owning reference to a queued command. Upgrading fails once the
/// queue has removed the command.
pub type CommandHandle = Weak<Command>;

pub type CommandHandler = Arc<dyn Fn(CommandHandle) + Send + Sync>;

pub(crate) struct QueueShared {
    inner: Mutex<QueueInner>,
    on_added: ObserverList<Arc<Command>>,
    on_removed: ObserverList<Arc<Command>>,
}

#[derive(Default)]
struct QueueInner {
    commands: BTreeMap<String, Arc<Command>>,
    remove_queue: VecDeque<(DateTime<Utc>, String)>,
    handlers: HashMap<(String, String), CommandHandler>,
    default_handler: Option<CommandHandler>,
    test_now: Option<DateTime<Utc>>,
}

/// The queue of live command instances. Owns the instances; dispatches each
/// new command to the matching handler and reaps terminal commands after a
/// grace period.
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        CommandQueue {
            shared: Arc::new(QueueShared {
                inner: Mutex::new(QueueInner::default()),
                on_added: ObserverList::new(),
                on_removed: ObserverList::new(),
            }),
        }
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a command and dispatch it to its handler, if one is
    /// registered. Without a matching handler the command stays queued until
    /// one arrives.
    pub fn add(&self, command: Arc<Command>) -> Result<(), DomainError> {
        let handler = {
            let mut inner = self.lock();
            if inner.commands.contains_key(command.id()) {
                return Err(DomainError::DuplicateCommand(command.id().to_string()));
            }
            command.attach_to_queue(Arc::downgrade(&self.shared));
            inner
                .commands
                .insert(command.id().to_string(), command.clone());
            inner
                .handlers
                .get(&(command.component().to_string(), command.name().to_string()))
                .cloned()
                .or_else(|| inner.default_handler.clone())
        };

        self.shared.on_added.notify(&command);
        if let Some(handler) = handler {
            handler(Arc::downgrade(&command));
        } else {
            debug!(id = command.id(), name = command.name(), "command left queued, no handler");
        }
        self.cleanup();
        Ok(())
    }

    /// Register the handler for `(component_path, command_name)`. Queued
    /// commands that match fire immediately. Specific handlers cannot be
    /// added once a default handler exists.
    pub fn add_handler(
        &self,
        component_path: &str,
        command_name: &str,
        handler: impl Fn(CommandHandle) + Send + Sync + 'static,
    ) -> Result<(), DomainError> {
        let handler: CommandHandler = Arc::new(handler);
        let pending = {
            let mut inner = self.lock();
            if inner.default_handler.is_some() {
                return Err(DomainError::HandlerAfterDefault);
            }
            let key = (component_path.to_string(), command_name.to_string());
            if inner.handlers.contains_key(&key) {
                return Err(DomainError::HandlerExists {
                    component: component_path.to_string(),
                    command: command_name.to_string(),
                });
            }
            let pending: Vec<Arc<Command>> = inner
                .commands
                .values()
                .filter(|c| {
                    c.state() == CommandState::Queued
                        && c.component() == component_path
                        && c.name() == command_name
                })
                .cloned()
                .collect();
            inner.handlers.insert(key, handler.clone());
            pending
        };
        for command in pending {
            handler(Arc::downgrade(&command));
        }
        Ok(())
    }

    /// Register the fallback handler for commands with no specific handler.
    /// Must be installed last; queued unmatched commands fire immediately.
    pub fn add_default_handler(
        &self,
        handler: impl Fn(CommandHandle) + Send + Sync + 'static,
    ) -> Result<(), DomainError> {
        let handler: CommandHandler = Arc::new(handler);
        let pending = {
            let mut inner = self.lock();
            if inner.default_handler.is_some() {
                return Err(DomainError::HandlerAfterDefault);
            }
            let pending: Vec<Arc<Command>> = inner
                .commands
                .values()
                .filter(|c| {
                    c.state() == CommandState::Queued
                        && !inner.handlers.contains_key(&(
                            c.component().to_string(),
                            c.name().to_string(),
                        ))
                })
                .cloned()
                .collect();
            inner.default_handler = Some(handler.clone());
            pending
        };
        for command in pending {
            handler(Arc::downgrade(&command));
        }
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<Arc<Command>> {
        self.lock().commands.get(id).cloned()
    }

    pub fn commands(&self) -> Vec<Arc<Command>> {
        self.lock().commands.values().cloned().collect()
    }

    pub fn on_command_added(
        &self,
        callback: impl Fn(&Arc<Command>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback = Arc::new(callback);
        // Replay pre-existing commands to the new subscriber only.
        for command in self.commands() {
            callback(&command);
        }
        let cb = callback.clone();
        self.shared.on_added.add(move |command| cb(command))
    }

    pub fn on_command_removed(
        &self,
        callback: impl Fn(&Arc<Command>) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.on_removed.add(callback)
    }

    /// Remove a command immediately. Returns `false` if it was not queued.
    pub fn remove(&self, id: &str) -> bool {
        self.shared.remove(id)
    }

    /// Reap terminal commands whose grace period has elapsed.
    pub fn cleanup(&self) {
        let mut due = Vec::new();
        {
            let mut inner = self.lock();
            let now = inner.test_now.unwrap_or_else(Utc::now);
            while let Some((at, _)) = inner.remove_queue.front() {
                if *at >= now {
                    break;
                }
                if let Some((_, id)) = inner.remove_queue.pop_front() {
                    due.push(id);
                }
            }
        }
        for id in due {
            self.shared.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_now_for_test(&self, now: DateTime<Utc>) {
        self.lock().test_now = Some(now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl QueueShared {
    /// Schedule `id` for removal after the grace period.
    pub(crate) fn delayed_remove(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.commands.contains_key(id) {
            return;
        }
        let now = inner.test_now.unwrap_or_else(Utc::now);
        inner.remove_queue.push_back((now + REMOVE_GRACE, id.to_string()));
    }

    fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.commands.remove(id)
        };
        match removed {
            Some(command) => {
                command.detach_from_queue();
                self.on_removed.notify(&command);
                true
            }
            None => false,
        }
    }
}
