use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use keel_core::{KeelError, Result};

/// Arguments handed to a command handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub args: Vec<String>,
    #[serde(default)]
    pub flags: Map<String, Value>,
}

impl CommandInvocation {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            flags: Map::new(),
        }
    }

    pub fn with_flag(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.flags.insert(name.to_string(), value.into());
        self
    }
}

/// What a command handler returns to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub content: String,
    /// Optional structured data returned alongside the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, invocation: CommandInvocation) -> Result<CommandOutput>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CommandOutput>> + Send + 'static,
{
    async fn call(&self, invocation: CommandInvocation) -> Result<CommandOutput> {
        (self)(invocation).await
    }
}

/// Public description of a registered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub owning_extension: String,
}

struct Registration {
    info: CommandInfo,
    handler: Arc<dyn CommandHandler>,
}

/// Command names are unique across all extensions.
#[derive(Default)]
pub struct CommandTable {
    entries: RwLock<BTreeMap<String, Registration>>,
}

pub fn validate_command_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'));
    if ok {
        Ok(())
    } else {
        Err(KeelError::CommandFailed {
            command: name.to_string(),
            reason: "command names are 1-64 characters of letters, digits, '-', '_', ':' or '.'"
                .into(),
        })
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. `admit` runs under the table lock and can refuse
    /// the registration; a name collision never replaces the existing entry.
    pub fn register_if<A>(
        &self,
        owner: &str,
        name: &str,
        description: &str,
        handler: Arc<dyn CommandHandler>,
        admit: A,
    ) -> Result<()>
    where
        A: FnOnce() -> Result<()>,
    {
        validate_command_name(name)?;
        let mut entries = self.entries.write();
        admit()?;
        if let Some(existing) = entries.get(name) {
            return Err(KeelError::CommandNameConflict {
                command: name.to_string(),
                owner: existing.info.owning_extension.clone(),
            });
        }
        entries.insert(
            name.to_string(),
            Registration {
                info: CommandInfo {
                    name: name.to_string(),
                    description: description.to_string(),
                    owning_extension: owner.to_string(),
                },
                handler,
            },
        );
        debug!(extension = owner, command = name, "command registered");
        Ok(())
    }

    pub fn register(
        &self,
        owner: &str,
        name: &str,
        description: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        self.register_if(owner, name, description, handler, || Ok(()))
    }

    pub fn lookup(&self, name: &str) -> Option<(CommandInfo, Arc<dyn CommandHandler>)> {
        self.entries
            .read()
            .get(name)
            .map(|r| (r.info.clone(), Arc::clone(&r.handler)))
    }

    /// All commands, sorted by name.
    pub fn list(&self) -> Vec<CommandInfo> {
        self.entries.read().values().map(|r| r.info.clone()).collect()
    }

    /// Names of the commands owned by `owner`.
    pub fn owned_by(&self, owner: &str) -> Vec<String> {
        self.entries
            .read()
            .values()
            .filter(|r| r.info.owning_extension == owner)
            .map(|r| r.info.name.clone())
            .collect()
    }

    /// Remove every command owned by `owner`; returns the removed names.
    pub fn remove_owned(&self, owner: &str) -> Vec<String> {
        let mut entries = self.entries.write();
        let names: Vec<String> = entries
            .values()
            .filter(|r| r.info.owning_extension == owner)
            .map(|r| r.info.name.clone())
            .collect();
        for name in &names {
            entries.remove(name);
        }
        names
    }
}
