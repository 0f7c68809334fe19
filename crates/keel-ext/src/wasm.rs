//! WebAssembly entry files, behind the `wasm` feature.
//!
//! ## Guest ABI
//!
//! A guest module exports:
//!
//! - `memory`: exported linear memory
//! - `keel_malloc(size: u32) -> u32`: allocate `size` bytes in guest memory
//! - `keel_name() -> u64`: the extension's name as a JSON string
//! - `keel_activate() -> u64`: JSON `{"commands": [{"name", "description"}], "hooks": ["event", ...]}`
//! - `keel_invoke(ptr: u32, len: u32) -> u64`: run a command; input is
//!   `{"command", "args", "flags"}`, output is `{"result", "data"?}` or `{"error"}`
//! - `keel_on_event(ptr: u32, len: u32) -> u64`: optional; input is a hook event
//! - `keel_deactivate() -> u64`: optional
//!
//! Every `u64` return is packed as `(ptr << 32) | len` pointing at UTF-8 JSON.
//!
//! Each call runs in a fresh, fuel-limited store with no host imports, so a
//! guest keeps no state between calls and cannot reach host capabilities
//! directly. Its commands and hooks are registered through the capability
//! context on its behalf, so the manifest's permissions still apply.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module, Store};

use keel_core::{KeelError, Result};

use crate::commands::{CommandHandler, CommandInvocation, CommandOutput};
use crate::context::ExtensionContext;
use crate::guard::PathGuard;
use crate::hooks::{HookEvent, HookHandler};
use crate::loader::{ExtensionModule, LoadRequest, ModuleLoader};

/// Instruction budget per guest call.
pub const DEFAULT_FUEL_PER_CALL: u64 = 10_000_000;

pub struct WasmLoader {
    engine: Engine,
    fuel_per_call: u64,
}

impl WasmLoader {
    pub fn new() -> Result<Self> {
        Self::with_fuel(DEFAULT_FUEL_PER_CALL)
    }

    pub fn with_fuel(fuel_per_call: u64) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|e| KeelError::LoadFailed {
            extension: "wasm".into(),
            reason: format!("failed to create WASM engine: {e}"),
        })?;
        Ok(Self {
            engine,
            fuel_per_call,
        })
    }
}

#[async_trait]
impl ModuleLoader for WasmLoader {
    fn kind(&self) -> &'static str {
        "wasm"
    }

    fn can_load(&self, request: &LoadRequest) -> bool {
        PathGuard::is_safe_entry_file(&request.entry_path)
            && request
                .entry_path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("wasm"))
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn ExtensionModule>> {
        let extension = request.manifest.name.clone();
        let bytes = tokio::fs::read(&request.entry_path).await?;

        let engine = self.engine.clone();
        let ext = extension.clone();
        let module = tokio::task::spawn_blocking(move || {
            Module::new(&engine, &bytes).map_err(|e| KeelError::LoadFailed {
                extension: ext,
                reason: format!("failed to compile wasm: {e}"),
            })
        })
        .await
        .map_err(|e| KeelError::LoadFailed {
            extension: extension.clone(),
            reason: format!("compile task failed: {e}"),
        })??;

        let guest = Arc::new(WasmGuest {
            engine: self.engine.clone(),
            module,
            fuel_per_call: self.fuel_per_call,
        });

        let load_failed = |reason: String| KeelError::LoadFailed {
            extension: extension.clone(),
            reason,
        };
        let name = guest.call_async("keel_name", None).await.map_err(load_failed)?;
        let name = name
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| load_failed("keel_name did not return a JSON string".into()))?;
        debug!(extension = %extension, reported = %name, "wasm module compiled");

        Ok(Arc::new(WasmExtension { name, guest }))
    }
}

struct WasmGuest {
    engine: Engine,
    module: Module,
    fuel_per_call: u64,
}

impl WasmGuest {
    fn has_export(&self, name: &str) -> bool {
        self.module.exports().any(|e| e.name() == name)
    }

    /// Instantiate, call one export, and read back its JSON result.
    ///
    /// Errors are plain reasons; callers wrap them in the error for their phase.
    fn call(&self, export: &str, input: Option<&[u8]>) -> std::result::Result<Value, String> {
        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(self.fuel_per_call)
            .map_err(|e| format!("failed to set fuel: {e}"))?;

        // Empty linker: the guest gets no imports.
        let linker: Linker<()> = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| format!("failed to instantiate WASM module: {e}"))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or("module does not export 'memory'")?;

        let packed = match input {
            Some(bytes) => {
                let malloc = instance
                    .get_typed_func::<u32, u32>(&mut store, "keel_malloc")
                    .map_err(|e| format!("missing export 'keel_malloc': {e}"))?;
                let ptr = malloc
                    .call(&mut store, bytes.len() as u32)
                    .map_err(|e| format!("keel_malloc failed: {e}"))?;

                let mem = memory.data_mut(&mut store);
                let end = ptr as usize + bytes.len();
                if end > mem.len() {
                    return Err("input exceeds guest memory bounds".into());
                }
                mem[ptr as usize..end].copy_from_slice(bytes);

                let func = instance
                    .get_typed_func::<(u32, u32), u64>(&mut store, export)
                    .map_err(|e| format!("missing export '{export}': {e}"))?;
                func.call(&mut store, (ptr, bytes.len() as u32))
                    .map_err(|e| format!("{export} failed: {e}"))?
            }
            None => {
                let func = instance
                    .get_typed_func::<(), u64>(&mut store, export)
                    .map_err(|e| format!("missing export '{export}': {e}"))?;
                func.call(&mut store, ())
                    .map_err(|e| format!("{export} failed: {e}"))?
            }
        };

        // High 32 bits = pointer, low 32 bits = length.
        let out_ptr = (packed >> 32) as usize;
        let out_len = (packed & 0xFFFF_FFFF) as usize;
        let mem = memory.data(&store);
        if out_ptr + out_len > mem.len() {
            return Err("result exceeds guest memory bounds".into());
        }
        serde_json::from_slice(&mem[out_ptr..out_ptr + out_len])
            .map_err(|e| format!("invalid JSON from {export}: {e}"))
    }

    async fn call_async(
        self: &Arc<Self>,
        export: &'static str,
        input: Option<Vec<u8>>,
    ) -> std::result::Result<Value, String> {
        let guest = Arc::clone(self);
        tokio::task::spawn_blocking(move || guest.call(export, input.as_deref()))
            .await
            .map_err(|e| format!("guest call {export} did not complete: {e}"))?
    }
}

#[derive(Deserialize)]
struct Activation {
    #[serde(default)]
    commands: Vec<DeclaredCommand>,
    #[serde(default)]
    hooks: Vec<String>,
}

#[derive(Deserialize)]
struct DeclaredCommand {
    name: String,
    #[serde(default)]
    description: String,
}

struct WasmExtension {
    name: String,
    guest: Arc<WasmGuest>,
}

#[async_trait]
impl ExtensionModule for WasmExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn activate(&self, ctx: ExtensionContext) -> Result<()> {
        let activation_failed = |reason: String| KeelError::ActivationFailed {
            extension: self.name.clone(),
            reason,
        };
        let declared = self
            .guest
            .call_async("keel_activate", None)
            .await
            .map_err(activation_failed)?;
        let activation: Activation = serde_json::from_value(declared).map_err(|e| {
            activation_failed(format!("keel_activate returned an unexpected shape: {e}"))
        })?;

        for command in activation.commands {
            let handler = Arc::new(WasmCommand {
                command: command.name.clone(),
                guest: Arc::clone(&self.guest),
            });
            ctx.register_command(&command.name, &command.description, handler)?;
        }

        if !activation.hooks.is_empty() && !self.guest.has_export("keel_on_event") {
            return Err(activation_failed(
                "declares hooks but does not export keel_on_event".into(),
            ));
        }
        for event in activation.hooks {
            let handler = Arc::new(WasmHook {
                extension: self.name.clone(),
                guest: Arc::clone(&self.guest),
            });
            ctx.register_hook(&event, handler)?;
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if self.guest.has_export("keel_deactivate") {
            self.guest
                .call_async("keel_deactivate", None)
                .await
                .map_err(|reason| KeelError::Service {
                    service: self.name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}

struct WasmCommand {
    command: String,
    guest: Arc<WasmGuest>,
}

#[async_trait]
impl CommandHandler for WasmCommand {
    async fn call(&self, invocation: CommandInvocation) -> Result<CommandOutput> {
        let input = json!({
            "command": self.command,
            "args": invocation.args,
            "flags": invocation.flags,
        });
        let command_failed = |reason: String| KeelError::CommandFailed {
            command: self.command.clone(),
            reason,
        };
        let result = self
            .guest
            .call_async("keel_invoke", Some(serde_json::to_vec(&input)?))
            .await
            .map_err(command_failed)?;

        if let Some(err) = result.get("error") {
            return Err(command_failed(
                err.as_str().map_or_else(|| err.to_string(), str::to_string),
            ));
        }
        let content = match result.get("result") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => result.to_string(),
        };
        Ok(CommandOutput {
            content,
            data: result.get("data").cloned(),
        })
    }
}

struct WasmHook {
    extension: String,
    guest: Arc<WasmGuest>,
}

#[async_trait]
impl HookHandler for WasmHook {
    async fn handle(&self, event: HookEvent) -> Result<()> {
        let hook_failed = |reason: String| KeelError::Service {
            service: self.extension.clone(),
            reason,
        };
        let result = self
            .guest
            .call_async("keel_on_event", Some(serde_json::to_vec(&event)?))
            .await
            .map_err(hook_failed)?;
        match result.get("error") {
            Some(err) => Err(hook_failed(err.to_string())),
            None => Ok(()),
        }
    }
}
