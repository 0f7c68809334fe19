//! The permission-scoped API surface handed to an extension's activation
//! routine.
//!
//! Every operation re-checks its permission on each call, so a context is
//! safe to hold onto even if it is cloned or outlives the activation. A
//! context can also be revoked, after which all registrations fail.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use keel_core::{KeelError, Result};

use crate::commands::{CommandHandler, CommandTable};
use crate::hooks::{self, HookBus, HookHandler, SubscriptionId};
use crate::permission::{Permission, PermissionSet};
use crate::services::{
    AccountSummary, HostServices, HttpRequest, HttpResponse, TransactionRequest,
};
use crate::storage::StorageSandbox;

/// Read-only facts about the extension a context belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionIdentity {
    pub name: String,
    pub version: String,
    /// Directory reserved for the extension's storage namespace.
    pub data_dir: PathBuf,
}

/// Logging and user feedback. Needs no permission.
#[derive(Clone)]
pub struct ExtensionLogger {
    extension: String,
    services: HostServices,
}

impl ExtensionLogger {
    pub fn debug(&self, message: &str) {
        debug!(extension = %self.extension, "{}", message);
    }

    pub fn info(&self, message: &str) {
        info!(extension = %self.extension, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(extension = %self.extension, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(extension = %self.extension, "{}", message);
    }

    /// Show text to the user.
    pub fn output(&self, text: &str) {
        self.services.prompt.output(&self.extension, text);
    }

    /// Ask the user a yes/no question.
    pub async fn confirm(&self, question: &str) -> Result<bool> {
        self.services.prompt.confirm(&self.extension, question).await
    }
}

/// Storage bound to the owning extension's namespace.
#[derive(Clone)]
pub struct ExtensionStorage {
    namespace: String,
    grants: Arc<PermissionSet>,
    sandbox: Arc<StorageSandbox>,
}

impl ExtensionStorage {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `Ok(None)` if the key is absent.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.grants.require(&self.namespace, Permission::StorageRead)?;
        self.sandbox.get(&self.namespace, key)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.grants.require(&self.namespace, Permission::StorageRead)?;
        self.sandbox.keys(&self.namespace)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.grants.require(&self.namespace, Permission::StorageWrite)?;
        self.sandbox.set(&self.namespace, key, value)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.grants.require(&self.namespace, Permission::StorageWrite)?;
        self.sandbox.delete(&self.namespace, key)
    }

    pub fn clear(&self) -> Result<()> {
        self.grants.require(&self.namespace, Permission::StorageWrite)?;
        self.sandbox.clear(&self.namespace)
    }

    /// Atomic read-modify-write; needs both read and write.
    pub fn update<F>(&self, key: &str, f: F) -> Result<Option<Value>>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        self.grants.require(&self.namespace, Permission::StorageRead)?;
        self.grants.require(&self.namespace, Permission::StorageWrite)?;
        self.sandbox.update(&self.namespace, key, f)
    }
}

struct ContextInner {
    identity: ExtensionIdentity,
    grants: Arc<PermissionSet>,
    services: HostServices,
    commands: Arc<CommandTable>,
    hooks: Arc<HookBus>,
    logger: ExtensionLogger,
    storage: ExtensionStorage,
    revoked: AtomicBool,
}

/// The only channel through which an extension may affect host state.
#[derive(Clone)]
pub struct ExtensionContext {
    inner: Arc<ContextInner>,
}

/// Shared runtime pieces a context is built from.
pub struct ContextParts {
    pub services: HostServices,
    pub commands: Arc<CommandTable>,
    pub hooks: Arc<HookBus>,
    pub storage: Arc<StorageSandbox>,
}

impl ExtensionContext {
    /// Build a context for one extension from its granted permissions.
    pub fn new(identity: ExtensionIdentity, grants: PermissionSet, parts: &ContextParts) -> Self {
        let grants = Arc::new(grants);
        let logger = ExtensionLogger {
            extension: identity.name.clone(),
            services: parts.services.clone(),
        };
        let storage = ExtensionStorage {
            namespace: identity.name.clone(),
            grants: Arc::clone(&grants),
            sandbox: Arc::clone(&parts.storage),
        };
        Self {
            inner: Arc::new(ContextInner {
                identity,
                grants,
                services: parts.services.clone(),
                commands: Arc::clone(&parts.commands),
                hooks: Arc::clone(&parts.hooks),
                logger,
                storage,
                revoked: AtomicBool::new(false),
            }),
        }
    }

    pub fn identity(&self) -> &ExtensionIdentity {
        &self.inner.identity
    }

    pub fn name(&self) -> &str {
        &self.inner.identity.name
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.identity.data_dir
    }

    pub fn log(&self) -> &ExtensionLogger {
        &self.inner.logger
    }

    pub fn storage(&self) -> &ExtensionStorage {
        &self.inner.storage
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.inner.grants.contains(permission)
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.inner.grants
    }

    fn require(&self, permission: Permission) -> Result<()> {
        self.inner.grants.require(self.name(), permission)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(KeelError::PermissionDenied {
                extension: self.name().to_string(),
                reason: "context has been revoked".into(),
            });
        }
        Ok(())
    }

    /// Stop accepting registrations. Used when activation fails or the
    /// extension is disabled or unloaded.
    pub fn revoke(&self) {
        self.inner.revoked.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.revoked.load(Ordering::SeqCst)
    }

    // ── Chain ──────────────────────────────────────────────────

    pub async fn balance(&self, address: &str) -> Result<String> {
        self.require(Permission::ChainRead)?;
        self.inner.services.chain.balance(address).await
    }

    pub async fn chain_query(&self, method: &str, params: Value) -> Result<Value> {
        self.require(Permission::ChainRead)?;
        self.inner.services.chain.query(method, params).await
    }

    pub async fn submit_transaction(&self, tx: TransactionRequest) -> Result<String> {
        self.require(Permission::ChainWrite)?;
        info!(extension = %self.name(), to = %tx.to, value = %tx.value, "extension submitting transaction");
        self.inner.services.transactions.submit(tx).await
    }

    // ── Accounts & vault ───────────────────────────────────────

    pub async fn list_accounts(&self) -> Result<Vec<AccountSummary>> {
        self.require(Permission::AccountsRead)?;
        self.inner.services.accounts.list_accounts().await
    }

    pub async fn vault_has_key(&self, account: &str) -> Result<bool> {
        self.require(Permission::VaultRead)?;
        self.inner.services.vault.has_key(account).await
    }

    pub async fn vault_key_ids(&self) -> Result<Vec<String>> {
        self.require(Permission::VaultRead)?;
        self.inner.services.vault.key_ids().await
    }

    // ── Network ────────────────────────────────────────────────

    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.require(Permission::Network)?;
        self.inner.services.network.fetch(request).await
    }

    // ── Commands & hooks ───────────────────────────────────────

    pub fn register_command(
        &self,
        name: &str,
        description: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        self.require(Permission::Commands)?;
        self.inner
            .commands
            .register_if(self.name(), name, description, handler, || self.ensure_live())
    }

    pub fn register_hook(&self, event: &str, handler: Arc<dyn HookHandler>) -> Result<SubscriptionId> {
        self.require(Permission::Hooks)?;
        self.inner
            .hooks
            .subscribe_if(self.name(), event, handler, || self.ensure_live())
    }

    /// Remove one of this extension's own hook subscriptions.
    pub fn unregister_hook(&self, id: SubscriptionId) -> Result<bool> {
        self.require(Permission::Hooks)?;
        Ok(self.inner.hooks.unsubscribe_owned(self.name(), id))
    }

    /// Publish an event to other extensions. Host event names are reserved.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.require(Permission::Hooks)?;
        self.ensure_live()?;
        if hooks::is_reserved(event) {
            return Err(KeelError::PermissionDenied {
                extension: self.name().to_string(),
                reason: format!("event name '{event}' is reserved for the host"),
            });
        }
        self.inner.hooks.publish(event, payload, Some(self.name())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandInvocation, CommandOutput};
    use crate::hooks::HookEvent;
    use crate::storage::StorageLimits;
    use serde_json::json;

    fn parts(root: &Path) -> ContextParts {
        ContextParts {
            services: HostServices::default(),
            commands: Arc::new(CommandTable::new()),
            hooks: Arc::new(HookBus::new()),
            storage: Arc::new(StorageSandbox::new(root, StorageLimits::default())),
        }
    }

    fn context(root: &Path, parts: &ContextParts, grants: &[Permission]) -> ExtensionContext {
        ExtensionContext::new(
            ExtensionIdentity {
                name: "demo".into(),
                version: "1.0.0".into(),
                data_dir: root.join("demo").join("data"),
            },
            grants.iter().copied().collect(),
            parts,
        )
    }

    fn noop_command() -> Arc<dyn CommandHandler> {
        Arc::new(|_inv: CommandInvocation| async { Ok::<_, KeelError>(CommandOutput::text("ok")) })
    }

    fn noop_hook() -> Arc<dyn HookHandler> {
        Arc::new(|_e: HookEvent| async { Ok::<(), KeelError>(()) })
    }

    fn denied_permission(err: KeelError) -> String {
        match err {
            KeelError::PermissionDenied { reason, .. } => reason,
            other => panic!("expected PermissionDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ungranted_operations_fail_with_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(dir.path(), &p, &[]);

        assert!(denied_permission(ctx.balance("0x1").await.unwrap_err()).contains("chain:read"));
        let tx = TransactionRequest {
            from: "a".into(),
            to: "b".into(),
            value: "1".into(),
            data: None,
        };
        assert!(denied_permission(ctx.submit_transaction(tx).await.unwrap_err()).contains("chain:write"));
        assert!(denied_permission(ctx.list_accounts().await.unwrap_err()).contains("accounts:read"));
        assert!(denied_permission(ctx.vault_key_ids().await.unwrap_err()).contains("vault:read"));
        assert!(denied_permission(ctx.fetch(HttpRequest::default()).await.unwrap_err()).contains("network"));
        assert!(denied_permission(ctx.storage().get("k").unwrap_err()).contains("storage:read"));
        assert!(denied_permission(ctx.storage().set("k", &1).unwrap_err()).contains("storage:write"));
        assert!(denied_permission(ctx.register_command("x", "", noop_command()).unwrap_err()).contains("commands"));
        assert!(denied_permission(ctx.register_hook("e", noop_hook()).unwrap_err()).contains("hooks"));
    }

    #[tokio::test]
    async fn granted_operations_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(
            dir.path(),
            &p,
            &[Permission::ChainRead, Permission::StorageRead, Permission::StorageWrite],
        );

        // Reaches the collaborator, which reports it is not configured.
        assert!(matches!(ctx.balance("0x1").await, Err(KeelError::Service { .. })));

        ctx.storage().set("greeting", &json!({"text": "hi"})).unwrap();
        assert_eq!(ctx.storage().get("greeting").unwrap(), Some(json!({"text": "hi"})));
        assert!(dir.path().join("demo/data/greeting.json").exists());
        assert_eq!(ctx.storage().keys().unwrap(), vec!["greeting"]);
    }

    #[test]
    fn storage_read_only_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(dir.path(), &p, &[Permission::StorageRead]);
        assert_eq!(ctx.storage().get("k").unwrap(), None);
        assert!(ctx.storage().set("k", &1).is_err());
        assert!(ctx.storage().update("k", |_| Some(json!(1))).is_err());
    }

    #[test]
    fn commands_register_under_own_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(dir.path(), &p, &[Permission::Commands]);
        ctx.register_command("demo-echo", "Echo", noop_command()).unwrap();
        assert_eq!(p.commands.lookup("demo-echo").unwrap().0.owning_extension, "demo");
    }

    #[test]
    fn revoked_context_cannot_register() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(dir.path(), &p, &[Permission::Commands, Permission::Hooks]);
        ctx.revoke();
        assert!(ctx.is_revoked());
        assert!(ctx.register_command("late", "", noop_command()).is_err());
        assert!(ctx.register_hook("e", noop_hook()).is_err());
        assert!(p.commands.list().is_empty());
        assert_eq!(p.hooks.subscriber_count("e"), 0);
    }

    #[tokio::test]
    async fn emit_rejects_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(dir.path(), &p, &[Permission::Hooks]);
        let err = ctx.emit(hooks::COMMAND_BEFORE, json!({})).await.unwrap_err();
        assert!(denied_permission(err).contains("reserved"));
        ctx.emit("demo:ping", json!({})).await.unwrap();
    }

    #[test]
    fn identity_is_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let p = parts(dir.path());
        let ctx = context(dir.path(), &p, &[]);
        assert_eq!(ctx.identity().version, "1.0.0");
        assert!(ctx.data_dir().ends_with("demo/data"));
        ctx.log().info("logging needs no permission");
        ctx.log().output("neither does output");
    }
}
