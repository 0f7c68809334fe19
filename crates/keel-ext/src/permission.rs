//! Permission vocabulary and the static tier table.
//!
//! Tier membership is data, not branching: [`PERMISSION_TABLE`] is the whole
//! policy, and [`classify`] only partitions a requested set against it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use keel_core::{KeelError, Result};

/// A capability token an extension may request in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    ChainRead,
    ChainWrite,
    AccountsRead,
    VaultRead,
    Network,
    StorageRead,
    StorageWrite,
    Commands,
    Hooks,
    SystemExec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Auto-granted.
    Safe,
    /// Granted, but logged with a warning.
    Elevated,
    /// Always denied.
    Dangerous,
}

pub struct PermissionSpec {
    pub permission: Permission,
    pub token: &'static str,
    pub tier: Tier,
    pub risk: &'static str,
}

pub const PERMISSION_TABLE: &[PermissionSpec] = &[
    // Keep in the same order as `Permission`.
    PermissionSpec {
        permission: Permission::ChainRead,
        token: "chain:read",
        tier: Tier::Safe,
        risk: "read balances, blocks and contract state",
    },
    PermissionSpec {
        permission: Permission::ChainWrite,
        token: "chain:write",
        tier: Tier::Elevated,
        risk: "submit transactions that move funds or change contract state",
    },
    PermissionSpec {
        permission: Permission::AccountsRead,
        token: "accounts:read",
        tier: Tier::Safe,
        risk: "list the addresses of configured accounts",
    },
    PermissionSpec {
        permission: Permission::VaultRead,
        token: "vault:read",
        tier: Tier::Elevated,
        risk: "query which keys exist in the credential vault",
    },
    PermissionSpec {
        permission: Permission::Network,
        token: "network",
        tier: Tier::Elevated,
        risk: "make outbound HTTP requests, which can exfiltrate data",
    },
    PermissionSpec {
        permission: Permission::StorageRead,
        token: "storage:read",
        tier: Tier::Safe,
        risk: "read values from the extension's own storage namespace",
    },
    PermissionSpec {
        permission: Permission::StorageWrite,
        token: "storage:write",
        tier: Tier::Safe,
        risk: "write values to the extension's own storage namespace",
    },
    PermissionSpec {
        permission: Permission::Commands,
        token: "commands",
        tier: Tier::Safe,
        risk: "add commands to the host command surface",
    },
    PermissionSpec {
        permission: Permission::Hooks,
        token: "hooks",
        tier: Tier::Safe,
        risk: "subscribe to and emit host and extension events",
    },
    PermissionSpec {
        permission: Permission::SystemExec,
        token: "system:exec",
        tier: Tier::Dangerous,
        risk: "execute arbitrary programs with the user's privileges",
    },
];

impl Permission {
    fn spec(&self) -> &'static PermissionSpec {
        // Rows are in declaration order of the enum.
        &PERMISSION_TABLE[*self as usize]
    }

    pub fn from_token(token: &str) -> Option<Self> {
        PERMISSION_TABLE
            .iter()
            .find(|s| s.token == token)
            .map(|s| s.permission)
    }

    pub fn token(&self) -> &'static str {
        self.spec().token
    }

    pub fn tier(&self) -> Tier {
        self.spec().tier
    }

    pub fn risk(&self) -> &'static str {
        self.spec().risk
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Overall outcome of classifying a requested permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Granted,
    GrantedWithWarning,
    Denied,
}

/// The requested permissions, partitioned by tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub disposition: Disposition,
    pub safe: Vec<Permission>,
    pub elevated: Vec<Permission>,
    pub dangerous: Vec<Permission>,
    /// Tokens not in the vocabulary. Treated as dangerous.
    pub unknown: Vec<String>,
}

impl Classification {
    /// The permissions actually granted. Empty when denied.
    pub fn granted(&self) -> PermissionSet {
        if self.disposition == Disposition::Denied {
            return PermissionSet::default();
        }
        self.safe.iter().chain(self.elevated.iter()).copied().collect()
    }

    /// User-facing explanation of a denial, one line per offending token.
    pub fn denial_message(&self) -> Option<String> {
        if self.disposition != Disposition::Denied {
            return None;
        }
        let mut lines: Vec<String> = self
            .dangerous
            .iter()
            .map(|p| format!("'{}' is dangerous: {}", p.token(), p.risk()))
            .collect();
        lines.extend(
            self.unknown
                .iter()
                .map(|t| format!("'{t}' is not a recognized permission")),
        );
        Some(lines.join("; "))
    }

    /// Convert a denial into the error reported to the caller.
    pub fn into_result(self, extension: &str) -> Result<Self> {
        match self.denial_message() {
            Some(reason) => Err(KeelError::PermissionDenied {
                extension: extension.to_string(),
                reason,
            }),
            None => Ok(self),
        }
    }
}

/// Partition requested permission tokens using the static tier table.
pub fn classify<S: AsRef<str>>(requested: &[S]) -> Classification {
    let mut safe = BTreeSet::new();
    let mut elevated = BTreeSet::new();
    let mut dangerous = BTreeSet::new();
    let mut unknown = BTreeSet::new();

    for token in requested {
        let token = token.as_ref().trim();
        match Permission::from_token(token) {
            Some(p) => match p.tier() {
                Tier::Safe => safe.insert(p),
                Tier::Elevated => elevated.insert(p),
                Tier::Dangerous => dangerous.insert(p),
            },
            None => unknown.insert(token.to_string()),
        };
    }

    let disposition = if !dangerous.is_empty() || !unknown.is_empty() {
        Disposition::Denied
    } else if !elevated.is_empty() {
        Disposition::GrantedWithWarning
    } else {
        Disposition::Granted
    };

    Classification {
        disposition,
        safe: safe.into_iter().collect(),
        elevated: elevated.into_iter().collect(),
        dangerous: dangerous.into_iter().collect(),
        unknown: unknown.into_iter().collect(),
    }
}

/// The set of permissions granted to one extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    /// Fail with `PermissionDenied` unless `permission` is granted.
    pub fn require(&self, extension: &str, permission: Permission) -> Result<()> {
        if self.contains(permission) {
            Ok(())
        } else {
            Err(KeelError::PermissionDenied {
                extension: extension.to_string(),
                reason: format!("missing permission '{}'", permission.token()),
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    pub fn tokens(&self) -> Vec<&'static str> {
        self.0.iter().map(|p| p.token()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
