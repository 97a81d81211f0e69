#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **silo-acl** – Hierarchical path permissions for the Silo host.
//!
//! The engine decides whether a subject may perform a requested permission
//! on a hierarchical resource path. Entries are durable; evaluation walks
//! the path's prefixes from the root down, accumulating subject-specific
//! and wildcard grants, and a deny anywhere on the walk dominates every
//! allow.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use silo_types::{Failure, PrincipalId};
use silo_wal::{DurableState, WalResult};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Subject wildcard matching every principal.
pub const WILDCARD_SUBJECT: &str = "*";

bitflags! {
    /// Permission bit-set evaluated by the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Permission: u8 {
        /// Read resource contents.
        const READ = 1 << 0;
        /// Create or modify resource contents.
        const WRITE = 1 << 1;
        /// Remove the resource.
        const DELETE = 1 << 2;
        /// Manage permissions on the resource.
        const ADMIN = 1 << 3;
        /// Everything above.
        const FULL_CONTROL = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::DELETE.bits()
            | Self::ADMIN.bits();
    }
}

/// Allow and deny sets recorded for one (path, subject) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// Permissions granted at this path.
    pub allow: Permission,
    /// Permissions denied at this path; dominates any allow below or here.
    pub deny: Permission,
}

impl Default for Permission {
    fn default() -> Self {
        Permission::empty()
    }
}

/// The outcome of an access evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// Every requested bit was granted and none was denied.
    Allow,
    /// At least one requested bit was denied or never granted.
    Deny,
}

/// Errors raised by the engine's durable layer.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    /// The durable entry store failed.
    #[error("acl storage error: {0}")]
    Storage(#[from] silo_wal::WalError),
}

/// Subject → entry map stored per normalized resource path.
type PathEntries = HashMap<String, AclEntry>;

/// Hierarchical permission engine over a durable entry store.
#[derive(Debug)]
pub struct AclEngine {
    entries: DurableState<PathEntries>,
}

impl AclEngine {
    /// Open the engine's durable entry store under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, AclError> {
        Ok(Self {
            entries: DurableState::open(dir.as_ref(), "acl").await?,
        })
    }

    /// Grant `permission` to `subject` at `path`.
    pub async fn allow(
        &self,
        path: &str,
        subject: &str,
        permission: Permission,
    ) -> Result<(), AclError> {
        self.update(path, subject, |entry| entry.allow |= permission)
            .await
    }

    /// Deny `permission` to `subject` at `path` and every descendant.
    pub async fn deny(
        &self,
        path: &str,
        subject: &str,
        permission: Permission,
    ) -> Result<(), AclError> {
        self.update(path, subject, |entry| entry.deny |= permission)
            .await
    }

    /// Remove every entry for `subject` at `path`.
    pub async fn revoke(&self, path: &str, subject: &str) -> Result<(), AclError> {
        let path = normalize_path(path);
        let mut per_path = self.entries.try_get(&path).unwrap_or_default();
        if per_path.remove(subject).is_some() {
            if per_path.is_empty() {
                self.entries.remove(&path).await?;
            } else {
                self.entries.set(path, per_path).await?;
            }
        }
        Ok(())
    }

    /// Decide whether `subject` may perform `requested` on `path`.
    ///
    /// The walk accumulates allow and deny sets from the root prefix down
    /// to the full path, merging subject-specific and wildcard entries at
    /// each step. A deny intersecting the request wins outright; otherwise
    /// every requested bit must be covered by the accumulated allows.
    pub fn has_access(&self, path: &str, subject: &str, requested: Permission) -> bool {
        self.evaluate(path, subject, requested) == AccessDecision::Allow
    }

    /// Like [`has_access`](Self::has_access) but returns the decision enum.
    pub fn evaluate(&self, path: &str, subject: &str, requested: Permission) -> AccessDecision {
        if requested.is_empty() {
            return AccessDecision::Allow;
        }

        let snapshot = self.entries.reader_snapshot();
        let normalized = normalize_path(path);

        let mut effective_allow = Permission::empty();
        let mut effective_deny = Permission::empty();
        for prefix in prefixes(&normalized) {
            if let Some(per_path) = snapshot.get(&prefix) {
                for key in [subject, WILDCARD_SUBJECT] {
                    if let Some(entry) = per_path.get(key) {
                        effective_allow |= entry.allow;
                        effective_deny |= entry.deny;
                    }
                }
            }
        }

        if effective_deny.intersects(requested) {
            debug!(path = %normalized, subject, ?requested, "access denied by deny set");
            return AccessDecision::Deny;
        }
        if effective_allow.contains(requested) {
            AccessDecision::Allow
        } else {
            debug!(path = %normalized, subject, ?requested, "access denied, grant incomplete");
            AccessDecision::Deny
        }
    }

    /// Evaluate and convert a denial into the host's security failure.
    pub fn check_access(
        &self,
        path: &str,
        subject: &PrincipalId,
        requested: Permission,
    ) -> Result<(), Failure> {
        match self.evaluate(path, &subject.0, requested) {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny => Err(Failure::security(
                "Unauthorized",
                format!(
                    "subject '{subject}' lacks {requested:?} on '{}'",
                    normalize_path(path)
                ),
            )),
        }
    }

    /// Persist a snapshot of the entry store.
    pub async fn snapshot(&self) -> WalResult<()> {
        self.entries.snapshot().await
    }

    async fn update(
        &self,
        path: &str,
        subject: &str,
        f: impl FnOnce(&mut AclEntry),
    ) -> Result<(), AclError> {
        let path = normalize_path(path);
        let mut per_path = self.entries.try_get(&path).unwrap_or_default();
        f(per_path.entry(subject.to_string()).or_default());
        self.entries.set(path, per_path).await?;
        Ok(())
    }
}

/// Collapse repeated separators and trim leading/trailing slashes.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Prefixes of a normalized path from the root (`""`) to the full path.
fn prefixes(normalized: &str) -> Vec<String> {
    let mut out = vec![String::new()];
    if normalized.is_empty() {
        return out;
    }
    let mut current = String::new();
    for segment in normalized.split('/') {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn engine() -> (tempfile::TempDir, AclEngine) {
        let dir = tempdir().unwrap();
        let engine = AclEngine::open(dir.path()).await.unwrap();
        (dir, engine)
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("/a//b/c/"), "a/b/c");
        assert_eq!(normalize_path("a/b"), "a/b");
        assert_eq!(normalize_path("///"), "");
    }

    #[tokio::test]
    async fn ancestor_deny_dominates_descendant_allow() {
        let (_dir, engine) = engine().await;
        engine
            .allow("a/b", "u", Permission::READ | Permission::WRITE)
            .await
            .unwrap();
        engine.deny("a", "u", Permission::WRITE).await.unwrap();

        assert!(engine.has_access("a/b/c", "u", Permission::READ));
        assert!(!engine.has_access("a/b/c", "u", Permission::WRITE));
    }

    #[tokio::test]
    async fn grants_accumulate_down_the_walk() {
        let (_dir, engine) = engine().await;
        engine.allow("data", "u", Permission::READ).await.unwrap();
        engine
            .allow("data/reports", "u", Permission::WRITE)
            .await
            .unwrap();

        assert!(engine.has_access(
            "data/reports/q3",
            "u",
            Permission::READ | Permission::WRITE
        ));
        assert!(!engine.has_access("data", "u", Permission::WRITE));
    }

    #[tokio::test]
    async fn wildcard_entries_apply_to_every_subject() {
        let (_dir, engine) = engine().await;
        engine
            .allow("public", WILDCARD_SUBJECT, Permission::READ)
            .await
            .unwrap();
        engine
            .deny("public/internal", WILDCARD_SUBJECT, Permission::READ)
            .await
            .unwrap();

        assert!(engine.has_access("public/docs", "anyone", Permission::READ));
        assert!(!engine.has_access("public/internal/x", "anyone", Permission::READ));
    }

    #[tokio::test]
    async fn unknown_subject_is_denied() {
        let (_dir, engine) = engine().await;
        engine.allow("a", "u", Permission::FULL_CONTROL).await.unwrap();
        assert!(!engine.has_access("a", "v", Permission::READ));
    }

    #[tokio::test]
    async fn full_control_covers_every_bit() {
        let (_dir, engine) = engine().await;
        engine.allow("a", "u", Permission::FULL_CONTROL).await.unwrap();
        for perm in [
            Permission::READ,
            Permission::WRITE,
            Permission::DELETE,
            Permission::ADMIN,
        ] {
            assert!(engine.has_access("a/b", "u", perm));
        }
    }

    #[tokio::test]
    async fn check_access_reports_security_failure() {
        let (_dir, engine) = engine().await;
        let err = engine
            .check_access("vault/x", &PrincipalId::from("mallory"), Permission::DELETE)
            .unwrap_err();
        assert_eq!(err.category, silo_types::FailureCategory::Security);
        assert_eq!(err.error_code, "Unauthorized");
        assert!(err.title.contains("mallory"));
        assert!(err.title.contains("vault/x"));
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = AclEngine::open(dir.path()).await.unwrap();
            engine.allow("a/b", "u", Permission::READ).await.unwrap();
        }
        let engine = AclEngine::open(dir.path()).await.unwrap();
        assert!(engine.has_access("a/b", "u", Permission::READ));
    }

    #[tokio::test]
    async fn revoke_removes_subject_entries() {
        let (_dir, engine) = engine().await;
        engine.allow("a", "u", Permission::READ).await.unwrap();
        engine.revoke("a", "u").await.unwrap();
        assert!(!engine.has_access("a", "u", Permission::READ));
    }

    // Deny monotonicity: adding an ancestor deny can flip Allow to Deny but
    // never the reverse.
    #[tokio::test]
    async fn adding_a_deny_never_widens_access() {
        use proptest::prelude::*;
        use proptest::strategy::ValueTree;
        use proptest::test_runner::TestRunner;

        let (_dir, engine) = engine().await;
        engine
            .allow("r/s/t", "u", Permission::FULL_CONTROL)
            .await
            .unwrap();

        let mut runner = TestRunner::default();
        let perm_strategy = (1u8..16).prop_map(Permission::from_bits_truncate);

        for _ in 0..64 {
            let perm = perm_strategy.new_tree(&mut runner).unwrap().current();
            let before = engine.has_access("r/s/t", "u", perm);
            engine.deny("r", "u", perm).await.unwrap();
            let after = engine.has_access("r/s/t", "u", perm);
            assert!(before || !after, "deny must not grant access");
            assert!(!after, "denied permission must not evaluate to allow");
            engine.revoke("r", "u").await.unwrap();
        }
    }
}
