//! Role-based access control.
//!
//! Flow Overview:
//! 1) At bootstrap the enforcer loads every stored policy through its adapter.
//! 2) Seed rules (built-in or from the policy file) missing from storage are added.
//! 3) Each request is decided as a pure lookup of (role, route pattern, verb).
//! 4) Administrative changes are persisted first and then applied in memory, so
//!    they take effect on the next request.
//!
//! Matching rules: the resource matches exactly, or by prefix when the stored
//! pattern ends in `*`; the action `*` matches any verb. Roles match exactly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    sync::{Arc, RwLock},
};
use thiserror::Error;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::store::StoreError;

/// Role assigned to requests without an authenticated subject.
pub const ANONYMOUS_ROLE: &str = "anonymous";

/// Seed applied when no policy file is configured.
pub const DEFAULT_POLICY: &str = include_str!("../../config/policy.csv");

const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("policy storage failed: {0}")]
    Storage(#[from] StoreError),
    #[error("policy set lock poisoned")]
    Poisoned,
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("invalid policy seed at line {line}: {reason}")]
    Seed { line: usize, reason: String },
}

/// A single allow rule.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub struct Policy {
    pub role: String,
    pub resource: String,
    pub action: String,
}

impl Policy {
    /// Build a normalised policy (trimmed fields, upper-case action).
    ///
    /// # Errors
    /// Returns `InvalidPolicy` for empty fields or fields containing commas.
    pub fn new(role: &str, resource: &str, action: &str) -> Result<Self, RbacError> {
        let role = role.trim();
        let resource = resource.trim();
        let action = action.trim();
        for (field, value) in [("role", role), ("resource", resource), ("action", action)] {
            if value.is_empty() {
                return Err(RbacError::InvalidPolicy(format!("{field} must not be empty")));
            }
            if value.contains(',') {
                return Err(RbacError::InvalidPolicy(format!("{field} must not contain ','")));
            }
        }
        Ok(Self {
            role: role.to_string(),
            resource: resource.to_string(),
            action: action.to_ascii_uppercase(),
        })
    }

    fn allows(&self, role: &str, resource: &str, action: &str) -> bool {
        if self.role != role {
            return false;
        }
        let resource_matches = match self.resource.strip_suffix(WILDCARD) {
            Some(prefix) => resource.starts_with(prefix),
            None => self.resource == resource,
        };
        resource_matches && (self.action == WILDCARD || self.action.eq_ignore_ascii_case(action))
    }
}

/// Persistence seam for the policy set.
#[async_trait]
pub trait PolicyAdapter: Send + Sync {
    async fn load_policies(&self) -> Result<Vec<Policy>, StoreError>;

    /// Returns `false` when the policy already existed.
    async fn save_policy(&self, policy: &Policy) -> Result<bool, StoreError>;

    /// Returns `false` when the policy did not exist.
    async fn remove_policy(&self, policy: &Policy) -> Result<bool, StoreError>;
}

pub struct Enforcer {
    policies: RwLock<BTreeSet<Policy>>,
    adapter: Arc<dyn PolicyAdapter>,
}

impl Enforcer {
    /// Create an enforcer holding every policy the adapter has stored.
    ///
    /// # Errors
    /// Returns an error if the adapter cannot load policies.
    pub async fn new(adapter: Arc<dyn PolicyAdapter>) -> Result<Self, RbacError> {
        let loaded: BTreeSet<Policy> = adapter.load_policies().await?.into_iter().collect();
        debug!(policies = loaded.len(), "Loaded RBAC policies");
        Ok(Self {
            policies: RwLock::new(loaded),
            adapter,
        })
    }

    /// Decide whether `role` may perform `action` on `resource`.
    ///
    /// # Errors
    /// Returns `Poisoned` if the policy set lock is poisoned; callers deny.
    pub fn enforce(&self, role: &str, resource: &str, action: &str) -> Result<bool, RbacError> {
        let policies = self.policies.read().map_err(|_| RbacError::Poisoned)?;
        Ok(policies
            .iter()
            .any(|policy| policy.allows(role, resource, action)))
    }

    /// Persist and activate a policy. Returns `false` if it was already present.
    ///
    /// # Errors
    /// Returns an error if persistence fails; the in-memory set is left untouched.
    pub async fn add_policy(&self, policy: Policy) -> Result<bool, RbacError> {
        let saved = self.adapter.save_policy(&policy).await?;
        let inserted = self
            .policies
            .write()
            .map_err(|_| RbacError::Poisoned)?
            .insert(policy);
        Ok(saved || inserted)
    }

    /// Remove a policy from storage and memory. Returns `false` if it was absent.
    ///
    /// # Errors
    /// Returns an error if persistence fails; the in-memory set is left untouched.
    pub async fn remove_policy(&self, policy: &Policy) -> Result<bool, RbacError> {
        let removed = self.adapter.remove_policy(policy).await?;
        let dropped = self
            .policies
            .write()
            .map_err(|_| RbacError::Poisoned)?
            .remove(policy);
        Ok(removed || dropped)
    }

    /// Snapshot of the active policy set, sorted.
    ///
    /// # Errors
    /// Returns `Poisoned` if the policy set lock is poisoned.
    pub fn policies(&self) -> Result<Vec<Policy>, RbacError> {
        let policies = self.policies.read().map_err(|_| RbacError::Poisoned)?;
        Ok(policies.iter().cloned().collect())
    }

    /// Add every seed rule that is not yet active. Returns the number added.
    ///
    /// # Errors
    /// Returns an error if persisting a rule fails.
    pub async fn seed(&self, seeds: Vec<Policy>) -> Result<usize, RbacError> {
        let mut added = 0;
        for policy in seeds {
            let present = self
                .policies
                .read()
                .map_err(|_| RbacError::Poisoned)?
                .contains(&policy);
            if !present && self.add_policy(policy).await? {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "Seeded RBAC policies");
        }
        Ok(added)
    }
}

/// Parse `p, role, resource, action` lines. Blank lines and `#` comments are skipped.
///
/// # Errors
/// Returns `Seed` with the 1-based line number of the first bad line.
pub fn parse_policies(input: &str) -> Result<Vec<Policy>, RbacError> {
    let mut policies = Vec::new();
    for (index, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let seed_error = |reason: String| RbacError::Seed {
            line: index + 1,
            reason,
        };
        match fields.as_slice() {
            ["p", role, resource, action] => {
                let policy = Policy::new(role, resource, action)
                    .map_err(|err| seed_error(err.to_string()))?;
                policies.push(policy);
            }
            [kind, ..] if *kind != "p" => {
                return Err(seed_error(format!("unsupported rule type '{kind}'")));
            }
            _ => return Err(seed_error("expected 'p, role, resource, action'".to_string())),
        }
    }
    Ok(policies)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policy(role: &str, resource: &str, action: &str) -> Policy {
        Policy::new(role, resource, action).unwrap()
    }

    async fn enforcer(seed: &[Policy]) -> Enforcer {
        let enforcer = Enforcer::new(Arc::new(MemoryStore::new())).await.unwrap();
        enforcer.seed(seed.to_vec()).await.unwrap();
        enforcer
    }

    #[tokio::test]
    async fn enforce_matches_exact_pattern_and_verb() {
        let enforcer = enforcer(&[policy("admin", "/posts/:id", "delete")]).await;
        assert!(enforcer.enforce("admin", "/posts/:id", "DELETE").unwrap());
        assert!(!enforcer.enforce("admin", "/posts/:id", "PUT").unwrap());
        assert!(!enforcer.enforce("user", "/posts/:id", "DELETE").unwrap());
        assert!(!enforcer.enforce("admin", "/posts/42", "DELETE").unwrap());
    }

    #[tokio::test]
    async fn enforce_supports_prefix_and_any_action() {
        let enforcer = enforcer(&[policy("admin", "/rbac/*", "*")]).await;
        assert!(enforcer.enforce("admin", "/rbac/policies", "POST").unwrap());
        assert!(enforcer.enforce("admin", "/rbac/policies", "GET").unwrap());
        assert!(!enforcer.enforce("admin", "/posts", "GET").unwrap());
    }

    #[tokio::test]
    async fn runtime_changes_apply_immediately_and_persist() {
        let store = Arc::new(MemoryStore::new());
        let enforcer = Enforcer::new(store.clone()).await.unwrap();
        let rule = policy("user", "/posts", "POST");

        assert!(!enforcer.enforce("user", "/posts", "POST").unwrap());
        assert!(enforcer.add_policy(rule.clone()).await.unwrap());
        assert!(enforcer.enforce("user", "/posts", "POST").unwrap());
        assert!(!enforcer.add_policy(rule.clone()).await.unwrap());

        let reloaded = Enforcer::new(store.clone()).await.unwrap();
        assert_eq!(reloaded.policies().unwrap(), vec![rule.clone()]);

        assert!(enforcer.remove_policy(&rule).await.unwrap());
        assert!(!enforcer.enforce("user", "/posts", "POST").unwrap());
        assert!(!enforcer.remove_policy(&rule).await.unwrap());
        assert!(store.load_policies().await.unwrap().is_empty());
    }

    struct FailingAdapter {
        fail: AtomicBool,
    }

    #[async_trait]
    impl PolicyAdapter for FailingAdapter {
        async fn load_policies(&self) -> Result<Vec<Policy>, StoreError> {
            Ok(Vec::new())
        }

        async fn save_policy(&self, _policy: &Policy) -> Result<bool, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable)
            } else {
                Ok(true)
            }
        }

        async fn remove_policy(&self, _policy: &Policy) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable)
        }
    }

    #[tokio::test]
    async fn failed_persistence_leaves_memory_unchanged() {
        let adapter = Arc::new(FailingAdapter {
            fail: AtomicBool::new(true),
        });
        let enforcer = Enforcer::new(adapter.clone()).await.unwrap();
        let rule = policy("user", "/posts", "POST");
        assert!(enforcer.add_policy(rule.clone()).await.is_err());
        assert!(!enforcer.enforce("user", "/posts", "POST").unwrap());

        adapter.fail.store(false, Ordering::SeqCst);
        assert!(enforcer.add_policy(rule.clone()).await.unwrap());
        assert!(enforcer.remove_policy(&rule).await.is_err());
        assert!(enforcer.enforce("user", "/posts", "POST").unwrap());
    }

    #[test]
    fn parse_policies_reads_default_seed() {
        let policies = parse_policies(DEFAULT_POLICY).unwrap();
        assert!(policies.contains(&policy(ANONYMOUS_ROLE, "/posts", "GET")));
        assert!(policies.contains(&policy("admin", "/rbac/policies", "POST")));
        assert!(!policies.iter().any(|p| p.role == "user" && p.action == "POST"));
    }

    #[test]
    fn parse_policies_reports_line_numbers() {
        let err = parse_policies("# comment\n\np, admin, /posts\n").unwrap_err();
        assert!(matches!(err, RbacError::Seed { line: 3, .. }));

        let err = parse_policies("g, alice, admin\n").unwrap_err();
        assert!(matches!(err, RbacError::Seed { line: 1, .. }));
    }

    #[test]
    fn policy_new_rejects_empty_fields() {
        assert!(Policy::new("admin", " ", "GET").is_err());
        assert!(Policy::new("admin", "/a,b", "GET").is_err());
        assert_eq!(policy(" admin ", "/posts", "get").action, "GET");
    }
}
