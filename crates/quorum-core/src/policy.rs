//! Access-control policy documents for the reference engine.
//!
//! A policy document is JSON: `{ "rules": [{ "path", "capabilities" }] }`.
//! The name comes from the request path, not the document. Policies are
//! stored through the barrier under `sys/policies/`, so writing one needs an
//! unsealed node.
//!
//! `root` is built in and cannot be overwritten.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::PolicyError;

const POLICY_PREFIX: &str = "sys/policies/";
const ROOT_POLICY: &str = "root";

/// A named set of access rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

/// One rule: a path pattern and what may be done there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Path pattern (`*` one segment, `**` recursive).
    pub path: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    List,
    Create,
    Update,
    Delete,
    Sudo,
    /// Overrides every other capability on a matching path.
    Deny,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    rules: Vec<PolicyRule>,
}

impl Policy {
    /// Parse and validate a policy document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] if the name is unusable, the JSON is
    /// malformed, or a rule is empty.
    pub fn parse(name: &str, document: &str) -> Result<Self, PolicyError> {
        validate_name(name)?;
        let doc: PolicyDocument =
            serde_json::from_str(document).map_err(|e| PolicyError::Invalid {
                reason: format!("malformed policy document: {e}"),
            })?;

        if doc.rules.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must have at least one rule".to_owned(),
            });
        }
        for rule in &doc.rules {
            if rule.path.trim().is_empty() {
                return Err(PolicyError::Invalid {
                    reason: "rule path must not be empty".to_owned(),
                });
            }
            if rule.capabilities.is_empty() {
                return Err(PolicyError::Invalid {
                    reason: format!("rule for '{}' grants no capabilities", rule.path),
                });
            }
        }

        Ok(Self {
            name: name.to_owned(),
            rules: doc.rules,
        })
    }
}

/// Policy storage of one node.
pub struct PolicyStore {
    barrier: Arc<Barrier>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Write or replace a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] if the name is `root`.
    /// - [`PolicyError::Barrier`] if the node is sealed or storage fails.
    pub async fn put(&self, policy: &Policy) -> Result<(), PolicyError> {
        if policy.name == ROOT_POLICY {
            return Err(PolicyError::BuiltIn {
                name: policy.name.clone(),
            });
        }

        let bytes = serde_json::to_vec(policy).map_err(|e| PolicyError::Invalid {
            reason: format!("serialization failed: {e}"),
        })?;
        let key = format!("{POLICY_PREFIX}{}", policy.name);
        self.barrier.put(&key, &bytes).await?;

        info!(name = %policy.name, rules = policy.rules.len(), "policy written");
        Ok(())
    }

    /// Read a policy by name.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if it doesn't exist.
    /// - [`PolicyError::Barrier`] if the node is sealed or storage fails.
    pub async fn get(&self, name: &str) -> Result<Policy, PolicyError> {
        if name == ROOT_POLICY {
            return Ok(root_policy());
        }

        let key = format!("{POLICY_PREFIX}{name}");
        let data = self
            .barrier
            .get(&key)
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                name: name.to_owned(),
            })?;

        serde_json::from_slice(&data).map_err(|e| PolicyError::Invalid {
            reason: format!("deserialization failed: {e}"),
        })
    }

    /// All policy names, `root` included, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if the node is sealed or storage fails.
    pub async fn list(&self) -> Result<Vec<String>, PolicyError> {
        let keys = self.barrier.list(POLICY_PREFIX).await?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(POLICY_PREFIX).map(String::from))
            .collect();
        if !names.iter().any(|n| n == ROOT_POLICY) {
            names.push(ROOT_POLICY.to_owned());
        }
        names.sort();
        Ok(names)
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

/// The built-in `root` policy: everything on every path.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        name: ROOT_POLICY.to_owned(),
        rules: vec![PolicyRule {
            path: "**".to_owned(),
            capabilities: vec![
                Capability::Read,
                Capability::List,
                Capability::Create,
                Capability::Update,
                Capability::Delete,
                Capability::Sudo,
            ],
        }],
    }
}

fn validate_name(name: &str) -> Result<(), PolicyError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(PolicyError::Invalid {
            reason: format!("invalid policy name '{name}'"),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quorum_storage::MemoryBackend;

    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::error::BarrierError;

    const OPS_DOC: &str = r#"{"rules":[{"path":"secret/ops/*","capabilities":["read","list"]}]}"#;

    async fn unsealed_store() -> PolicyStore {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        barrier.unseal(EncryptionKey::generate()).await;
        PolicyStore::new(barrier)
    }

    #[test]
    fn parse_valid_document() {
        let policy = Policy::parse("ops", OPS_DOC).unwrap();
        assert_eq!(policy.name, "ops");
        assert_eq!(
            policy.rules[0].capabilities,
            vec![Capability::Read, Capability::List]
        );
    }

    #[test]
    fn parse_rejects_bad_documents() {
        assert!(Policy::parse("ops", "not json").is_err());
        assert!(Policy::parse("ops", r#"{"rules":[]}"#).is_err());
        assert!(Policy::parse("ops", r#"{"rules":[{"path":"a","capabilities":[]}]}"#).is_err());
        assert!(
            Policy::parse("ops", r#"{"rules":[{"path":"a","capabilities":["fly"]}]}"#).is_err()
        );
        assert!(Policy::parse("../etc", OPS_DOC).is_err());
        assert!(Policy::parse("", OPS_DOC).is_err());
    }

    #[tokio::test]
    async fn put_get_list() {
        let store = unsealed_store().await;
        let policy = Policy::parse("ops", OPS_DOC).unwrap();
        store.put(&policy).await.unwrap();

        assert_eq!(store.get("ops").await.unwrap(), policy);
        assert_eq!(store.list().await.unwrap(), vec!["ops", "root"]);
    }

    #[tokio::test]
    async fn root_is_immutable() {
        let store = unsealed_store().await;
        let policy = Policy::parse("root", OPS_DOC).unwrap();
        let err = store.put(&policy).await.unwrap_err();
        assert!(matches!(err, PolicyError::BuiltIn { .. }));
        assert_eq!(store.get("root").await.unwrap(), root_policy());
    }

    #[tokio::test]
    async fn missing_policy_is_not_found() {
        let store = unsealed_store().await;
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, PolicyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn sealed_store_rejects_writes() {
        let store = PolicyStore::new(Arc::new(Barrier::new(Arc::new(MemoryBackend::new()))));
        let policy = Policy::parse("ops", OPS_DOC).unwrap();
        let err = store.put(&policy).await.unwrap_err();
        assert!(matches!(err, PolicyError::Barrier(BarrierError::Sealed)));
    }
}
