// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named, immutable policy table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::config::policy::{PolicyConfig, PolicyFile, DEFAULT_PREDICATE};
use crate::error::{ResilienceError, Result};
use crate::runtime::{AlwaysRetry, DefaultRetryPredicate, NeverRetry, RetryPredicate};

/// Policies keyed by operation name, plus the retry predicates they refer to.
///
/// Read-only once built; every policy has been validated and every predicate
/// reference resolved.
///
/// # Example
///
/// ```
/// use resilience_engine::config::{PolicyConfig, PolicyRegistry, RetryConfig};
///
/// let registry = PolicyRegistry::builder()
///     .with_policy(PolicyConfig::new("orders-db"))
///     .with_policy(
///         PolicyConfig::new("geo-lookup").with_retry(RetryConfig::new().with_retryable("never")),
///     )
///     .build()
///     .expect("valid policies");
///
/// assert_eq!(registry.operations(), vec!["geo-lookup", "orders-db"]);
/// assert!(registry.get("payments").is_err());
/// ```
#[derive(Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Arc<PolicyConfig>>,
    predicates: HashMap<String, Arc<dyn RetryPredicate>>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut predicates: Vec<_> = self.predicates.keys().collect();
        predicates.sort();
        f.debug_struct("PolicyRegistry")
            .field("operations", &self.operations())
            .field("predicates", &predicates)
            .finish()
    }
}

impl PolicyRegistry {
    /// Start building a registry with the built-in predicates.
    #[must_use]
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::new()
    }

    /// Build from a parsed policy document.
    ///
    /// # Errors
    ///
    /// Returns an error if any policy is invalid.
    pub fn from_file(file: PolicyFile) -> Result<Self> {
        Self::builder().with_policies(file.policies).build()
    }

    /// Parse and build from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or any policy is invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_file(PolicyFile::from_yaml(yaml)?)
    }

    /// Load and build from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or any policy is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(PolicyFile::load_from_path(path)?)
    }

    /// Look up the policy for `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] if no policy is registered.
    pub fn get(&self, operation: &str) -> Result<&PolicyConfig> {
        self.policies
            .get(operation)
            .map(AsRef::as_ref)
            .ok_or_else(|| ResilienceError::UnknownOperation(operation.to_string()))
    }

    /// Shared handle to the policy for `operation`.
    pub fn policy(&self, operation: &str) -> Option<Arc<PolicyConfig>> {
        self.policies.get(operation).cloned()
    }

    /// Returns `true` if `operation` has a policy.
    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.policies.contains_key(operation)
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        self.policies.keys().map(String::as_str).collect()
    }

    /// The predicate registered under `name`.
    pub fn predicate(&self, name: &str) -> Option<Arc<dyn RetryPredicate>> {
        self.predicates.get(name).cloned()
    }

    /// Number of registered policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns `true` if no policies are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Policies in operation-name order.
    pub fn iter(&self) -> impl Iterator<Item = &PolicyConfig> {
        self.policies.values().map(AsRef::as_ref)
    }

    /// The policies as a YAML document.
    #[must_use]
    pub fn to_file(&self) -> PolicyFile {
        PolicyFile {
            policies: self.iter().cloned().collect(),
        }
    }
}

/// Builder for [`PolicyRegistry`].
pub struct PolicyRegistryBuilder {
    policies: Vec<PolicyConfig>,
    predicates: HashMap<String, Arc<dyn RetryPredicate>>,
}

impl fmt::Debug for PolicyRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistryBuilder")
            .field("policies", &self.policies.len())
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl Default for PolicyRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistryBuilder {
    /// A builder with the `default`, `always` and `never` predicates.
    #[must_use]
    pub fn new() -> Self {
        let mut predicates: HashMap<String, Arc<dyn RetryPredicate>> = HashMap::new();
        predicates.insert(DEFAULT_PREDICATE.to_string(), Arc::new(DefaultRetryPredicate));
        predicates.insert("always".to_string(), Arc::new(AlwaysRetry));
        predicates.insert("never".to_string(), Arc::new(NeverRetry));
        Self {
            policies: Vec::new(),
            predicates,
        }
    }

    /// Add a policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policies.push(policy);
        self
    }

    /// Add several policies.
    #[must_use]
    pub fn with_policies(mut self, policies: impl IntoIterator<Item = PolicyConfig>) -> Self {
        self.policies.extend(policies);
        self
    }

    /// Register a retry predicate under `name`, replacing any existing one.
    #[must_use]
    pub fn with_predicate(
        mut self,
        name: impl Into<String>,
        predicate: Arc<dyn RetryPredicate>,
    ) -> Self {
        self.predicates.insert(name.into(), predicate);
        self
    }

    /// Validate every policy and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::InvalidPolicy`] for out-of-range values or an
    /// unknown predicate name, and [`ResilienceError::Config`] for duplicate
    /// operation names.
    pub fn build(self) -> Result<PolicyRegistry> {
        let mut policies = BTreeMap::new();

        for policy in self.policies {
            policy.validate()?;

            if !self.predicates.contains_key(&policy.retry.retryable) {
                return Err(ResilienceError::InvalidPolicy {
                    operation: policy.operation.clone(),
                    reason: format!("unknown retry predicate '{}'", policy.retry.retryable),
                });
            }

            if policies.contains_key(&policy.operation) {
                return Err(ResilienceError::Config(format!(
                    "Duplicate policy for operation '{}'",
                    policy.operation
                )));
            }

            debug!(
                target: "resilience_engine::config",
                operation = %policy.operation,
                "policy registered"
            );
            policies.insert(policy.operation.clone(), Arc::new(policy));
        }

        Ok(PolicyRegistry {
            policies,
            predicates: self.predicates,
        })
    }
}
