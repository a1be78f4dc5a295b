// SPDX-License-Identifier: MIT OR Apache-2.0

//! Policy configuration.
//!
//! Policies are plain serde types loaded from YAML and frozen into a
//! [`PolicyRegistry`] at startup.
//!
//! # Environment Variables
//!
//! - `RESILIENCE_POLICY_FILE` - Path to the policy YAML used by
//!   [`PolicyFile::load_from_env`]
//!
//! # Example
//!
//! ```no_run
//! use resilience_engine::config::{PolicyFile, PolicyRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PolicyRegistry::from_file(PolicyFile::load_from_env()?)?;
//! for operation in registry.operations() {
//!     println!("protecting {operation}");
//! }
//! # Ok(())
//! # }
//! ```

mod policy;
mod registry;

pub use policy::{
    BulkheadConfig, CircuitBreakerConfig, PolicyConfig, PolicyFile, RetryConfig, TimeoutConfig,
    WindowKind, DEFAULT_PREDICATE, ENV_POLICY_FILE,
};
pub use registry::{PolicyRegistry, PolicyRegistryBuilder};
