//! Versioned function registry.
//!
//! Resolution picks the highest registered version satisfying the caller's
//! constraint; without a constraint, the highest stable version wins.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use forrst_core::VersionConstraint;
use parking_lot::RwLock;
use semver::Version;
use tracing::debug;

use super::error::DispatchError;
use super::function::{FunctionDescriptor, Implementation, RegisteredFunction};

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("function {urn}@{version} is already registered")]
    Duplicate { urn: String, version: Version },
}

// ---------------------------------------------------------------------------
// FunctionRegistry
// ---------------------------------------------------------------------------

/// Callable functions keyed by URN, each URN holding one or more versions.
///
/// Per-URN entries keep registration order so that versions of equal
/// precedence resolve to the one registered first. Safe for concurrent
/// registration and lookup.
pub struct FunctionRegistry {
    /// URN -> versions in registration order.
    by_urn: DashMap<String, Vec<Arc<RegisteredFunction>>>,
    /// URNs in first-registration order.
    urn_order: RwLock<Vec<String>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_urn: DashMap::new(),
            urn_order: RwLock::new(Vec::new()),
        }
    }

    /// Registers one `(urn, version)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the exact same URN and version
    /// (build metadata included) is already registered.
    pub fn register(
        &self,
        descriptor: FunctionDescriptor,
        implementation: Implementation,
    ) -> Result<(), RegistryError> {
        let urn = descriptor.urn.clone();
        let mode = implementation.mode();
        {
            let mut versions = self.by_urn.entry(urn.clone()).or_default();
            if versions
                .iter()
                .any(|f| f.descriptor.version == descriptor.version)
            {
                return Err(RegistryError::Duplicate {
                    urn,
                    version: descriptor.version,
                });
            }
            if versions.is_empty() {
                self.urn_order.write().push(urn.clone());
            }
            debug!(urn = %urn, version = %descriptor.version, mode = %mode, "function registered");
            versions.push(Arc::new(RegisteredFunction {
                descriptor,
                implementation,
            }));
        }
        Ok(())
    }

    /// Picks the implementation that serves `urn` under `constraint`.
    ///
    /// - `Latest`: highest stable version.
    /// - `Exact`: that version only, prerelease included.
    /// - `Range`: highest version the range admits.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::FunctionNotFound`] when the URN is unknown or
    /// no registered version satisfies the constraint.
    pub fn resolve(
        &self,
        urn: &str,
        constraint: &VersionConstraint,
    ) -> Result<Arc<RegisteredFunction>, DispatchError> {
        let not_found = || DispatchError::FunctionNotFound {
            urn: urn.to_string(),
            constraint: constraint.to_string(),
        };
        let versions = self.by_urn.get(urn).ok_or_else(not_found)?;

        let mut best: Option<&Arc<RegisteredFunction>> = None;
        for candidate in versions.iter() {
            if !constraint.admits(&candidate.descriptor.version) {
                continue;
            }
            // Strictly greater only, so equal precedence keeps the earlier entry.
            let better = match best {
                None => true,
                Some(current) => {
                    candidate
                        .descriptor
                        .version
                        .cmp_precedence(&current.descriptor.version)
                        == Ordering::Greater
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.cloned().ok_or_else(not_found)
    }

    /// Registered versions of one URN, in registration order.
    #[must_use]
    pub fn versions(&self, urn: &str) -> Vec<Version> {
        self.by_urn
            .get(urn)
            .map(|versions| {
                versions
                    .iter()
                    .map(|f| f.descriptor.version.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every registered function, ordered by URN then version precedence.
    #[must_use]
    pub fn functions(&self) -> Vec<Arc<RegisteredFunction>> {
        let mut all: Vec<Arc<RegisteredFunction>> = self
            .by_urn
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| {
            a.descriptor.urn.cmp(&b.descriptor.urn).then_with(|| {
                a.descriptor
                    .version
                    .cmp_precedence(&b.descriptor.version)
            })
        });
        all
    }

    /// Descriptors of [`functions`](Self::functions), same order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<FunctionDescriptor> {
        self.functions()
            .iter()
            .map(|f| f.descriptor.clone())
            .collect()
    }

    /// URNs in the order they were first registered.
    #[must_use]
    pub fn urns(&self) -> Vec<String> {
        self.urn_order.read().clone()
    }

    /// Number of registered `(urn, version)` pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_urn.iter().map(|entry| entry.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
