//! Permission declaration resolver.
//!
//! Operation ids map to declarations at startup; each id resolves to at most
//! one [`Policy`], which is cached (including "no policy") for later executions.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::OperationHandle;
use crate::error::ConfigurationError;
use crate::policy::{PermissionDeclaration, Policy};

pub struct PolicyRegistry {
    declarations: HashMap<String, PermissionDeclaration>,
    resolved: DashMap<String, Option<Arc<Policy>>>,
}

impl PolicyRegistry {
    pub fn new(declarations: HashMap<String, PermissionDeclaration>) -> Self {
        Self {
            declarations,
            resolved: DashMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Resolve the policy for an operation: the exact id first, then its namespace.
    pub fn resolve(
        &self,
        operation: &OperationHandle,
    ) -> Result<Option<Arc<Policy>>, ConfigurationError> {
        if let Some(cached) = self.resolved.get(operation.id()) {
            return Ok(cached.clone());
        }

        let declared = self
            .declarations
            .get_key_value(operation.id())
            .or_else(|| {
                operation
                    .namespace()
                    .and_then(|ns| self.declarations.get_key_value(ns))
            });

        let policy = match declared {
            Some((source, declaration)) => {
                tracing::debug!(operation = %operation, declared_on = %source, "Resolved permission declaration");
                Some(Arc::new(to_policy(source, declaration)?))
            }
            None => None,
        };

        self.resolved
            .insert(operation.id().to_owned(), policy.clone());
        Ok(policy)
    }

    /// Resolve every declaration so malformed metadata fails at startup.
    pub fn validate_all(&self) -> Result<(), ConfigurationError> {
        let mut ids: Vec<&String> = self.declarations.keys().collect();
        ids.sort();
        for id in ids {
            to_policy(id, &self.declarations[id])?;
        }
        Ok(())
    }

    /// Declared operation ids in sorted order.
    pub fn operations(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.declarations.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// The multi-rule block wins over the single rule; within it, autowire wins over rules.
fn to_policy(
    operation: &str,
    declaration: &PermissionDeclaration,
) -> Result<Policy, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidRule {
        operation: operation.to_owned(),
        reason,
    };

    if let Some(block) = &declaration.requires_permissions {
        if declaration.requires_permission.is_some() {
            tracing::debug!(operation, "Ignoring single-rule declaration shadowed by requires_permissions");
        }
        return match (block.autowire, block.rules.is_empty()) {
            (true, true) => Ok(Policy::Autowire),
            (true, false) => Err(ConfigurationError::ConflictingDeclaration {
                operation: operation.to_owned(),
            }),
            (false, true) => Err(ConfigurationError::EmptyDeclaration {
                operation: operation.to_owned(),
            }),
            (false, false) => {
                for rule in &block.rules {
                    rule.validate().map_err(invalid)?;
                }
                Ok(Policy::Explicit {
                    rules: block.rules.clone(),
                    logical: block.logical,
                })
            }
        };
    }

    match &declaration.requires_permission {
        Some(rule) => {
            rule.validate().map_err(invalid)?;
            Ok(Policy::explicit(vec![rule.clone()]))
        }
        None => Err(ConfigurationError::EmptyDeclaration {
            operation: operation.to_owned(),
        }),
    }
}
