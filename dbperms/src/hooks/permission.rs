use async_trait::async_trait;
use std::sync::Arc;

use super::{Next, QueryOutcome, StatementInterceptor};
use crate::context::ExecutionContext;
use crate::error::InterceptError;
use crate::gate::InterceptionGate;
use crate::registry::PolicyRegistry;
use crate::sql_rewrite::PredicateInjector;

/// Injects the row-level permission predicates declared for the executing operation.
pub struct PermissionInterceptor {
    gate: Arc<dyn InterceptionGate>,
    registry: Arc<PolicyRegistry>,
    injector: Arc<PredicateInjector>,
}

impl PermissionInterceptor {
    pub fn new(
        gate: Arc<dyn InterceptionGate>,
        registry: Arc<PolicyRegistry>,
        injector: Arc<PredicateInjector>,
    ) -> Self {
        Self {
            gate,
            registry,
            injector,
        }
    }

    /// Rewrite the context's SQL in place. The holder is untouched on error.
    pub fn apply(&self, ctx: &mut ExecutionContext) -> Result<(), InterceptError> {
        if !self.gate.should_intercept(ctx) {
            return Ok(());
        }
        let Some(policy) = self.registry.resolve(ctx.operation())? else {
            return Ok(());
        };

        let rewritten = self
            .injector
            .inject(ctx.sql(), &policy, ctx.attributes())
            .inspect_err(|e| {
                tracing::warn!(operation = %ctx.operation(), error = %e, "Permission rewrite failed");
            })?;

        ctx.bound_sql_mut().set_sql(rewritten);
        ctx.mark_permission_applied();
        tracing::debug!(operation = %ctx.operation(), sql = %ctx.sql(), "Permissioned SQL");
        Ok(())
    }
}

#[async_trait]
impl StatementInterceptor for PermissionInterceptor {
    async fn intercept(
        &self,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<QueryOutcome, InterceptError> {
        self.apply(ctx)?;
        next.proceed(ctx).await
    }
}
