use crate::context::ExecutionContext;

/// Per-execution decision whether permission injection runs at all.
///
/// Called for every statement, so implementations must stay cheap and must not parse SQL.
pub trait InterceptionGate: Send + Sync {
    fn should_intercept(&self, ctx: &ExecutionContext) -> bool;
}

/// Gate driven by the global switch and the context's own flags.
pub struct DefaultGate {
    enabled: bool,
}

impl DefaultGate {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Default for DefaultGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InterceptionGate for DefaultGate {
    fn should_intercept(&self, ctx: &ExecutionContext) -> bool {
        if !self.enabled || ctx.is_bypassed() {
            return false;
        }
        // Predicates are not idempotent; a second pass would duplicate them.
        if ctx.is_permission_applied() {
            tracing::debug!(operation = %ctx.operation(), "Permission already applied, skipping");
            return false;
        }
        !ctx.sql().trim().is_empty()
    }
}
