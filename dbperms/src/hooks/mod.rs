use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{PolicyFile, Settings};
use crate::context::ExecutionContext;
use crate::error::{ConfigurationError, InterceptError};
use crate::gate::DefaultGate;
use crate::registry::PolicyRegistry;
use crate::sql_rewrite::PredicateInjector;

pub mod permission;
pub mod read_only;

use permission::PermissionInterceptor;
use read_only::ReadOnlyInterceptor;

/// Result handed back by the host's executor.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(Vec<serde_json::Value>),
    Affected(u64),
}

/// Terminal stage of the chain: runs the statement text the context holds.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<QueryOutcome, InterceptError>;
}

/// StatementInterceptor for inspecting or rewriting a statement before it executes.
///
/// An interceptor either returns an error (the chain stops, nothing executes)
/// or calls `next.proceed(ctx)` to hand control to the rest of the chain.
#[async_trait]
pub trait StatementInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<QueryOutcome, InterceptError>;
}

/// Remainder of the chain after the current interceptor.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn StatementInterceptor>],
    executor: &'a dyn StatementExecutor,
}

impl Next<'_> {
    pub async fn proceed(self, ctx: &mut ExecutionContext) -> Result<QueryOutcome, InterceptError> {
        match self.remaining.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    remaining: rest,
                    executor: self.executor,
                };
                current.intercept(ctx, next).await
            }
            None => self.executor.execute(ctx).await,
        }
    }
}

/// Ordered interceptors; the first one added runs first.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn StatementInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn StatementInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        executor: &dyn StatementExecutor,
    ) -> Result<QueryOutcome, InterceptError> {
        Next {
            remaining: &self.interceptors,
            executor,
        }
        .proceed(ctx)
        .await
    }
}

/// Build the standard chain: optional read-only guard, then permission injection.
///
/// Every declaration is resolved up front so a bad policy file fails here.
pub fn default_chain(
    settings: &Settings,
    policies: PolicyFile,
) -> Result<InterceptorChain, ConfigurationError> {
    let registry = Arc::new(PolicyRegistry::new(policies.operations));
    registry.validate_all()?;
    let injector = Arc::new(PredicateInjector::new(settings.dialect, policies.autowire)?);

    let mut chain = InterceptorChain::new();
    if settings.read_only {
        chain = chain.with(Arc::new(ReadOnlyInterceptor::new(settings.dialect)));
    }
    chain = chain.with(Arc::new(PermissionInterceptor::new(
        Arc::new(DefaultGate::new(settings.enabled)),
        registry,
        injector,
    )));

    tracing::info!(hook_count = chain.len(), "Initialized statement interceptors");
    Ok(chain)
}
