//! End-to-end tests for the statement interceptor chain.
//!
//! A recording executor stands in for the host database: it captures the SQL
//! text it receives, which is what would have been executed.

use async_trait::async_trait;
use dbperms::config::{PolicyFile, Settings, SqlDialect};
use dbperms::context::{ExecutionContext, OperationHandle};
use dbperms::error::{ConfigurationError, InterceptError, RewriteError};
use dbperms::hooks::{InterceptorChain, QueryOutcome, StatementExecutor, default_chain};
use std::sync::{Arc, Mutex};

const POLICIES: &str = r#"{
    "autowire": { "columns": ["tenant_id"], "exclude": ["countries"] },
    "operations": {
        "OrderMapper.list": { "requires_permissions": { "autowire": true } },
        "OrderMapper.byTenant": {
            "requires_permission": { "resource": "orders", "column": "tenant_id", "value": "42" }
        },
        "OrderMapper.byRegion": {
            "requires_permissions": {
                "logical": "or",
                "rules": [
                    { "resource": "orders", "column": "region", "value": ["eu", "us"] },
                    { "resource": "orders", "column": "owner", "value": "${user}" }
                ]
            }
        },
        "InvoiceMapper": {
            "requires_permission": { "resource": "invoices", "column": "tenant_id", "value": "${tenant_id}" }
        }
    }
}"#;

#[derive(Default)]
struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatementExecutor for RecordingExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<QueryOutcome, InterceptError> {
        self.executed.lock().unwrap().push(ctx.sql().to_owned());
        Ok(QueryOutcome::Rows(vec![serde_json::json!({ "id": 1 })]))
    }
}

fn chain_with(settings: Settings) -> InterceptorChain {
    let policies = PolicyFile::from_json(POLICIES, "test").expect("valid policy file");
    default_chain(&settings, policies).expect("valid chain")
}

fn chain() -> InterceptorChain {
    chain_with(Settings::default())
}

fn context(operation: &str, sql: &str) -> ExecutionContext {
    ExecutionContext::new(OperationHandle::new(operation), sql)
}

#[tokio::test]
async fn test_undeclared_operation_executes_original_sql() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("CustomerMapper.list", "SELECT * FROM customers");

    let outcome = chain().execute(&mut ctx, &executor).await.expect("execution succeeds");

    assert_eq!(outcome, QueryOutcome::Rows(vec![serde_json::json!({ "id": 1 })]));
    assert_eq!(executor.executed(), vec!["SELECT * FROM customers".to_owned()]);
}

#[tokio::test]
async fn test_explicit_rule_rewrites_before_execution() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("OrderMapper.byTenant", "SELECT * FROM orders");

    chain().execute(&mut ctx, &executor).await.expect("execution succeeds");

    assert_eq!(
        executor.executed(),
        vec!["SELECT * FROM orders WHERE tenant_id = '42'".to_owned()]
    );
    assert!(ctx.is_permission_applied());
}

#[tokio::test]
async fn test_autowire_reads_tenant_from_context() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("OrderMapper.list", "SELECT * FROM orders").with_attribute("tenant_id", "7");

    chain().execute(&mut ctx, &executor).await.expect("execution succeeds");

    let executed = executor.executed();
    assert!(
        executed[0].contains("tenant_id = '7'"),
        "Expected tenant predicate, got: {:?}",
        executed
    );
}

#[tokio::test]
async fn test_or_rules_with_placeholder() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("OrderMapper.byRegion", "SELECT * FROM orders").with_attribute("user", "alice");

    chain().execute(&mut ctx, &executor).await.expect("execution succeeds");

    assert_eq!(
        executor.executed(),
        vec!["SELECT * FROM orders WHERE (region IN ('eu', 'us') OR owner = 'alice')".to_owned()]
    );
}

#[tokio::test]
async fn test_namespace_declaration_covers_its_operations() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("InvoiceMapper.unpaid", "SELECT * FROM invoices WHERE paid = false")
        .with_attribute("tenant_id", "3");

    chain().execute(&mut ctx, &executor).await.expect("execution succeeds");

    assert_eq!(
        executor.executed(),
        vec!["SELECT * FROM invoices WHERE (paid = false) AND tenant_id = '3'".to_owned()]
    );
}

#[tokio::test]
async fn test_ddl_aborts_before_execution() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("OrderMapper.byTenant", "DROP TABLE orders");

    let err = chain().execute(&mut ctx, &executor).await.unwrap_err();

    assert!(matches!(err, InterceptError::Rewrite(RewriteError::UnsupportedStatement(_))));
    assert_eq!(ctx.sql(), "DROP TABLE orders");
    assert!(executor.executed().is_empty());
}

#[tokio::test]
async fn test_missing_attribute_aborts_before_execution() {
    let executor = RecordingExecutor::default();
    let mut ctx = context("OrderMapper.list", "SELECT * FROM orders");

    let err = chain().execute(&mut ctx, &executor).await.unwrap_err();

    assert!(matches!(err, InterceptError::Rewrite(RewriteError::MissingAttribute(_))));
    assert!(executor.executed().is_empty());
}

#[tokio::test]
async fn test_bypass_and_disabled_gate_skip_injection() {
    let executor = RecordingExecutor::default();
    let mut bypassed = context("OrderMapper.byTenant", "SELECT * FROM orders").bypassed();
    chain().execute(&mut bypassed, &executor).await.expect("execution succeeds");

    let disabled = chain_with(Settings {
        enabled: false,
        ..Settings::default()
    });
    let mut ctx = context("OrderMapper.byTenant", "SELECT * FROM orders");
    disabled.execute(&mut ctx, &executor).await.expect("execution succeeds");

    assert_eq!(
        executor.executed(),
        vec!["SELECT * FROM orders".to_owned(), "SELECT * FROM orders".to_owned()]
    );
}

#[tokio::test]
async fn test_context_reused_through_chain_is_not_rewritten_twice() {
    let executor = RecordingExecutor::default();
    let chain = chain();
    let mut ctx = context("OrderMapper.byTenant", "SELECT * FROM orders");

    chain.execute(&mut ctx, &executor).await.expect("first execution");
    chain.execute(&mut ctx, &executor).await.expect("second execution");

    let executed = executor.executed();
    assert_eq!(executed[0], executed[1]);
    assert_eq!(executed[1].matches("tenant_id = '42'").count(), 1);
}

#[tokio::test]
async fn test_read_only_mode_rejects_writes() {
    let executor = RecordingExecutor::default();
    let chain = chain_with(Settings {
        read_only: true,
        dialect: SqlDialect::Postgres,
        ..Settings::default()
    });
    let mut ctx = context("OrderMapper.byTenant", "DELETE FROM orders");

    let err = chain.execute(&mut ctx, &executor).await.unwrap_err();

    assert!(matches!(err, InterceptError::Rejected(_)));
    assert!(executor.executed().is_empty());
}

#[tokio::test]
async fn test_concurrent_executions_are_independent() {
    let chain = chain();
    let executor = Arc::new(RecordingExecutor::default());

    let mut handles = Vec::new();
    for tenant in 0..8 {
        let chain = chain.clone();
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            let mut ctx = context("OrderMapper.list", "SELECT * FROM orders")
                .with_attribute("tenant_id", tenant.to_string());
            chain.execute(&mut ctx, executor.as_ref()).await.map(|_| ctx.sql().to_owned())
        }));
    }

    for (tenant, handle) in handles.into_iter().enumerate() {
        let sql = handle.await.expect("task completes").expect("execution succeeds");
        assert!(
            sql.ends_with(&format!("tenant_id = '{tenant}'")),
            "Expected tenant {} predicate, got: {}",
            tenant,
            sql
        );
    }
    assert_eq!(executor.executed().len(), 8);
}

#[test]
fn test_conflicting_declaration_fails_at_startup() {
    let raw = r#"{
        "operations": {
            "OrderMapper.list": {
                "requires_permissions": {
                    "autowire": true,
                    "rules": [ { "resource": "orders", "column": "tenant_id", "value": "1" } ]
                }
            }
        }
    }"#;
    let policies = PolicyFile::from_json(raw, "test").expect("valid json");
    let err = default_chain(&Settings::default(), policies).err().expect("conflict detected");
    assert!(matches!(err, ConfigurationError::ConflictingDeclaration { .. }));
}
