use async_trait::async_trait;
use sqlparser::ast::Statement;

use super::{Next, QueryOutcome, StatementInterceptor};
use crate::config::SqlDialect;
use crate::context::ExecutionContext;
use crate::error::{InterceptError, RewriteError};

/// Rejects any non-read SQL statement before permission rewriting runs.
pub struct ReadOnlyInterceptor {
    dialect: SqlDialect,
}

impl ReadOnlyInterceptor {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }
}

fn is_read_only(statement: &Statement) -> bool {
    // SECURITY: allowlist. Any new Statement variant must be reviewed before adding here.
    match statement {
        // EXPLAIN ANALYZE executes the wrapped statement.
        Statement::Explain {
            analyze, statement, ..
        } => !*analyze || is_read_only(statement),
        Statement::Query(_)
        | Statement::ShowVariable { .. }
        | Statement::ExplainTable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. } => true,
        _ => false,
    }
}

#[async_trait]
impl StatementInterceptor for ReadOnlyInterceptor {
    async fn intercept(
        &self,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<QueryOutcome, InterceptError> {
        let statements = self.dialect.parse(ctx.sql()).map_err(RewriteError::from)?;

        if let Some(statement) = statements.iter().find(|s| !is_read_only(s)) {
            let stmt_type = std::mem::discriminant(statement);
            tracing::warn!(operation = %ctx.operation(), statement_type = ?stmt_type, "Rejected non-read-only statement");
            return Err(InterceptError::Rejected(
                "only read-only statements are allowed".to_owned(),
            ));
        }

        next.proceed(ctx).await
    }
}
