//! Predicate injector: rewrites a statement so every user table reference is
//! filtered by the predicates a [`Policy`] produces.

use sqlparser::ast::{
    BinaryOperator, Delete, Expr, FromTable, Ident, ObjectName, ObjectNamePart, Query, Select,
    SetExpr, Statement, TableFactor, TableWithJoins, UpdateTableFromKind, Value, VisitMut,
    VisitorMut,
};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use crate::config::{AutowireSettings, SqlDialect};
use crate::context::Attributes;
use crate::error::{ConfigurationError, RewriteError};
use crate::policy::{Action, Logical, Policy, Rule, ValueSource};

/// System catalog schemas; tables in these are never filtered.
const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

pub struct PredicateInjector {
    dialect: SqlDialect,
    autowire: AutowireSettings,
}

impl PredicateInjector {
    pub fn new(dialect: SqlDialect, autowire: AutowireSettings) -> Result<Self, ConfigurationError> {
        autowire.validate()?;
        Ok(Self { dialect, autowire })
    }

    /// Rewrite `sql` under `policy`. Pure: the same inputs always give the same output.
    ///
    /// Statements without user table references come back unchanged. The output
    /// is not a fixed point: injecting into it again adds the predicates twice.
    pub fn inject(
        &self,
        sql: &str,
        policy: &Policy,
        attributes: &Attributes,
    ) -> Result<String, RewriteError> {
        let mut statements = self.dialect.parse(sql)?;
        if statements.len() != 1 {
            return Err(RewriteError::StatementCount(statements.len()));
        }
        let mut statement = statements.remove(0);
        let action = statement_action(&statement)?;

        let mut visitor = PermissionVisitor {
            policy,
            autowire: &self.autowire,
            attributes,
            action,
            cte_scopes: Vec::new(),
            cte_bodies: HashMap::new(),
            user_tables: 0,
            predicates: 0,
        };
        if let ControlFlow::Break(err) = VisitMut::visit(&mut statement, &mut visitor) {
            return Err(err);
        }

        if visitor.user_tables == 0 {
            return Ok(sql.to_owned());
        }
        if visitor.predicates == 0 {
            return match policy {
                // Every referenced table is excluded from autowire.
                Policy::Autowire => Ok(sql.to_owned()),
                Policy::Explicit { .. } => Err(RewriteError::NoApplicableRule),
            };
        }

        tracing::debug!(
            tables = visitor.user_tables,
            predicates = visitor.predicates,
            "Injected permission predicates"
        );
        Ok(statement.to_string())
    }
}

fn statement_action(statement: &Statement) -> Result<Action, RewriteError> {
    match statement {
        Statement::Query(_) => Ok(Action::Select),
        Statement::Update { .. } => Ok(Action::Update),
        Statement::Delete(_) => Ok(Action::Delete),
        other => {
            let rendered = other.to_string();
            let keyword = rendered.split_whitespace().next().unwrap_or_default();
            Err(RewriteError::UnsupportedStatement(keyword.to_uppercase()))
        }
    }
}

fn name_parts(name: &ObjectName) -> Vec<&Ident> {
    name.0
        .iter()
        .map(|part| {
            let ObjectNamePart::Identifier(ident) = part;
            ident
        })
        .collect()
}

/// A table is "system" if it carries a system-schema qualifier or is an unqualified `pg_*` name.
fn is_system_table(parts: &[&Ident]) -> bool {
    match parts {
        [single] => single.value.to_lowercase().starts_with("pg_"),
        [schema, ..] => SYSTEM_SCHEMAS.contains(&schema.value.to_lowercase().as_str()),
        [] => false,
    }
}

fn flatten_relations<'t>(tables: &[&'t TableWithJoins], out: &mut Vec<&'t TableFactor>) {
    for table in tables.iter().copied() {
        let relations = std::iter::once(&table.relation).chain(table.joins.iter().map(|j| &j.relation));
        for relation in relations {
            match relation {
                TableFactor::NestedJoin {
                    table_with_joins, ..
                } => flatten_relations(&[&**table_with_joins], out),
                other => out.push(other),
            }
        }
    }
}

/// Tables named by `UPDATE ... FROM`.
trait UpdateFromTables {
    fn tables(&self) -> &[TableWithJoins];
}

impl UpdateFromTables for TableWithJoins {
    fn tables(&self) -> &[TableWithJoins] {
        std::slice::from_ref(self)
    }
}

impl UpdateFromTables for Vec<TableWithJoins> {
    fn tables(&self) -> &[TableWithJoins] {
        self
    }
}

/// A filterable table in one `SELECT`/`UPDATE`/`DELETE` scope.
struct TableRef {
    table: String,
    qualifier: Vec<Ident>,
}

/// User tables of a scope, each with the qualifier its predicates must use.
fn user_tables(tables: &[&TableWithJoins], cte_names: &HashSet<String>) -> Vec<TableRef> {
    let mut relations = Vec::new();
    flatten_relations(tables, &mut relations);
    let qualify = relations.len() > 1;

    relations
        .into_iter()
        .filter_map(|relation| {
            let TableFactor::Table {
                name, alias, args, ..
            } = relation
            else {
                return None;
            };
            if args.is_some() {
                return None;
            }
            let parts = name_parts(name);
            let last = parts.last()?;
            if is_system_table(&parts) {
                tracing::debug!(table = %name, "Skipping permission predicates for system table");
                return None;
            }
            if parts.len() == 1 && cte_names.contains(&last.value.to_lowercase()) {
                return None;
            }

            let qualifier = match alias {
                Some(alias) => vec![alias.name.clone()],
                None if qualify => parts.iter().map(|p| (*p).clone()).collect(),
                None => Vec::new(),
            };
            Some(TableRef {
                table: last.value.clone(),
                qualifier,
            })
        })
        .collect()
}

fn column_expr(qualifier: &[Ident], column: &str) -> Expr {
    if qualifier.is_empty() {
        Expr::Identifier(Ident::new(column))
    } else {
        let mut idents = qualifier.to_vec();
        idents.push(Ident::new(column));
        Expr::CompoundIdentifier(idents)
    }
}

/// Quote `value` as a string literal for `column`.
///
/// The printer only doubles single quotes, so a backslash could turn the closing
/// quote into an escape under backslash-escaping strings. Such values are refused.
fn literal(column: &str, value: &str) -> Result<Expr, RewriteError> {
    if value.contains(['\\', '\0']) {
        return Err(RewriteError::UnsafeValue(column.to_owned()));
    }
    Ok(Expr::Value(Value::SingleQuotedString(value.to_owned()).into()))
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    }
}

fn or(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::Or,
        right: Box::new(right),
    }
}

fn bind<'v>(raw: &'v str, attributes: &'v Attributes) -> Result<&'v str, RewriteError> {
    match ValueSource::parse(raw) {
        ValueSource::Literal(value) => Ok(value),
        ValueSource::Attribute(name) => attributes
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RewriteError::MissingAttribute(name.to_owned())),
    }
}

struct PermissionVisitor<'a> {
    policy: &'a Policy,
    autowire: &'a AutowireSettings,
    attributes: &'a Attributes,
    action: Action,
    /// CTE names visible in each query being visited, innermost last.
    cte_scopes: Vec<HashSet<String>>,
    /// Names visible inside CTE bodies not yet visited, keyed by the body's address.
    cte_bodies: HashMap<*const Query, HashSet<String>>,
    user_tables: usize,
    predicates: usize,
}

impl PermissionVisitor<'_> {
    fn rule_predicate(&self, rule: &Rule, qualifier: &[Ident]) -> Result<Expr, RewriteError> {
        let column = column_expr(qualifier, &rule.column);
        let values = rule
            .value
            .values()
            .iter()
            .map(|raw| bind(raw, self.attributes).and_then(|value| literal(&rule.column, value)))
            .collect::<Result<Vec<_>, _>>()?;

        if let [single] = values.as_slice() {
            return Ok(Expr::BinaryOp {
                left: Box::new(column),
                op: BinaryOperator::Eq,
                right: Box::new(single.clone()),
            });
        }
        Ok(Expr::InList {
            expr: Box::new(column),
            list: values,
            negated: false,
        })
    }

    /// Predicates for one table reference, already combined as they must appear.
    fn table_predicates(&self, table: &TableRef) -> Result<Vec<Expr>, RewriteError> {
        match self.policy {
            Policy::Autowire => {
                let Some(columns) = self.autowire.columns_for(&table.table) else {
                    return Ok(Vec::new());
                };
                columns
                    .iter()
                    .map(|column| {
                        let value = self
                            .attributes
                            .get(column)
                            .ok_or_else(|| RewriteError::MissingAttribute(column.clone()))?;
                        Ok(Expr::BinaryOp {
                            left: Box::new(column_expr(&table.qualifier, column)),
                            op: BinaryOperator::Eq,
                            right: Box::new(literal(column, value)?),
                        })
                    })
                    .collect()
            }
            Policy::Explicit { rules, logical } => {
                let predicates = rules
                    .iter()
                    .filter(|rule| rule.applies_to(&table.table, self.action))
                    .map(|rule| self.rule_predicate(rule, &table.qualifier))
                    .collect::<Result<Vec<_>, _>>()?;

                match logical {
                    Logical::And => Ok(predicates),
                    Logical::Or if predicates.len() > 1 => {
                        let disjunction = predicates.into_iter().reduce(or).into_iter();
                        Ok(disjunction.map(|e| Expr::Nested(Box::new(e))).collect())
                    }
                    Logical::Or => Ok(predicates),
                }
            }
        }
    }

    /// AND the scope's predicates onto its `WHERE`, keeping the original condition intact.
    fn scope(
        &mut self,
        tables: &[&TableWithJoins],
        selection: &mut Option<Expr>,
    ) -> ControlFlow<RewriteError> {
        let ctes = self.cte_scopes.last().cloned().unwrap_or_default();
        let mut predicates = Vec::new();
        for table in user_tables(tables, &ctes) {
            self.user_tables += 1;
            match self.table_predicates(&table) {
                Ok(exprs) => predicates.extend(exprs),
                Err(err) => return ControlFlow::Break(err),
            }
        }
        if predicates.is_empty() {
            return ControlFlow::Continue(());
        }
        self.predicates += predicates.len();

        let existing = selection.take().map(|e| Expr::Nested(Box::new(e)));
        *selection = existing.into_iter().chain(predicates).reduce(and);
        ControlFlow::Continue(())
    }

    fn scope_set_expr(&mut self, body: &mut SetExpr) -> ControlFlow<RewriteError> {
        match body {
            SetExpr::Select(select) => {
                let Select {
                    from, selection, ..
                } = &mut **select;
                let tables: Vec<&TableWithJoins> = from.iter().collect();
                self.scope(&tables, selection)
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.scope_set_expr(left)?;
                self.scope_set_expr(right)
            }
            // Nested queries are visited on their own.
            _ => ControlFlow::Continue(()),
        }
    }
}

impl VisitorMut for PermissionVisitor<'_> {
    type Break = RewriteError;

    fn pre_visit_statement(&mut self, statement: &mut Statement) -> ControlFlow<Self::Break> {
        match statement {
            Statement::Update {
                table,
                from,
                selection,
                ..
            } => {
                let mut tables = vec![&*table];
                if let Some(
                    UpdateTableFromKind::BeforeSet(joined) | UpdateTableFromKind::AfterSet(joined),
                ) = from
                {
                    tables.extend(joined.tables());
                }
                self.scope(&tables, selection)
            }
            Statement::Delete(Delete {
                from,
                using,
                selection,
                ..
            }) => {
                let mut tables: Vec<&TableWithJoins> = match from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables.iter().collect()
                    }
                };
                tables.extend(using.iter().flatten());
                self.scope(&tables, selection)
            }
            _ => ControlFlow::Continue(()),
        }
    }

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        let key: *const Query = &*query;
        let mut visible = match self.cte_bodies.remove(&key) {
            Some(names) => names,
            None => self.cte_scopes.last().cloned().unwrap_or_default(),
        };

        if let Some(with) = &query.with {
            let names: Vec<String> = with
                .cte_tables
                .iter()
                .map(|cte| cte.alias.name.value.to_lowercase())
                .collect();
            for (i, cte) in with.cte_tables.iter().enumerate() {
                // A non-recursive CTE body sees only the CTEs declared before it.
                let declared = if with.recursive { &names[..] } else { &names[..i] };
                let mut body = visible.clone();
                body.extend(declared.iter().cloned());
                self.cte_bodies.insert(&*cte.query as *const Query, body);
            }
            visible.extend(names);
        }

        self.cte_scopes.push(visible);
        self.scope_set_expr(&mut query.body)
    }

    fn post_visit_query(&mut self, _query: &mut Query) -> ControlFlow<Self::Break> {
        self.cte_scopes.pop();
        ControlFlow::Continue(())
    }
}
