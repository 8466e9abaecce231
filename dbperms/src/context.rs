use std::collections::BTreeMap;

/// Context attributes available to predicate values (e.g. `tenant_id`).
pub type Attributes = BTreeMap<String, String>;

/// Identifies the logical operation being executed, e.g. `OrderMapper.list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    id: String,
}

impl OperationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Everything before the last `.`, or `None` for an unqualified id.
    pub fn namespace(&self) -> Option<&str> {
        self.id.rsplit_once('.').map(|(ns, _)| ns).filter(|ns| !ns.is_empty())
    }
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Holder for the SQL text that will be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSql {
    sql: String,
}

impl BoundSql {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Replaces the held text. Never appends.
    pub fn set_sql(&mut self, sql: String) {
        self.sql = sql;
    }
}

/// State of one statement execution as it travels down the interceptor chain.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    operation: OperationHandle,
    bound_sql: BoundSql,
    attributes: Attributes,
    bypass: bool,
    permission_applied: bool,
}

impl ExecutionContext {
    pub fn new(operation: OperationHandle, sql: impl Into<String>) -> Self {
        Self {
            operation,
            bound_sql: BoundSql::new(sql),
            attributes: Attributes::new(),
            bypass: false,
            permission_applied: false,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Skip permission injection for this execution (e.g. trusted maintenance jobs).
    pub fn bypassed(mut self) -> Self {
        self.bypass = true;
        self
    }

    pub fn operation(&self) -> &OperationHandle {
        &self.operation
    }

    pub fn sql(&self) -> &str {
        self.bound_sql.sql()
    }

    pub fn bound_sql_mut(&mut self) -> &mut BoundSql {
        &mut self.bound_sql
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn is_permission_applied(&self) -> bool {
        self.permission_applied
    }

    pub(crate) fn mark_permission_applied(&mut self) {
        self.permission_applied = true;
    }
}
