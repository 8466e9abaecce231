//! Permission policies and their declared (serialized) form.
//!
//! A declaration is what the policy file attaches to an operation; a [`Policy`]
//! is the validated, resolved shape the injector works with.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_.]*)\}$").expect("valid placeholder regex")
});

/// Returns `true` if `name` can be emitted as an unquoted SQL identifier.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// How predicates of an explicit policy are combined on one table reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logical {
    #[default]
    And,
    Or,
}

/// Statement kind a rule is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Select,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Select => write!(f, "select"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// A literal, or `${name}` bound from the execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource<'a> {
    Literal(&'a str),
    Attribute(&'a str),
}

impl<'a> ValueSource<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match PLACEHOLDER.captures(raw).and_then(|c| c.get(1)) {
            Some(name) => ValueSource::Attribute(name.as_str()),
            None => ValueSource::Literal(raw),
        }
    }
}

/// Right-hand side of a rule: `column = 'v'` or `column IN ('a', 'b')`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    One(String),
    Many(Vec<String>),
}

impl RuleValue {
    pub fn values(&self) -> &[String] {
        match self {
            RuleValue::One(v) => std::slice::from_ref(v),
            RuleValue::Many(vs) => vs,
        }
    }
}

/// One permission rule: restrict `resource` rows to those whose `column` matches `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub column: String,
    pub value: RuleValue,
}

impl Rule {
    pub fn new(resource: impl Into<String>, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: None,
            column: column.into(),
            value: RuleValue::One(value.into()),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Whether the rule targets `table` for a statement of kind `action`.
    pub fn applies_to(&self, table: &str, action: Action) -> bool {
        self.resource.eq_ignore_ascii_case(table) && self.action.is_none_or(|a| a == action)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.resource.trim().is_empty() {
            return Err("resource must not be empty".to_owned());
        }
        if !is_identifier(&self.column) {
            return Err(format!("column '{}' is not a plain identifier", self.column));
        }
        let values = self.value.values();
        if values.is_empty() {
            return Err(format!("rule on '{}' has no values", self.resource));
        }
        for raw in values {
            if raw.starts_with("${") && matches!(ValueSource::parse(raw), ValueSource::Literal(_)) {
                return Err(format!("malformed placeholder '{raw}'"));
            }
            if raw.contains(['\\', '\0']) {
                return Err(format!("value for '{}' contains a backslash or NUL byte", self.column));
            }
        }
        Ok(())
    }
}

/// Resolved permission policy attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Filter columns come from the injector's autowire settings, values from the context.
    Autowire,
    /// Declared rules, combined per table reference with `logical`.
    Explicit { rules: Vec<Rule>, logical: Logical },
}

impl Policy {
    pub fn explicit(rules: Vec<Rule>) -> Self {
        Policy::Explicit {
            rules,
            logical: Logical::And,
        }
    }
}

/// The multi-rule declaration shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiresPermissions {
    #[serde(default)]
    pub autowire: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub logical: Logical,
}

/// Permission metadata registered for one operation or namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDeclaration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_permissions: Option<RequiresPermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_permission: Option<Rule>,
}

impl PermissionDeclaration {
    pub fn autowire() -> Self {
        Self {
            requires_permissions: Some(RequiresPermissions {
                autowire: true,
                ..Default::default()
            }),
            requires_permission: None,
        }
    }

    pub fn rules(rules: Vec<Rule>, logical: Logical) -> Self {
        Self {
            requires_permissions: Some(RequiresPermissions {
                autowire: false,
                rules,
                logical,
            }),
            requires_permission: None,
        }
    }

    pub fn rule(rule: Rule) -> Self {
        Self {
            requires_permissions: None,
            requires_permission: Some(rule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_detected() {
        assert_eq!(ValueSource::parse("${tenant_id}"), ValueSource::Attribute("tenant_id"));
        assert_eq!(ValueSource::parse("42"), ValueSource::Literal("42"));
        assert_eq!(ValueSource::parse("${}"), ValueSource::Literal("${}"));
    }

    #[test]
    fn rule_matches_resource_case_insensitively() {
        let rule = Rule::new("Orders", "tenant_id", "1");
        assert!(rule.applies_to("orders", Action::Select));
        assert!(!rule.applies_to("customers", Action::Select));
    }

    #[test]
    fn rule_with_action_only_applies_to_that_action() {
        let rule = Rule::new("orders", "tenant_id", "1").with_action(Action::Delete);
        assert!(rule.applies_to("orders", Action::Delete));
        assert!(!rule.applies_to("orders", Action::Select));
    }

    #[test]
    fn rule_rejects_non_identifier_column() {
        let rule = Rule::new("orders", "tenant_id; DROP TABLE x", "1");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rule_rejects_malformed_placeholder() {
        let rule = Rule::new("orders", "tenant_id", "${tenant id}");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rule_rejects_backslash_in_literal_value() {
        let rule = Rule::new("orders", "tenant_id", r"x\' OR 1=1 -- ");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn declaration_deserializes_both_shapes() {
        let json = r#"{
            "requires_permissions": { "logical": "or", "rules": [
                { "resource": "orders", "column": "region", "value": ["eu", "us"] }
            ] },
            "requires_permission": { "resource": "orders", "action": "select", "column": "tenant_id", "value": "42" }
        }"#;
        let decl: PermissionDeclaration = serde_json::from_str(json).expect("valid declaration");
        let block = decl.requires_permissions.expect("multi-rule block");
        assert!(!block.autowire);
        assert_eq!(block.logical, Logical::Or);
        assert_eq!(block.rules[0].value.values(), ["eu".to_owned(), "us".to_owned()]);
        let single = decl.requires_permission.expect("single rule");
        assert_eq!(single.action, Some(Action::Select));
    }
}
