use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::{GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::{Parser, ParserError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigurationError;
use crate::policy::{PermissionDeclaration, is_identifier};

/// SQL dialect used to parse statements before rewriting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Postgres,
    MySql,
    Generic,
}

impl SqlDialect {
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, ParserError> {
        match self {
            SqlDialect::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
            SqlDialect::MySql => Parser::parse_sql(&MySqlDialect {}, sql),
            SqlDialect::Generic => Parser::parse_sql(&GenericDialect {}, sql),
        }
    }
}

impl FromStr for SqlDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "mysql" => Ok(SqlDialect::MySql),
            "generic" => Ok(SqlDialect::Generic),
            other => Err(format!("unknown dialect '{other}' (expected postgres, mysql or generic)")),
        }
    }
}

fn default_autowire_columns() -> Vec<String> {
    vec!["tenant_id".to_owned()]
}

/// Which columns an autowire policy filters on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutowireSettings {
    /// Columns filtered on tables without an entry in `tables`.
    #[serde(default = "default_autowire_columns")]
    pub columns: Vec<String>,
    /// Per-table column overrides, keyed by table name.
    #[serde(default)]
    pub tables: HashMap<String, Vec<String>>,
    /// Tables never filtered by autowire (shared reference data).
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for AutowireSettings {
    fn default() -> Self {
        Self {
            columns: default_autowire_columns(),
            tables: HashMap::new(),
            exclude: Vec::new(),
        }
    }
}

impl AutowireSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.columns.is_empty() {
            return Err(ConfigurationError::InvalidAutowire(
                "default columns must not be empty".to_owned(),
            ));
        }
        if let Some((table, _)) = self.tables.iter().find(|(_, cols)| cols.is_empty()) {
            return Err(ConfigurationError::InvalidAutowire(format!(
                "table '{table}' has no columns"
            )));
        }
        for column in self.columns.iter().chain(self.tables.values().flatten()) {
            if !is_identifier(column) {
                return Err(ConfigurationError::InvalidAutowire(format!(
                    "column '{column}' is not a plain identifier"
                )));
            }
        }
        Ok(())
    }

    /// Columns to filter `table` on, or `None` if the table is excluded.
    pub fn columns_for(&self, table: &str) -> Option<&[String]> {
        if self.exclude.iter().any(|t| t.eq_ignore_ascii_case(table)) {
            return None;
        }
        let overridden = self
            .tables
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, cols)| cols.as_slice());
        Some(overridden.unwrap_or(&self.columns))
    }
}

/// Contents of the JSON policy file: the registration map plus autowire settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub autowire: AutowireSettings,
    #[serde(default)]
    pub operations: HashMap<String, PermissionDeclaration>,
}

impl PolicyFile {
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, &path.display().to_string())
    }

    pub fn from_json(raw: &str, origin: &str) -> Result<Self, ConfigurationError> {
        let file: PolicyFile =
            serde_json::from_str(raw).map_err(|source| ConfigurationError::PolicyFile {
                path: origin.to_owned(),
                source,
            })?;
        tracing::info!(
            origin,
            operations = file.operations.len(),
            "Loaded permission policies"
        );
        Ok(file)
    }
}

/// Runtime settings read from `DBPERMS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub policy_file: Option<PathBuf>,
    pub dialect: SqlDialect,
    pub enabled: bool,
    pub read_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy_file: None,
            dialect: SqlDialect::default(),
            enabled: true,
            read_only: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigurationError> {
        let mut settings = Settings::default();

        if let Some(path) = lookup("DBPERMS_POLICY_FILE").filter(|p| !p.is_empty()) {
            settings.policy_file = Some(PathBuf::from(path));
        }
        if let Some(dialect) = lookup("DBPERMS_DIALECT") {
            settings.dialect = dialect
                .parse::<SqlDialect>()
                .map_err(|reason| ConfigurationError::InvalidSetting {
                    key: "DBPERMS_DIALECT",
                    reason,
                })?;
        }
        if let Some(enabled) = lookup("DBPERMS_ENABLED") {
            settings.enabled = parse_flag("DBPERMS_ENABLED", &enabled)?;
        }
        if let Some(read_only) = lookup("DBPERMS_READ_ONLY") {
            settings.read_only = parse_flag("DBPERMS_READ_ONLY", &read_only)?;
        }

        Ok(settings)
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigurationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigurationError::InvalidSetting {
            key,
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}
