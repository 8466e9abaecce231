use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dbperms::config::{PolicyFile, Settings};
use dbperms::context::{ExecutionContext, OperationHandle};
use dbperms::error::InterceptError;
use dbperms::hooks::{QueryOutcome, StatementExecutor, default_chain};
use dbperms::registry::PolicyRegistry;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dbperms", about = "dbperms — row-level permission predicate injection")]
struct Cli {
    /// Policy file (overrides DBPERMS_POLICY_FILE)
    #[arg(long, global = true)]
    policies: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every declaration in the policy file
    Check,
    /// Run one statement through the interceptor chain and print the SQL that would execute
    Rewrite {
        /// Operation id, e.g. OrderMapper.list
        #[arg(long)]
        operation: String,
        /// Context attribute as key=value (repeatable)
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
        /// Skip permission injection for this statement
        #[arg(long, action = clap::ArgAction::SetTrue)]
        bypass: bool,
        sql: String,
    },
}

fn parse_attr(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Prints the statement instead of running it.
struct PrintExecutor;

#[async_trait]
impl StatementExecutor for PrintExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<QueryOutcome, InterceptError> {
        println!("{}", ctx.sql());
        Ok(QueryOutcome::Affected(0))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init structured logging (respects RUST_LOG; defaults to info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let policies = match cli.policies.as_ref().or(settings.policy_file.as_ref()) {
        Some(path) => PolicyFile::load(path)?,
        None => {
            tracing::warn!(
                "No policy file configured (DBPERMS_POLICY_FILE or --policies) — no operation is permissioned"
            );
            PolicyFile::default()
        }
    };

    match cli.command {
        Commands::Check => check(policies),
        Commands::Rewrite {
            operation,
            attrs,
            bypass,
            sql,
        } => {
            let chain = default_chain(&settings, policies)?;
            let mut ctx = ExecutionContext::new(OperationHandle::new(operation), sql);
            ctx.attributes_mut().extend(attrs);
            if bypass {
                ctx = ctx.bypassed();
            }
            chain.execute(&mut ctx, &PrintExecutor).await?;
            Ok(())
        }
    }
}

fn check(policies: PolicyFile) -> Result<(), Box<dyn std::error::Error>> {
    policies.autowire.validate()?;
    let registry = PolicyRegistry::new(policies.operations);
    registry.validate_all()?;
    for operation in registry.operations() {
        let policy = registry.resolve(&OperationHandle::new(operation))?;
        println!("{operation}: {policy:?}");
    }
    tracing::info!(operations = registry.len(), "Policy file is valid");
    Ok(())
}
