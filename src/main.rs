//! Runvoy CLI entry point.
//!
//! Subcommands cover bootstrap (`init-admin`, `check-policy`), user onboarding
//! (`create-user`, `claim`), the image catalog (`register-image`) and the
//! execution lifecycle (`run`, `list`, `kill`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use runvoy::app::{self, App};
use runvoy::authorization::{Action, PolicyEnforcer, ResourceKind, Role};
use runvoy::config::{self, Config};
use runvoy::execution::{ExecutionRequest, ExecutionStatus};
use runvoy::identity::UserService;

/// Runvoy: run shell commands in isolated containers with role-based access control.
#[derive(Parser)]
#[command(name = "runvoy", version, about)]
struct Cli {
    /// Path to config.toml (default: ~/.runvoy/config.toml).
    #[arg(long, global = true, env = "RUNVOY_CONFIG")]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the first admin and print its API key.
    InitAdmin {
        /// Admin email.
        #[arg(long)]
        email: String,
    },
    /// Print the effective role table and report coverage gaps.
    CheckPolicy,
    /// Create a user and print a one-time claim token.
    CreateUser {
        /// API key of the caller.
        #[arg(long, env = "RUNVOY_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Email of the new user.
        #[arg(long)]
        email: String,
        /// Role of the new user.
        #[arg(long)]
        role: Role,
    },
    /// Exchange a claim token for an API key.
    Claim {
        /// Claim token.
        token: String,
    },
    /// Register a container image.
    RegisterImage {
        /// API key of the caller.
        #[arg(long, env = "RUNVOY_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Image reference, e.g. `ubuntu:22.04`.
        reference: String,
        /// Make this the default image.
        #[arg(long)]
        default: bool,
    },
    /// Run a command and wait for it to finish.
    Run {
        /// API key of the caller.
        #[arg(long, env = "RUNVOY_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Image reference or id; the default image when omitted.
        #[arg(long, default_value = "")]
        image: String,
        /// Secret to expose to the command (repeatable).
        #[arg(long = "secret")]
        secrets: Vec<String>,
        /// Environment variable as KEY=VALUE (repeatable).
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Command to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// List executions, newest first.
    List {
        /// API key of the caller.
        #[arg(long, env = "RUNVOY_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Maximum number of results (0 = all).
        #[arg(long)]
        limit: Option<String>,
        /// Comma-separated statuses, e.g. RUNNING,FAILED.
        #[arg(long)]
        status: Option<String>,
    },
    /// Kill an execution.
    Kill {
        /// API key of the caller.
        #[arg(long, env = "RUNVOY_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Execution id.
        execution_id: String,
    },
}

const CLIENT_ADDR: &str = "127.0.0.1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let base_dir = config::config_dir()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| base_dir.join("config.toml"));
    let mut config = config::load_or_default(&config_path)?;
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;

    // Runs keep a JSON trail on disk; everything else logs to stderr only.
    let _guard = if matches!(cli.command, Command::Run { .. }) {
        Some(runvoy::logging::init_production(
            &config.logs_dir(&base_dir),
            &config.logging.level,
        )?)
    } else {
        runvoy::logging::init_cli(&config.logging.level);
        None
    };

    dispatch(cli.command, &config, &base_dir).await
}

async fn dispatch(command: Command, config: &Config, base_dir: &Path) -> anyhow::Result<()> {
    match command {
        Command::InitAdmin { email } => handle_init_admin(config, base_dir, &email).await,
        Command::CheckPolicy => handle_check_policy(config),
        Command::CreateUser {
            api_key,
            email,
            role,
        } => {
            let app = App::build(config, base_dir).await?;
            let session = app.api.authenticate(&api_key, CLIENT_ADDR).await?;
            let created = app.api.create_user(&session, &email, role, None).await;
            session.finish().await;
            print_json(&created?)
        }
        Command::Claim { token } => {
            let users = identity_only(config, base_dir).await?;
            let claimed = users.claim_api_key(&token, CLIENT_ADDR).await?;
            println!("{}", claimed.api_key);
            Ok(())
        }
        Command::RegisterImage {
            api_key,
            reference,
            default,
        } => {
            let app = App::build(config, base_dir).await?;
            let session = app.api.authenticate(&api_key, CLIENT_ADDR).await?;
            let image = app.api.register_image(&session, &reference, default).await;
            session.finish().await;
            print_json(&image?)
        }
        Command::Run {
            api_key,
            image,
            secrets,
            env,
            timeout,
            command,
        } => {
            let request = ExecutionRequest {
                command: command.join(" "),
                image,
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                secrets,
                timeout_seconds: timeout,
            };
            handle_run(config, base_dir, &api_key, &request).await
        }
        Command::List {
            api_key,
            limit,
            status,
        } => {
            let app = App::build(config, base_dir).await?;
            let session = app.api.authenticate(&api_key, CLIENT_ADDR).await?;
            let executions = app
                .api
                .list_executions(&session, limit.as_deref(), status.as_deref())
                .await;
            session.finish().await;
            print_json(&executions?)
        }
        Command::Kill {
            api_key,
            execution_id,
        } => {
            let app = App::build(config, base_dir).await?;
            let session = app.api.authenticate(&api_key, CLIENT_ADDR).await?;
            let killed = app.api.kill_execution(&session, &execution_id).await;
            session.finish().await;
            match killed? {
                Some(body) => print_json(&body),
                None => {
                    println!("execution {execution_id} had already finished");
                    Ok(())
                }
            }
        }
    }
}

/// Storage, enforcer and user service only; no Docker connection.
async fn identity_only(config: &Config, base_dir: &Path) -> anyhow::Result<UserService> {
    let stores = app::open_stores(config, base_dir).await?;
    let table = app::load_policy(config)?;
    let enforcer = Arc::new(PolicyEnforcer::new(&table));
    let users = UserService::new(stores.users, enforcer, app::claim_ttl(config));
    users.load_role_assignments().await?;
    Ok(users)
}

async fn handle_init_admin(config: &Config, base_dir: &Path, email: &str) -> anyhow::Result<()> {
    let users = identity_only(config, base_dir).await?;
    let claimed = users
        .bootstrap_admin(email)
        .await
        .context("failed to create the first admin")?;
    info!(email = %claimed.email, "admin created");
    println!("API key for {} (shown once):", claimed.email);
    println!("{}", claimed.api_key);
    Ok(())
}

fn handle_check_policy(config: &Config) -> anyhow::Result<()> {
    let table = app::load_policy(config)?;
    let enforcer = PolicyEnforcer::new(&table);

    for role in Role::ALL {
        println!("{role}:");
        for kind in ResourceKind::ALL {
            let allowed = |object: &str| -> String {
                Action::ALL
                    .into_iter()
                    .filter(|action| enforcer.role_allows(role, object, *action))
                    .map(|action| action.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            println!(
                "  {:<11} collection=[{}] instance=[{}]",
                kind.segment(),
                allowed(&kind.collection_path()),
                allowed(&kind.instance_path("example")),
            );
        }
    }

    let gaps = table.coverage_gaps();
    if gaps.is_empty() {
        println!("no coverage gaps");
        return Ok(());
    }
    for gap in &gaps {
        println!(
            "gap: {} has {} on {} but not on its instances",
            gap.role, gap.action, gap.collection
        );
    }
    anyhow::bail!("{} coverage gap(s) found", gaps.len())
}

async fn handle_run(
    config: &Config,
    base_dir: &Path,
    api_key: &str,
    request: &ExecutionRequest,
) -> anyhow::Result<()> {
    let app = App::build(config, base_dir).await?;
    let session = app.api.authenticate(api_key, CLIENT_ADDR).await?;
    let outcome = run_and_wait(&app, &session, request).await;
    session.finish().await;

    let (status, exit_code) = outcome?;
    app.shutdown();
    if status != ExecutionStatus::Succeeded {
        anyhow::bail!("execution finished with status {status} (exit code {exit_code:?})");
    }
    Ok(())
}

async fn run_and_wait(
    app: &App,
    session: &runvoy::api::Session,
    request: &ExecutionRequest,
) -> anyhow::Result<(ExecutionStatus, Option<i64>)> {
    let started = app.api.run_command(session, request).await?;
    eprintln!("execution {} {}", started.execution_id, started.status);

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let status = loop {
        interval.tick().await;
        let status = app
            .api
            .get_execution_status(session, &started.execution_id)
            .await?;
        if status.status.is_terminal() {
            break status;
        }
    };

    let logs = app.api.get_logs(session, &started.execution_id).await?;
    for event in &logs.events {
        println!("{}", event.message);
    }
    Ok((status.status, status.exit_code))
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
