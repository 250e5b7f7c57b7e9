use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use conductor_config::load_config;
use conductor_core::capability::CredentialSet;
use conductor_core::planner::PlanBuilder;
use conductor_core::types::{ConfirmationMode, Decision};
use conductor_runtime::{
    gate_config, registry_from_config, Reply, RespondRequest, RuntimeApp, SubmitRequest,
};

use crate::handlers;

#[derive(Debug, Parser)]
#[command(name = "conductor", about = "Conductor request orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit one request against simulated capabilities
    Run(RunArgs),
    /// Print the capability catalog and its confirmation gating
    Catalog(CatalogArgs),
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[arg(long, default_value = "configs/conductor.yaml")]
    config: PathBuf,
    #[arg(long, default_value = "cli")]
    session: String,
    #[arg(long)]
    user: Option<String>,
    /// Credential providers to present (e.g. google)
    #[arg(
        long = "credential",
        value_name = "PROVIDER",
        env = "CONDUCTOR_CREDENTIALS",
        value_delimiter = ','
    )]
    credentials: Vec<String>,
    /// Confirm a proposal without asking
    #[arg(long, conflicts_with = "no")]
    yes: bool,
    /// Cancel a proposal without asking
    #[arg(long)]
    no: bool,
    /// Print replies as JSON
    #[arg(long)]
    json: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(value_name = "UTTERANCE", required = true)]
    utterance: Vec<String>,
}

#[derive(Debug, Args, Clone)]
struct CatalogArgs {
    #[arg(long, default_value = "configs/conductor.yaml")]
    config: PathBuf,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Run(args) => {
                ensure_log_filter(args.verbose);
                run_request(args).await
            }
            Command::Catalog(args) => print_catalog(args),
        }
    }
}

async fn run_request(args: RunArgs) -> anyhow::Result<()> {
    // Handlers the catalog does not declare are skipped at bind time.
    let app = RuntimeApp::from_config_path(args.config.clone(), handlers::simulated())
        .await
        .with_context(|| format!("failed to start from {}", args.config.display()))?;
    let outcome = converse(&app, &args).await;
    app.shutdown().await;
    outcome
}

async fn converse(app: &RuntimeApp, args: &RunArgs) -> anyhow::Result<()> {
    let credentials = args
        .credentials
        .iter()
        .filter(|provider| !provider.trim().is_empty())
        .fold(CredentialSet::new(), |set, provider| {
            set.with(provider.trim(), "simulated")
        });

    let mut request = SubmitRequest::new(&args.session, args.utterance.join(" "))
        .with_credentials(credentials.clone());
    if let Some(user) = &args.user {
        request = request.with_user(user);
    }
    let reply = app.orchestrator.submit(request).await?;
    print_reply(&reply, args.json)?;

    let Some(proposal) = &reply.proposal else {
        return Ok(());
    };
    let decision = if args.yes {
        Decision::Confirm
    } else if args.no {
        Decision::Cancel
    } else {
        prompt_decision()?
    };

    let mut respond =
        RespondRequest::new(&proposal.plan_id, decision).with_credentials(credentials);
    if let Some(user) = &args.user {
        respond = respond.with_user(user);
    }
    let outcome = app.orchestrator.respond_with(respond).await?;
    print_reply(&outcome, args.json)
}

fn print_reply(reply: &Reply, as_json: bool) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    if as_json {
        let body = json!({
            "session_id": reply.session_id,
            "plan_id": reply.plan_id,
            "status": reply.status,
            "message": reply.message,
            "ran": reply.ran,
            "still_pending": reply.still_pending,
            "proposal": reply.proposal,
            "displaced": reply.displaced.iter().map(|d| &d.message).collect::<Vec<_>>(),
        });
        writeln!(stdout, "{}", serde_json::to_string_pretty(&body)?)?;
        return Ok(());
    }
    for earlier in &reply.displaced {
        writeln!(stdout, "[earlier request] {}", earlier.message)?;
    }
    writeln!(stdout, "{}", reply.message)?;
    Ok(())
}

/// Ask on stdin until the answer parses; end of input cancels
fn prompt_decision() -> anyhow::Result<Decision> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("confirm or cancel? ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            return Ok(Decision::Cancel);
        };
        match line?.parse::<Decision>() {
            Ok(decision) => return Ok(decision),
            Err(err) => eprintln!("{}", err),
        }
    }
}

fn print_catalog(args: CatalogArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let registry = Arc::new(registry_from_config(&config.capabilities)?);
    let gate = PlanBuilder::new(registry.clone(), gate_config(&config));

    let mut stdout = io::stdout().lock();
    for descriptor in registry.descriptors() {
        let gating = match gate.confirmation_mode(descriptor) {
            ConfirmationMode::Auto => "auto",
            ConfirmationMode::NeedsConfirmation => "needs confirmation",
        };
        writeln!(
            stdout,
            "{} - {} [{}]",
            descriptor.name, descriptor.label, gating
        )?;
        if let Some(provider) = &descriptor.auth_provider {
            writeln!(stdout, "    auth: {}", provider)?;
        }
        for param in &descriptor.parameter_schema.params {
            writeln!(
                stdout,
                "    {}: {}{}",
                param.name,
                param.kind,
                if param.required { " (required)" } else { "" }
            )?;
        }
    }
    Ok(())
}

fn ensure_log_filter(verbose: bool) {
    if env::var("RUST_LOG").is_ok() {
        return;
    }
    env::set_var("RUST_LOG", if verbose { "debug" } else { "warn" });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "conductor",
            "run",
            "--session",
            "s1",
            "--credential",
            "google",
            "--yes",
            "email",
            "john@example.com",
            "about",
            "lunch",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.session, "s1");
                assert_eq!(args.credentials, vec!["google".to_string()]);
                assert!(args.yes);
                assert_eq!(args.utterance.join(" "), "email john@example.com about lunch");
                assert_eq!(args.config, PathBuf::from("configs/conductor.yaml"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_request_starts_from_one_config_read() {
        let config = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../configs/conductor.yaml");
        let cli = Cli::try_parse_from([
            "conductor",
            "run",
            "--config",
            config.to_str().unwrap(),
            "--json",
            "--no",
            "search",
            "the",
            "web",
            "for",
            "rust",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        tokio_test::block_on(run_request(args)).unwrap();
    }

    #[test]
    fn test_yes_and_no_conflict() {
        assert!(Cli::try_parse_from(["conductor", "run", "--yes", "--no", "hi"]).is_err());
        assert!(Cli::try_parse_from(["conductor", "run"]).is_err());
    }
}
