//! agora CLI: operate an agent workflow coordinator.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use agora::clock::SystemClock;
use agora::condition;
use agora::config::AgoraConfig;
use agora::error::AgoraResult;
use agora::event::{Event, Payload};
use agora::heartbeat::Heartbeat;
use agora::lifecycle::Workflow;
use agora::paths::AgoraPaths;
use agora::store::{DurableStore, WorkflowStore};
use agora::trigger::{ProposalTemplate, Trigger, sync_triggers};
use agora::workflow::{Proposal, ProposalId, ProposalStatus};

#[derive(Parser)]
#[command(name = "agora", version, about = "Event-driven workflow coordinator for agents")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/agora/agora.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the durable store.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the store.
    Init,

    /// Append an event to the log.
    Event {
        /// Event type, e.g. "step_completed".
        kind: String,
        /// JSON object payload.
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Submit a proposal manually.
    Submit {
        title: String,
        /// Step kinds (comma-separated, in order).
        #[arg(long, value_delimiter = ',', required = true)]
        kinds: Vec<String>,
        /// Skip the approval gate.
        #[arg(long)]
        auto_approve: bool,
    },

    /// Approve a pending proposal.
    Approve { id: u64 },

    /// Cancel a proposal that has no running steps.
    Cancel { id: u64 },

    /// List proposals.
    Proposals {
        /// Filter by status (pending_approval, approved, in_progress, ...).
        #[arg(long)]
        status: Option<ProposalStatus>,
    },

    /// Show a proposal and its steps.
    Show { id: u64 },

    /// Manage triggers.
    Trigger {
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// List registered agents.
    Agents,

    /// Run a single heartbeat tick.
    Tick,

    /// Run the heartbeat until interrupted.
    Heartbeat,
}

#[derive(Subcommand)]
enum TriggerAction {
    /// Register a trigger.
    Add {
        #[arg(long)]
        name: String,
        /// Predicate, e.g. 'type == "step_completed" && payload.step_kind == "deploy"'.
        #[arg(long)]
        condition: String,
        /// Title template, e.g. "Audit {service}".
        #[arg(long)]
        title: String,
        #[arg(long, value_delimiter = ',', required = true)]
        kinds: Vec<String>,
        #[arg(long, default_value = "0")]
        cooldown: u64,
        #[arg(long)]
        auto_approve: bool,
    },
    /// List registered triggers.
    List,
    /// Remove a trigger by id.
    Remove { id: String },
    /// Evaluate a condition against a sample event.
    Check {
        condition: String,
        #[arg(long = "type")]
        kind: String,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

/// Config, store and workflow resolved from flags and XDG defaults.
struct Context {
    paths: AgoraPaths,
    config: AgoraConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl Context {
    fn resolve(cli: &Cli) -> AgoraResult<Self> {
        let paths = AgoraPaths::resolve()?;
        let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
        let config = AgoraConfig::load_or_default(&config_path)?;
        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| config.data_dir.clone())
            .unwrap_or_else(|| paths.data_dir.clone());
        Ok(Self {
            paths,
            config,
            config_path,
            data_dir,
        })
    }

    fn workflow(&self) -> AgoraResult<Workflow> {
        let store = DurableStore::open(&self.data_dir)?;
        Ok(Workflow::new(
            Arc::new(store),
            Arc::new(SystemClock),
            self.config.max_attempts,
        ))
    }

    /// Workflow with the config's triggers upserted into the store.
    fn synced_workflow(&self) -> AgoraResult<Workflow> {
        let workflow = self.workflow()?;
        let declared = self.config.triggers()?;
        if !declared.is_empty() {
            let count = sync_triggers(workflow.store().as_ref(), declared)?;
            tracing::debug!(count, "config triggers synced");
        }
        Ok(workflow)
    }
}

fn parse_payload(raw: &str) -> Result<Payload> {
    serde_json::from_str(raw)
        .into_diagnostic()
        .map_err(|e| e.wrap_err("payload must be a JSON object"))
}

fn print_proposal_row(p: &Proposal) {
    println!(
        "  {:>4}  {:<16}  {}  [{}]",
        p.id.0,
        p.status,
        p.title,
        p.step_kinds.join(", ")
    );
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let ctx = Context::resolve(&cli)?;

    match cli.command {
        Commands::Init => {
            ctx.paths.ensure_dirs()?;
            if !ctx.config_path.exists() {
                ctx.config.save(&ctx.config_path)?;
                println!("Wrote default config to {}", ctx.config_path.display());
            }
            ctx.synced_workflow()?;
            println!("Initialized store at {}", ctx.data_dir.display());
        }

        Commands::Event { kind, payload } => {
            let workflow = ctx.workflow()?;
            let event = workflow.log_event(&kind, parse_payload(&payload)?)?;
            println!("Logged event {} ({})", event.seq, event.kind);
        }

        Commands::Submit {
            title,
            kinds,
            auto_approve,
        } => {
            let workflow = ctx.workflow()?;
            let proposal = workflow.submit_proposal(&title, kinds, auto_approve)?;
            println!("Proposal {} created ({})", proposal.id, proposal.status);
        }

        Commands::Approve { id } => {
            let proposal = ctx.workflow()?.approve(ProposalId(id))?;
            println!("Proposal {} {}", proposal.id, proposal.status);
        }

        Commands::Cancel { id } => {
            let proposal = ctx.workflow()?.cancel(ProposalId(id))?;
            println!("Proposal {} {}", proposal.id, proposal.status);
        }

        Commands::Proposals { status } => {
            let proposals = ctx.workflow()?.store().list_proposals(status)?;
            if proposals.is_empty() {
                println!("No proposals.");
            } else {
                println!("Proposals ({}):", proposals.len());
                for p in &proposals {
                    print_proposal_row(p);
                }
            }
        }

        Commands::Show { id } => {
            let workflow = ctx.workflow()?;
            let proposal = workflow.proposal(ProposalId(id))?;
            println!("Proposal {}: {}", proposal.id, proposal.title);
            println!("  status:  {}", proposal.status);
            println!("  source:  {}", serde_json::to_string(&proposal.source).into_diagnostic()?);
            println!("  created: {}", proposal.created_at);
            for step in workflow.steps(proposal.id)? {
                println!(
                    "  step {:>4}  {:<16} {:<10} attempt={} owner={}",
                    step.id.0,
                    step.kind,
                    step.status,
                    step.attempt,
                    step.claimed_by.as_deref().unwrap_or("-"),
                );
                if let Some(error) = &step.error {
                    println!("             error: {error}");
                }
                if let Some(result) = &step.result {
                    println!("             result: {result}");
                }
            }
        }

        Commands::Trigger { action } => match action {
            TriggerAction::Add {
                name,
                condition,
                title,
                kinds,
                cooldown,
                auto_approve,
            } => {
                let parsed = condition::parse(&condition)?;
                let trigger = Trigger::new(
                    &name,
                    parsed,
                    ProposalTemplate {
                        title_template: title,
                        step_kinds: kinds,
                        auto_approve,
                    },
                )
                .with_cooldown(cooldown);
                let stored = ctx.workflow()?.store().put_trigger(trigger)?;
                println!("Trigger {} registered ({})", stored.id, stored.name);
            }
            TriggerAction::List => {
                let triggers = ctx.synced_workflow()?.store().list_triggers()?;
                if triggers.is_empty() {
                    println!("No triggers registered.");
                } else {
                    println!("Triggers ({}):", triggers.len());
                    for t in &triggers {
                        let last = t
                            .last_fired_at
                            .map(|at| at.to_string())
                            .unwrap_or_else(|| "never".into());
                        println!(
                            "  {} \"{}\" when {} cooldown={}s last_fired={}{}",
                            t.id,
                            t.name,
                            t.condition,
                            t.cooldown_seconds,
                            last,
                            if t.enabled { "" } else { " (disabled)" },
                        );
                    }
                }
            }
            TriggerAction::Remove { id } => {
                if ctx.workflow()?.store().remove_trigger(&id)? {
                    println!("Trigger {id} removed");
                } else {
                    miette::bail!("trigger \"{id}\" not found");
                }
            }
            TriggerAction::Check {
                condition,
                kind,
                payload,
            } => {
                let parsed = condition::parse(&condition)?;
                let event = Event {
                    seq: 0,
                    kind,
                    payload: parse_payload(&payload)?,
                    occurred_at: 0,
                };
                println!("{}", parsed.evaluate(&event)?);
            }
        },

        Commands::Agents => {
            let agents = ctx.workflow()?.store().list_agents()?;
            if agents.is_empty() {
                println!("No agents registered.");
            } else {
                println!("Agents ({}):", agents.len());
                for a in &agents {
                    let kinds: BTreeSet<&str> = a.step_kinds.iter().map(String::as_str).collect();
                    println!(
                        "  {}  kinds={:?} registered={} last_seen={}",
                        a.agent_id, kinds, a.registered_at, a.last_seen_at
                    );
                }
            }
        }

        Commands::Tick => {
            let workflow = ctx.synced_workflow()?;
            let report = Heartbeat::new(workflow, ctx.config.heartbeat()).tick();
            println!(
                "events={} created={} expanded={} requeued={} failed={} reconciled={} phase_errors={}",
                report.events_evaluated,
                report.proposals_created,
                report.proposals_expanded,
                report.steps_requeued,
                report.steps_failed,
                report.proposals_reconciled,
                report.phase_errors,
            );
        }

        Commands::Heartbeat => {
            let workflow = ctx.synced_workflow()?;
            let heartbeat = Arc::new(Heartbeat::new(workflow, ctx.config.heartbeat()));
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .into_diagnostic()?;
            runtime.block_on(async move {
                let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
                let handle = tokio::spawn(Arc::clone(&heartbeat).run(shutdown_rx));
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                let _ = shutdown_tx.send(true);
                handle.await.into_diagnostic()
            })?;
        }
    }

    Ok(())
}
