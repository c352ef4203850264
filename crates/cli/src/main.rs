use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cortex_core::{
    CortexContext, IntentType, Locale, RecentAction, RuleRegistry, SharedRegistry, UserRole,
    MAX_RECENT_ACTIONS,
};
use cortex_observability::{init_tracing, PipelineMetrics};
use cortex_orchestrator::HttpReasoningBackend;
use cortex_pipeline::{FallbackChainCoordinator, PipelineConfig, StaticFlags, ESCALATION_FLAG};

type Coordinator = FallbackChainCoordinator<HttpReasoningBackend, StaticFlags>;

#[derive(Debug, Parser)]
#[command(name = "cortex")]
#[command(about = "Command-center intent classification CLI")]
struct Cli {
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Classify {
        text: String,
        #[arg(long, default_value = "/")]
        location: String,
        #[arg(long)]
        record: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        locale: Option<String>,
        #[arg(long)]
        no_escalation: bool,
    },
    Repl {
        #[arg(long)]
        no_escalation: bool,
    },
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    Check { path: Option<PathBuf> },
    List { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("cortex_cli");
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    if let Some(rules) = cli.rules {
        config.rules_path = rules;
    }

    match cli.command {
        Command::Classify {
            text,
            location,
            record,
            role,
            locale,
            no_escalation,
        } => {
            let coordinator = build_coordinator(&config, no_escalation)?;

            let mut builder = CortexContext::builder()
                .location(location)
                .role(UserRole::from_optional_str(role.as_deref()))
                .locale(Locale::from_optional_str(locale.as_deref()));
            if let Some(record) = record {
                builder = builder.active_record(record);
            }
            let context = builder.build_for(&text);

            let result = coordinator.classify(&text, &context).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Repl { no_escalation } => {
            let coordinator = build_coordinator(&config, no_escalation)?;
            run_repl(&coordinator).await?;
        }
        Command::Rules { command } => match command {
            RulesCommand::Check { path } => {
                let path = path.unwrap_or_else(|| config.rules_path.clone());
                let registry = load_registry(&path)?;
                let summary = registry.summary();
                println!(
                    "ok: {} ({} intents, {} rules, version {:?})",
                    summary.source,
                    summary.intents.len(),
                    summary.rules.len(),
                    summary.version
                );
            }
            RulesCommand::List { path } => {
                let path = path.unwrap_or_else(|| config.rules_path.clone());
                let registry = load_registry(&path)?;
                for rule in registry.rules() {
                    println!(
                        "{:<28} {:<22} priority={:<3} {}",
                        rule.id(),
                        rule.intent(),
                        rule.priority(),
                        rule.description().unwrap_or_default()
                    );
                }
            }
        },
    }

    Ok(())
}

async fn run_repl(coordinator: &Coordinator) -> Result<()> {
    let mut location = "/".to_string();
    let mut record: Option<String> = None;
    let mut recent: Vec<RecentAction> = Vec::new();

    println!("Cortex classification mode. ':loc <path>', ':record <id>', 'exit' to quit.");

    loop {
        print!("{location}> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let input = line.trim();
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        if input.is_empty() {
            continue;
        }
        if let Some(path) = input.strip_prefix(":loc ") {
            location = path.trim().to_string();
            continue;
        }
        if let Some(id) = input.strip_prefix(":record ") {
            let id = id.trim();
            record = (!id.is_empty()).then(|| id.to_string());
            continue;
        }

        let mut builder = CortexContext::builder()
            .location(location.clone())
            .recent_actions(recent.iter().cloned());
        if let Some(record) = &record {
            builder = builder.active_record(record.clone());
        }
        let context = builder.build_for(input);

        let result = coordinator.classify(input, &context).await;
        println!(
            "\n[{}] confidence {:.2}",
            result.state.as_str(),
            result.chain.min_confidence()
        );
        for (idx, step) in result.chain.steps().iter().enumerate() {
            println!("  {}. {} {:?}", idx + 1, step.intent, step.slots);
        }
        println!();

        remember(&mut recent, result.chain.steps().iter().map(|step| &step.intent));
    }

    Ok(())
}

fn remember<'a>(recent: &mut Vec<RecentAction>, intents: impl Iterator<Item = &'a IntentType>) {
    for intent in intents.filter(|intent| !intent.is_unknown()) {
        recent.push(RecentAction {
            intent: intent.clone(),
            at: Utc::now(),
        });
    }
    if recent.len() > MAX_RECENT_ACTIONS {
        let excess = recent.len() - MAX_RECENT_ACTIONS;
        recent.drain(..excess);
    }
}

fn load_registry(path: &Path) -> Result<RuleRegistry> {
    RuleRegistry::load(path)
        .with_context(|| format!("failed loading rules from {}", path.display()))
}

fn build_coordinator(config: &PipelineConfig, no_escalation: bool) -> Result<Coordinator> {
    let registry = load_registry(&config.rules_path)?;
    let backend = config
        .http_backend()
        .context("failed to configure reasoning backend")?;

    let flags = config.feature_flags();
    if no_escalation {
        flags.set(ESCALATION_FLAG, false);
    }

    Ok(FallbackChainCoordinator::from_config(
        config,
        SharedRegistry::new(registry),
        flags,
        PipelineMetrics::shared(),
        backend,
    ))
}
