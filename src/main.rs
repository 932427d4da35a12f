use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::config::{AppConfig, ModelConfig};
use strand_core::event::EventBus;
use strand_core::traits::{Agent, LlmClient};
use strand_core::types::{AgentEvent, GraphEvent};
use strand_graph::{GraphDefinition, HandoffContext, RunLogger, RunOptions};
use strand_llm::{LlmAgent, ProviderRegistry, ReplayClient};

#[derive(Parser)]
#[command(name = "strand", version, about = "Typed agent orchestration graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a graph file and the models its agents resolve to
    Check {
        graph: PathBuf,
    },
    /// Print the nodes and transitions of a graph file
    Describe {
        graph: PathBuf,
    },
    /// Run a graph file
    Run {
        graph: PathBuf,
        /// Initial handoff data, repeatable: --input topic=rust
        #[arg(short, long = "input", value_parser = parse_key_val)]
        inputs: Vec<(String, String)>,
        /// Answer every agent from a replay file instead of a provider
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Print the step trace (JSONL) to stderr when the run ends
        #[arg(long)]
        trace: bool,
    },
    /// Show current configuration
    Config,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", s))?;
    if key.is_empty() {
        return Err(format!("empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Describe { graph } => {
            let def = load_definition(&graph)?;
            print!("{}", def.build()?.describe());
        }
        Commands::Check { graph } => check(&config, &graph)?,
        Commands::Run {
            graph,
            inputs,
            replay,
            trace,
        } => run(&config, &graph, inputs, replay.as_deref(), trace).await?,
    }

    Ok(())
}

fn load_definition(path: &Path) -> anyhow::Result<GraphDefinition> {
    GraphDefinition::load(path).with_context(|| format!("loading graph {}", path.display()))
}

/// Model an agent runs on: its own `[agents.<name>.model]`, else `[model]`.
fn resolve_model<'a>(
    config: &'a AppConfig,
    def: &'a GraphDefinition,
    agent: &str,
) -> Option<&'a ModelConfig> {
    def.agents
        .get(agent)
        .and_then(|a| a.model.as_ref())
        .or(config.model.as_ref())
}

fn check(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    let def = load_definition(path)?;
    let graph = def.build_with(&config.repair, &config.fan_out)?;
    let registry = ProviderRegistry::with_builtins();

    let mut problems = 0;
    for agent in def.agent_names() {
        match resolve_model(config, &def, agent) {
            Some(model) => {
                if let Err(e) = registry.create_client(model) {
                    warn!(agent, provider = %model.provider, error = %e, "Agent model unavailable");
                    problems += 1;
                }
            }
            None => {
                warn!(agent, "No model configured for agent");
                problems += 1;
            }
        }
    }

    println!(
        "{}: {} nodes, {} edges, entry '{}'",
        def.name.as_deref().unwrap_or("graph"),
        graph.len(),
        def.edges.len(),
        def.entry
    );
    if problems > 0 {
        bail!("{} agent(s) cannot be constructed", problems);
    }
    println!("ok");
    Ok(())
}

fn build_agents(
    config: &AppConfig,
    def: &GraphDefinition,
    replay: Option<&Path>,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<Arc<dyn Agent>>> {
    let shared_replay = match replay {
        Some(path) => {
            let client: Arc<dyn LlmClient> = Arc::new(ReplayClient::from_file(path)?);
            Some(client)
        }
        None => None,
    };
    let registry = ProviderRegistry::with_builtins();

    let mut agents: Vec<Arc<dyn Agent>> = Vec::new();
    for name in def.agent_names() {
        let mut agent = match shared_replay {
            Some(ref client) => {
                LlmAgent::new(name, client.clone(), ModelConfig::new("replay", "replay"))
            }
            None => {
                let model = resolve_model(config, def, name)
                    .with_context(|| format!("no model configured for agent '{}'", name))?;
                let client = registry
                    .create_with_fallbacks(model, &config.fallback_models, config.retry.clone())?
                    .with_cancel(cancel.clone());
                let client: Arc<dyn LlmClient> = Arc::new(client);
                LlmAgent::new(name, client, model.clone())
            }
        };
        if let Some(instructions) = def.agents.get(name).and_then(|a| a.instructions.clone()) {
            agent = agent.with_instructions(instructions);
        }
        agents.push(Arc::new(agent));
    }
    Ok(agents)
}

fn print_event(event: &GraphEvent) {
    match event {
        GraphEvent::NodeStarted { node, .. } => eprintln!("\n[{}]", node),
        GraphEvent::TransitionTaken { from, to, label, .. } => match label {
            Some(label) => eprintln!("\n{} -> {} ({})", from, to, label),
            None => eprintln!("\n{} -> {}", from, to),
        },
        GraphEvent::NodeFailed { node, error, .. } => eprintln!("\n[{}] failed: {}", node, error),
        GraphEvent::Agent {
            event: AgentEvent::TextDelta { text },
            ..
        } => {
            eprint!("{}", text);
            std::io::stderr().flush().ok();
        }
        GraphEvent::Agent {
            event: AgentEvent::ToolStart { name },
            ..
        } => eprintln!("\n  [tool: {}]", name),
        _ => {}
    }
}

async fn run(
    config: &AppConfig,
    path: &Path,
    inputs: Vec<(String, String)>,
    replay: Option<&Path>,
    trace: bool,
) -> anyhow::Result<()> {
    let def = load_definition(path)?;
    let graph = def.build_with(&config.repair, &config.fan_out)?;
    let cancel = CancellationToken::new();
    let agents = build_agents(config, &def, replay, &cancel)?;

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let bus = Arc::new(EventBus::new(config.graph.event_capacity));
    let logger = RunLogger::from_config(config)
        .map(|logger| tokio::spawn(logger.run(bus.subscribe(), CancellationToken::new())));

    let mut options = RunOptions::from_config(&config.graph)
        .with_cancel(cancel)
        .with_events(bus.clone())
        .on_event(print_event);
    if trace {
        options = options.with_trace(true);
    }
    for agent in agents {
        options = options.with_agent(agent);
    }

    let input = HandoffContext::from_pairs(inputs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let outcome = graph.run(input, options).await;
    eprintln!();

    if let Some(handle) = logger {
        if let Ok(Some(log_path)) = handle.await {
            info!(path = %log_path.display(), "Run log written");
        }
    }

    if let Some(ref steps) = outcome.trace {
        eprintln!("{}", steps.to_jsonl());
    }
    if let Some(handoff) = outcome.output_ref::<HandoffContext>() {
        println!("{}", serde_json::to_string_pretty(handoff)?);
    }

    info!(
        run_id = %outcome.run_id,
        state = %outcome.state,
        node = outcome.node.as_deref().unwrap_or("-"),
        invocations = outcome.invocations,
        elapsed_ms = outcome.elapsed_ms,
        "Run finished"
    );

    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
