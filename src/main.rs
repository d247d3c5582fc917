use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use reqflow::catalog::RequestCatalog;
use reqflow::config::Config;
use reqflow::flows::events::{RunEvent, RunEventType};
use reqflow::flows::graph::{self, FlowGraph};
use reqflow::flows::history::{FlowRunResult, NodeStatus, RunStatus};
use reqflow::flows::runner::{FlowExecutor, RunOptions};
use reqflow::flows::sink::InMemoryRunStates;
use reqflow::http::ReqwestExecutor;
use reqflow::workspace::{self, Workspace};

#[derive(Parser)]
#[command(name = "reqflow", about = "Run flows of dependent HTTP requests")]
struct Cli {
    /// Workspace file (JSON, or YAML by extension). Defaults to REQFLOW_WORKSPACE.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List flows in the workspace
    List,
    /// Check a flow for structural problems
    Validate {
        #[arg(long)]
        flow: String,
    },
    /// Run a flow
    Run {
        #[arg(long)]
        flow: String,
        /// Environment id, overrides the flow default
        #[arg(long)]
        env: Option<String>,
        /// Auth profile id, overrides the flow default
        #[arg(long)]
        auth: Option<String>,
        /// Keep at most one request in flight
        #[arg(long)]
        sequential: bool,
        /// Write the final run result as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reqflow=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(false).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            enable_logs: true,
            ..Default::default()
        },
    ));

    let path = cli.workspace.clone().unwrap_or_else(|| config.workspace.clone());
    let workspace = Workspace::load(&path)?;

    match cli.command {
        Command::List => {
            list_flows(&workspace);
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { flow } => validate(&workspace, &flow),
        Command::Run {
            flow,
            env,
            auth,
            sequential,
            output,
        } => {
            let options = RunOptions {
                environment_id: env,
                default_auth_id: auth,
                parallel: !sequential,
            };
            run(&config, workspace, &flow, options, output).await
        }
    }
}

fn list_flows(workspace: &Workspace) {
    if workspace.flows.is_empty() {
        println!("No flows defined");
        return;
    }
    for flow in &workspace.flows {
        println!(
            "{}\t{}\t{} nodes, {} connectors",
            flow.id,
            flow.name,
            flow.nodes.len(),
            flow.connectors.len()
        );
    }
}

fn validate(workspace: &Workspace, flow_id: &str) -> Result<ExitCode> {
    let flow = workspace.flow(flow_id)?;
    let mut problems = graph::validate_flow(flow);
    for node in &flow.nodes {
        if workspace.lookup(&node.request_id).is_none() {
            problems.push(format!("node {} references unknown request {}", node.id, node.request_id));
        }
    }

    let order = FlowGraph::new(flow).topological_order();
    if order.is_none() {
        problems.push("flow contains a cycle".to_string());
    }

    if !problems.is_empty() {
        for problem in &problems {
            println!("✗ {problem}");
        }
        return Ok(ExitCode::FAILURE);
    }

    let aliases: Vec<&str> = order.unwrap_or_default().iter().map(|n| n.alias.as_str()).collect();
    println!("✓ {} is valid", flow.name);
    println!("  order: {}", aliases.join(" → "));
    Ok(ExitCode::SUCCESS)
}

async fn run(
    config: &Config,
    workspace: Workspace,
    flow_id: &str,
    options: RunOptions,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let workspace = Arc::new(workspace);
    let flow = workspace.flow(flow_id)?.clone();
    let http = Arc::new(ReqwestExecutor::from_config(config).context("failed to build HTTP client")?);

    let (events_tx, mut events_rx) = broadcast::channel::<RunEvent>(256);
    let executor = FlowExecutor::new(http, workspace.clone(), workspace)
        .with_sink(Arc::new(InMemoryRunStates::new()))
        .with_events(events_tx);

    let printer = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let run = {
        let running = executor.run_flow(&flow, options);
        tokio::pin!(running);
        let mut cancelling = false;
        loop {
            tokio::select! {
                run = &mut running => break run,
                signal = tokio::signal::ctrl_c(), if !cancelling => {
                    if let Err(e) = signal {
                        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                    }
                    cancelling = true;
                    eprintln!("Cancelling, waiting for in-flight requests...");
                    executor.cancel_flow();
                }
            }
        }
    };

    // Dropping the executor closes the event channel.
    drop(executor);
    let _ = printer.await;

    print_summary(&run);

    if let Some(path) = output {
        let path = workspace::save_run(&path, &run)?;
        println!("Run written to {}", path.display());
    }

    Ok(if run.status == RunStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_event(event: &RunEvent) {
    let node = event.node_id.as_deref().unwrap_or("-");
    let marker = match event.event_type {
        RunEventType::NodeCompleted | RunEventType::RunCompleted => "✓",
        RunEventType::NodeFailed | RunEventType::RunFailed => "✗",
        RunEventType::NodeSkipped => "⊘",
        RunEventType::RunCancelled => "■",
        RunEventType::RunStarted | RunEventType::NodeStarted => "▶",
    };
    println!("{marker} [{}] {node}: {}", event.event_type.as_str(), event.message);
}

fn print_summary(run: &FlowRunResult) {
    let p = &run.progress;
    println!();
    println!(
        "Run {} {:?}: {}/{} completed ({} succeeded, {} failed, {} skipped)",
        run.run_id, run.status, p.completed, p.total, p.succeeded, p.failed, p.skipped
    );
    for result in run.node_results.values() {
        let detail = match (&result.status, &result.response, &result.error) {
            (_, _, Some(error)) => error.clone(),
            (NodeStatus::Success, Some(response), None) => {
                format!("HTTP {} in {}ms", response.status, response.elapsed_ms)
            }
            _ => String::new(),
        };
        println!("  {:<20} {:<8} {detail}", result.alias, format!("{:?}", result.status).to_lowercase());
    }
    if let Some(error) = &run.error {
        println!("{error}");
    }
}
