//! Redloop CLI
//!
//! Runs one penetration-testing loop against the goal given on the command
//! line. Model endpoint, credential, and the preset sandbox id come from
//! the environment and are passed into the engine as opaque values.

use std::path::PathBuf;
use std::sync::Arc;

use redloop::{
    CoordinatorAgent, DockerCliBackend, ExecutorAgent, FindingExtractor, HttpModelClient,
    ModelConfig, PlannerAgent, RunConfig, RunOutcome, ToolLayer, Validate,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn build_config() -> Result<RunConfig, String> {
    let mut config = match std::env::var("REDLOOP_CONFIG") {
        Ok(path) => RunConfig::from_toml_file(&PathBuf::from(path)).map_err(|e| e.to_string())?,
        Err(_) => {
            let model = ModelConfig::new(
                env_or("REDLOOP_MODEL_ENDPOINT", "https://api.deepseek.com"),
                env_or("REDLOOP_MODEL", "deepseek-chat"),
            );
            RunConfig::new(model)
        }
    };

    if let Ok(key) = std::env::var("REDLOOP_API_KEY") {
        config.model.api_key = key;
    }
    if let Ok(sandbox_id) = std::env::var("REDLOOP_SANDBOX_ID") {
        config.preset_sandbox = Some(sandbox_id);
    }
    if let Ok(network) = std::env::var("REDLOOP_SANDBOX_NETWORK") {
        config.sandbox_network = Some(network);
    }

    let validation = config.validate();
    for warning in &validation.warnings {
        tracing::warn!(warning = %warning, "configuration warning");
    }
    if !validation.is_valid() {
        return Err(validation.errors.join("; "));
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <goal>", args[0]);
        eprintln!("\nDrives an exploratory penetration test toward the goal.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  REDLOOP_MODEL_ENDPOINT   OpenAI-compatible endpoint");
        eprintln!("  REDLOOP_MODEL            model name");
        eprintln!("  REDLOOP_API_KEY          credential");
        eprintln!("  REDLOOP_SANDBOX_ID       preset sandbox container id");
        eprintln!("  REDLOOP_SANDBOX_NETWORK  network for new sandboxes");
        eprintln!("  REDLOOP_CONFIG           TOML config file overriding the above");
        std::process::exit(2);
    }
    let goal = args[1..].join(" ");

    let config = match build_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let model = match HttpModelClient::new(config.model.clone()) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            eprintln!("failed to build model client: {e}");
            std::process::exit(2);
        }
    };

    let backend = Arc::new(DockerCliBackend::new(
        config.sandbox_image.clone(),
        config.sandbox_network.clone(),
    ));
    let tools = match ToolLayer::new(backend, &config) {
        Ok(tools) => Arc::new(tools),
        Err(e) => {
            eprintln!("failed to build tool layer: {e}");
            std::process::exit(2);
        }
    };

    let planner = PlannerAgent::new(model.clone());
    let executor = ExecutorAgent::new(model.clone(), tools.clone(), config.max_tool_calls);
    let extractor = FindingExtractor::new(model);

    let coordinator =
        CoordinatorAgent::new(goal.as_str(), planner, executor, extractor, tools, config);

    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    tracing::info!(goal = %goal, "starting run");
    let report = coordinator.run().await;

    println!("\n{}", "=".repeat(60));
    println!("Run Complete: {:?}", report.outcome);
    println!("{}", "=".repeat(60));
    println!();
    println!("Summary: {}", report.summary);
    println!("Steps: {}", report.steps);

    if report.findings.is_empty() {
        println!("\nNo findings.");
    } else {
        println!("\nFindings ({}):", report.findings.len());
        for finding in &report.findings {
            println!(
                "  [{}] {}: {}",
                finding.severity.label(),
                finding.category,
                finding.evidence
            );
        }
    }

    let code = match report.outcome {
        RunOutcome::GoalAchieved | RunOutcome::Exhausted => 0,
        RunOutcome::PlanningFailed => 1,
        RunOutcome::Aborted => 130,
    };
    std::process::exit(code);
}
