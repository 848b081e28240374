use crate::{loader, output};

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use color_eyre::eyre::bail;
use color_eyre::Result;
use tracing::debug;

use pipeline_engine::testing::ScriptedExecutor;
use pipeline_engine::{
    progress_channel, CancelHandle, DocumentValidator, PipelineEngine, StructuralValidator,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
    Yaml,
}

/// Run a pipeline document against scripted task outcomes
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Path to the Pipeline or PipelineRun document (YAML or JSON)
    pub pipeline: PathBuf,

    /// Task scripts (YAML map of task or instance name to attempt steps)
    #[arg(long, short = 's', value_name = "FILE")]
    pub script: Option<PathBuf>,

    /// Set a parameter (can be repeated, format: name=value)
    #[arg(long = "param", short = 'p', value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Engine config file (YAML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Report format
    #[arg(long, short = 'o', value_enum, default_value = "text")]
    pub output: ReportFormat,
}

pub async fn execute(args: SimulateArgs) -> Result<i32> {
    let config = loader::load_config(args.config.as_deref())?;
    let scripts = loader::load_scripts(args.script.as_deref())?;
    let params = loader::parse_params(&args.params)?;
    debug!(scripts = scripts.len(), params = params.len(), "simulation inputs loaded");

    let mut document = loader::load_document(&args.pipeline)?;
    let outcome = StructuralValidator::new(config.clone()).validate(&document);
    if !outcome.is_valid() {
        output::error(&outcome.message());
        return Ok(outcome.exit_code());
    }
    document.ensure_name();

    let mut options = document.run_options();
    options.params.extend(params);

    let executor = ScriptedExecutor::from_scripts(scripts);
    let (tx, mut rx) = progress_channel();
    let engine = match PipelineEngine::new(document.graph(), config) {
        Ok(engine) => engine.with_executor(Arc::new(executor)).with_progress(tx),
        Err(e) => bail!("Failed to build execution graph: {}", e),
    };

    let cancel = CancelHandle::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run_with_cancel(options, cancel).await })
    };

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::info("Interrupted, cancelling run (finally tasks still run)");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel_hard();
            }
        })
    };

    let text = args.output == ReportFormat::Text;
    while let Some(event) = rx.recv().await {
        if text {
            output::event(&event);
        }
    }
    interrupt.abort();

    let report = match run.await? {
        Ok(report) => report,
        Err(e) => {
            output::error(&e.to_string());
            return Ok(1);
        }
    };

    match args.output {
        ReportFormat::Text => output::report(&report),
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        ReportFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
    }

    Ok(if report.is_success() { 0 } else { 1 })
}
