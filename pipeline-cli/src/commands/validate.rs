use crate::{loader, output};

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{DocumentValidator, ExecutionGraph, StructuralValidator};

/// Validate a pipeline document
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the Pipeline or PipelineRun document (YAML or JSON)
    pub pipeline: PathBuf,

    /// Engine config file (YAML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the execution plan as parallel levels
    #[arg(long)]
    pub plan: bool,
}

pub fn execute(args: ValidateArgs) -> Result<i32> {
    let config = loader::load_config(args.config.as_deref())?;
    output::status("Validating", &format!("{}", args.pipeline.display()));

    let mut document = match loader::load_document(&args.pipeline) {
        Ok(document) => document,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            return Ok(1);
        }
    };
    output::check("Document syntax valid");

    let outcome = StructuralValidator::new(config.clone()).validate(&document);
    if !outcome.is_valid() {
        output::error(&format!("{} validation error(s):", outcome.errors.len()));
        for error in &outcome.errors {
            output::error(&format!("  - [{}] {}", error.path, error.message));
        }
        return Ok(outcome.exit_code());
    }

    let graph = document.graph();
    output::check(&format!(
        "Structure: {} tasks, {} finally tasks",
        graph.tasks.len(),
        graph.finally.len()
    ));

    if args.plan {
        let resolved = ExecutionGraph::resolve(graph, &config)?;
        println!();
        for (level, vertices) in resolved.parallel_levels().iter().enumerate() {
            let names: Vec<&str> = vertices.iter().map(|v| v.name()).collect();
            println!("  [{}] {}", level + 1, names.join(", "));
        }
        println!();
    }

    let name = document.ensure_name().unwrap_or("pipeline").to_string();
    output::success(&format!("'{}' is valid", name));
    Ok(outcome.exit_code())
}
