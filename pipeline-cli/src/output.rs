// Output formatting helpers for CLI commands

use pipeline_engine::{ExecutionEvent, ExecutionStatus, RunReport, Wave};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim success message
pub fn dim_success(message: &str) {
    eprintln!("\x1b[32m{}\x1b[0m", message);
}

/// Print a dim failure message
pub fn dim_failure(message: &str) {
    eprintln!("\x1b[31m{}\x1b[0m", message);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Render one progress event
pub fn event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            run_name,
            total_tasks,
            ..
        } => {
            header(&format!("Run '{}' ({} tasks)", run_name, total_tasks));
        }
        ExecutionEvent::FinallyStarted { total_tasks } => {
            header(&format!("Finally ({} tasks)", total_tasks));
        }
        ExecutionEvent::TaskStarted {
            instance, attempt, ..
        } => {
            if *attempt > 1 {
                println!("    {} (attempt {})", instance, attempt);
            } else {
                println!("    {}", instance);
            }
        }
        ExecutionEvent::TaskRetrying {
            instance,
            attempt,
            message,
            ..
        } => {
            let detail = message.as_deref().unwrap_or("failed");
            warning(&format!(
                "  {} retrying as attempt {}: {}",
                instance, attempt, detail
            ));
        }
        ExecutionEvent::TaskCompleted {
            task,
            wave,
            status,
            duration,
            ..
        } => {
            let label = match wave {
                Wave::Main => "Task",
                Wave::Finally => "Finally task",
            };
            let line = format!(
                "  {} '{}' {} ({:.2}s)",
                label,
                task,
                status,
                duration.as_secs_f64()
            );
            if *status == ExecutionStatus::Succeeded {
                dim_success(&line);
            } else {
                dim_failure(&line);
            }
        }
        ExecutionEvent::TaskSkipped {
            task,
            status,
            reason,
        } => {
            warning(&format!("  Task '{}' {}: {}", task, status, reason));
        }
        ExecutionEvent::RunCompleted {
            status,
            reason,
            duration,
            ..
        } => {
            println!();
            let line = format!(
                "Run finished {} ({}) in {:.2}s",
                status,
                reason,
                duration.as_secs_f64()
            );
            if matches!(status, pipeline_engine::RunStatus::Failed) {
                failure(&line);
            } else {
                success(&line);
            }
        }
    }
}

/// Human summary of a finished run
pub fn report(report: &RunReport) {
    println!();
    println!("{:<24} {:<10} {:<18} {}", "TASK", "WAVE", "STATUS", "REASON");
    for task in &report.tasks {
        println!(
            "{:<24} {:<10} {:<18} {}",
            task.name,
            task.wave.to_string(),
            task.status.to_string(),
            task.reason.as_deref().unwrap_or("-")
        );
        for instance in &task.instances {
            println!(
                "  {:<22} {:<10} {:<18} {}",
                instance.name,
                "",
                instance.status.to_string(),
                instance.reason.as_deref().unwrap_or("-")
            );
        }
    }
    if !report.results.is_empty() {
        println!();
        println!("Results:");
        for (name, value) in &report.results {
            println!("  {} = {}", name, value.render());
        }
    }
}
