//! Pipeline command handlers

use crate::cli::manifest::PipelineManifest;
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use steprail_core::models::Configuration;
use steprail_core::workflow::{parse_status, Pipeline, RunOutcome, SnapshotStore};
use tokio::signal;

/// How often the run loop looks for newly opened gates
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Operator reply to a gate prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAnswer {
    Approve,
    Reject(String),
}

/// `y`/`yes` approves; anything else rejects, using the text as the reason
pub fn parse_gate_answer(input: &str) -> GateAnswer {
    let answer = input.trim();
    match answer.to_ascii_lowercase().as_str() {
        "y" | "yes" => GateAnswer::Approve,
        "" | "n" | "no" => GateAnswer::Reject("rejected by operator".to_string()),
        _ => GateAnswer::Reject(answer.to_string()),
    }
}

fn open_store(config: &Configuration) -> Result<Arc<SnapshotStore>> {
    let path = config.snapshot_store_path();
    let store = SnapshotStore::new(&path)
        .with_context(|| format!("Failed to open snapshot store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn load_manifest(path: &Path) -> Result<PipelineManifest> {
    let manifest = PipelineManifest::load(path)?;
    let validation = manifest.validate();
    for warning in &validation.warnings {
        tracing::warn!(manifest = %path.display(), "{}", warning);
    }
    if !validation.is_valid() {
        for error in &validation.errors {
            eprintln!("  ✗ {}: {}", error.field, error.message);
        }
        return Err(anyhow::anyhow!("Manifest validation failed: {}", path.display()));
    }
    Ok(manifest)
}

fn build_pipeline(manifest: &PipelineManifest, config: &Configuration) -> Result<Pipeline> {
    Pipeline::new(manifest.step_definitions())
        .context("Failed to build pipeline")?
        .with_options(config.pipeline_options())
        .context("Invalid retry settings in configuration")
}

/// JSON view of a parsed status
pub fn status_report(status: &str) -> serde_json::Value {
    let parsed = parse_status(status);
    serde_json::json!({
        "phase": parsed.phase.as_str(),
        "step": parsed.step,
        "terminal": parsed.phase.is_terminal(),
        "awaiting_approval": parsed.awaiting_approval(),
    })
}

/// Handle status command
pub fn handle_status(status: String, json: bool) -> Result<()> {
    let parsed = parse_status(&status);

    if json {
        println!("{}", serde_json::to_string_pretty(&status_report(&status))?);
    } else {
        println!("Phase:     {}", parsed.phase);
        println!("Step:      {}", parsed.step.as_deref().unwrap_or("-"));
        println!("Terminal:  {}", parsed.phase.is_terminal());
        if let Some(step) = parsed.awaiting_approval() {
            println!("Awaiting approval for '{}'", step);
        }
    }
    Ok(())
}

/// Handle validate command
pub fn handle_validate(manifest_path: &Path, json: bool) -> Result<()> {
    let manifest = PipelineManifest::load(manifest_path)?;
    let validation = manifest.validate();

    if json {
        let output = serde_json::json!({
            "valid": validation.is_valid(),
            "errors": validation.errors.iter().map(|e| serde_json::json!({
                "field": e.field,
                "message": e.message,
            })).collect::<Vec<_>>(),
            "warnings": validation.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Validating pipeline: {}", manifest.name);
        println!("File: {}", manifest_path.display());
        println!();

        if validation.is_valid() {
            println!("✓ Pipeline is valid");
            println!();
            println!("Steps:");
            for (index, step) in manifest.steps.iter().enumerate() {
                let gate = if step.gate { " [gate]" } else { "" };
                println!("  {}. {}{}", index + 1, step.name, gate);
            }
        } else {
            println!("✗ Pipeline validation failed");
            println!();
            println!("Errors:");
            for error in &validation.errors {
                println!("  ✗ {}: {}", error.field, error.message);
            }
        }

        if !validation.warnings.is_empty() {
            println!();
            println!("Warnings:");
            for warning in &validation.warnings {
                println!("  ⚠  {}", warning);
            }
        }
    }

    if !validation.is_valid() {
        return Err(anyhow::anyhow!("Pipeline validation failed"));
    }
    Ok(())
}

/// Handle run command
pub async fn handle_run(
    config: &Configuration,
    manifest_path: &Path,
    run_id: Option<String>,
    auto_approve: bool,
) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let store = open_store(config)?;
    let pipeline = build_pipeline(&manifest, config)?;
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if store.load(&run_id).is_some() {
        return Err(anyhow::anyhow!(
            "Run '{}' already exists. Use 'steprail resume {} {}' to continue it.",
            run_id,
            run_id,
            manifest_path.display()
        ));
    }

    println!("▶ Running pipeline '{}' ({} steps)", manifest.name, manifest.steps.len());
    println!("   Run ID: {}", run_id);

    let outcome = drive(pipeline, &store, &run_id, &manifest.name, auto_approve).await?;
    report_outcome(&run_id, &outcome)
}

/// Handle resume command
pub async fn handle_resume(
    config: &Configuration,
    run_id: &str,
    manifest_path: &Path,
    auto_approve: bool,
) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let store = open_store(config)?;
    let stored = store
        .load(run_id)
        .ok_or_else(|| anyhow::anyhow!("Run '{}' not found", run_id))?;

    if stored.label != manifest.name {
        tracing::warn!(
            run_id,
            stored = stored.label.as_str(),
            manifest = manifest.name.as_str(),
            "Manifest name differs from the one the run was started with"
        );
    }

    let pipeline = build_pipeline(&manifest, config)?;
    pipeline
        .resume_from(stored.snapshot)
        .context("Stored snapshot does not match the manifest")?;

    println!(
        "▶ Resuming pipeline '{}' at step {} of {} (status {})",
        manifest.name,
        pipeline.current_step_index() + 1,
        manifest.steps.len(),
        pipeline.status()
    );

    let outcome = drive(pipeline, &store, run_id, &manifest.name, auto_approve).await?;
    report_outcome(run_id, &outcome)
}

/// Run to a terminal status, answering gates and checkpointing as it goes
async fn drive(
    pipeline: Pipeline,
    store: &Arc<SnapshotStore>,
    run_id: &str,
    label: &str,
    auto_approve: bool,
) -> Result<RunOutcome> {
    let pipeline = Arc::new(pipeline.on_step_complete(store.checkpoint_hook(run_id, label)));
    let listener = pipeline.subscribe(|event| {
        println!("   {} → {}", event.from, event.to);
        Ok(())
    });
    store.save(run_id, label, &pipeline.snapshot())?;

    let runner = pipeline.clone();
    let mut run = tokio::spawn(async move { runner.run().await });
    let mut ticker = tokio::time::interval(GATE_POLL_INTERVAL);
    let mut prompted: Option<String> = None;
    let mut prompts = Vec::new();

    let outcome = loop {
        tokio::select! {
            joined = &mut run => {
                break joined.context("Pipeline task panicked")??;
            }
            _ = signal::ctrl_c() => {
                println!();
                println!("⚠️  Cancelling run (Ctrl+C)");
                pipeline.cancel("cancelled by operator (Ctrl+C)")?;
            }
            _ = ticker.tick() => {
                let Some(gate) = pipeline.pending_gates().into_iter().next() else {
                    continue;
                };
                if prompted.as_deref() == Some(gate.step_name.as_str()) {
                    continue;
                }
                prompted = Some(gate.step_name.clone());
                // Checkpoint at the gate so a restart lands back here
                store.save(run_id, label, &pipeline.snapshot())?;

                if auto_approve {
                    println!("   ✓ Auto-approving '{}'", gate.step_name);
                    pipeline.approve(&gate.step_name)?;
                } else {
                    prompts.push(tokio::spawn(prompt_gate(pipeline.clone(), gate.step_name)));
                }
            }
        }
    };

    for prompt in prompts {
        prompt.abort();
    }
    pipeline.unsubscribe(listener);
    store.save(run_id, label, &pipeline.snapshot())?;
    Ok(outcome)
}

async fn prompt_gate(pipeline: Arc<Pipeline>, step_name: String) {
    print!("   ? Approve step '{}'? [y/N or rejection reason]: ", step_name);
    let _ = io::stdout().flush();

    let answer = match read_user_input().await {
        Ok(line) => parse_gate_answer(&line),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read gate answer");
            return;
        }
    };

    let resolved = match answer {
        GateAnswer::Approve => pipeline.approve(&step_name),
        GateAnswer::Reject(reason) => pipeline.reject(&step_name, reason),
    };
    if let Err(e) = resolved {
        // The run moved on (cancelled) while the prompt was open
        tracing::warn!(step = step_name.as_str(), error = %e, "Gate answer ignored");
    }
}

/// Read user input from stdin
async fn read_user_input() -> Result<String> {
    read_line_detached(|| {
        let mut buffer = String::new();
        io::stdin().read_line(&mut buffer)?;
        Ok(buffer)
    })
    .await
}

/// Run a blocking line read on its own thread
///
/// The runtime does not wait for this thread at shutdown, so a prompt
/// nobody answered cannot keep the process alive once the run has ended.
async fn read_line_detached<F>(read: F) -> Result<String>
where
    F: FnOnce() -> io::Result<String> + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("gate-prompt".to_string())
        .spawn(move || {
            let _ = tx.send(read());
        })
        .context("Failed to start stdin reader")?;

    rx.await
        .context("stdin reader stopped")?
        .context("Failed to read from stdin")
}

fn report_outcome(run_id: &str, outcome: &RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed => {
            println!("✅ Pipeline completed");
            Ok(())
        }
        RunOutcome::Failed { step, error } => {
            println!(
                "❌ Pipeline failed at step '{}'",
                step.as_deref().unwrap_or("-")
            );
            println!("   {}", error);
            println!("   Inspect with: steprail inspect {}", run_id);
            Err(anyhow::anyhow!("Pipeline failed: {}", error))
        }
        RunOutcome::Cancelled { reason } => {
            println!("⚠️  Pipeline cancelled: {}", reason);
            Err(anyhow::anyhow!("Pipeline cancelled: {}", reason))
        }
    }
}

/// Handle inspect command
pub fn handle_inspect(config: &Configuration, run_id: &str, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stored = store
        .load(run_id)
        .ok_or_else(|| anyhow::anyhow!("Run '{}' not found", run_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stored)?);
        return Ok(());
    }

    let snapshot = &stored.snapshot;
    println!("Pipeline Run");
    println!("============");
    println!("Run ID:      {}", stored.run_id);
    println!("Pipeline:    {}", stored.label);
    println!("Status:      {}", snapshot.status());
    println!(
        "Saved At:    {}",
        stored.saved_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "Next Step:   {} of {}",
        snapshot.current_step_index + 1,
        snapshot.step_states.len()
    );

    println!();
    println!("Steps:");
    println!("------");
    for record in &snapshot.step_states {
        println!(
            "  {:<24} {:<10} attempts={}",
            record.name,
            format!("{:?}", record.state).to_lowercase(),
            record.attempts
        );
    }

    let history = &snapshot.workflow_snapshot.history;
    if !history.is_empty() {
        println!();
        println!("Transitions:");
        println!("------------");
        for event in history {
            print!(
                "  {} -> {} ({:?}) at {}",
                event.from,
                event.to,
                event.cause,
                event.timestamp.format("%H:%M:%S")
            );
            match &event.detail {
                Some(detail) => println!(": {}", detail),
                None => println!(),
            }
        }
    }

    Ok(())
}

/// Handle list command
pub fn handle_list(config: &Configuration, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let runs = store.list();

    if json {
        let output: Vec<_> = runs
            .iter()
            .map(|run| {
                serde_json::json!({
                    "run_id": run.run_id,
                    "pipeline": run.label,
                    "status": run.status(),
                    "saved_at": run.saved_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No stored runs in {}", store.path().display());
        return Ok(());
    }

    println!("{:<38} {:<20} {:<24} SAVED", "RUN ID", "PIPELINE", "STATUS");
    for run in runs {
        println!(
            "{:<38} {:<20} {:<24} {}",
            run.run_id,
            run.label,
            run.status(),
            run.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Handle forget command
pub fn handle_forget(config: &Configuration, run_id: &str) -> Result<()> {
    let store = open_store(config)?;
    if !store.remove(run_id)? {
        return Err(anyhow::anyhow!("Run '{}' not found", run_id));
    }
    println!("🗑  Removed run '{}'", run_id);
    Ok(())
}
