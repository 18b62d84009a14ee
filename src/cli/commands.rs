//! Command implementations.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Settings;
use crate::intake::Normalizer;
use crate::maintenance::MaintenanceTasks;
use crate::orchestrator::{events::ProgressEvent, OrchestratorRuntime};
use crate::repository::BatchRepository;
use crate::server;

/// Initialize the data directory and database.
pub fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    BatchRepository::new(&settings.database_path())?;
    println!(
        "{} Initialized data directory at {}",
        style("✓").green(),
        settings.data_dir.display()
    );
    println!("  intake:         {}", settings.intake_dir().display());
    println!("  processed:      {}", settings.processed_dir().display());
    println!(
        "  filing cabinet: {}",
        settings.filing_cabinet_dir().display()
    );
    Ok(())
}

/// Run smart processing over the intake directory with terminal progress.
pub async fn cmd_scan(settings: Settings) -> anyhow::Result<()> {
    let runtime = OrchestratorRuntime::new(settings)?;
    let swept = MaintenanceTasks::startup_sweep(runtime.batches());
    if swept > 0 {
        println!(
            "{} Removed {} orphaned batches from a previous run",
            style("→").cyan(),
            swept
        );
    }

    let (token, cancel) = runtime.tokens().create();
    let subscription = runtime
        .tokens()
        .subscribe(&token)
        .ok_or_else(|| anyhow::anyhow!("token vanished before the run started"))?;

    let run = tokio::spawn(runtime.clone().run(token.clone(), cancel));

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut receiver = subscription.receiver;
    loop {
        let event = tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n{} Cancelling...", style("→").cyan());
                runtime.cancel(&token);
                continue;
            }
        };

        match event {
            ProgressEvent::Progress(e) => {
                bar.set_length(e.total.max(1));
                bar.set_position(e.current);
                bar.set_message(format!("{}: {}", e.phase.as_str(), e.message));
            }
            ProgressEvent::Terminal(e) => {
                bar.finish_and_clear();
                println!(
                    "{} {} ({} processed, {} failed)",
                    style("✓").green(),
                    e.message,
                    e.processed,
                    e.failed
                );
                if let Some(id) = e.single_batch_id {
                    println!("  single-document batch: {}", id);
                }
                if let Some(id) = e.grouped_batch_id {
                    println!("  grouped batch: {}", id);
                }
                for error in &e.errors {
                    println!("  {} {}", style("✗").red(), error);
                }
                break;
            }
        }
    }

    let _ = run.await;
    Ok(())
}

/// Start the web server with background maintenance.
pub async fn cmd_serve(settings: Settings, bind: &str) -> anyhow::Result<()> {
    let (host, port) = parse_bind_address(bind)?;
    let runtime = OrchestratorRuntime::new(settings)?;

    let swept = MaintenanceTasks::startup_sweep(runtime.batches());
    if swept > 0 {
        tracing::info!("startup sweep removed {} orphaned batches", swept);
    }
    let maintenance = MaintenanceTasks::spawn(
        runtime.settings(),
        runtime.normalizer().clone(),
        runtime.tokens().clone(),
    );

    println!(
        "{} Starting docuflow server at http://{}:{}",
        style("→").cyan(),
        host,
        port
    );
    println!("  Press Ctrl+C to stop");

    let result = server::serve(runtime, &host, port).await;
    maintenance.shutdown();
    result
}

/// Export one batch into the filing cabinet.
pub async fn cmd_export(settings: Settings, batch_id: i64) -> anyhow::Result<()> {
    let runtime = OrchestratorRuntime::new(settings)?;
    let report = runtime.exporter().export_batch(batch_id).await?;

    println!(
        "{} Exported batch {}: {} written, {} already present",
        style("✓").green(),
        report.batch_id,
        report.written.len(),
        report.skipped
    );
    for path in &report.written {
        println!("  {}", path.display());
    }
    for warning in &report.warnings {
        println!("  {} {}", style("!").yellow(), warning);
    }
    Ok(())
}

/// Print batch and cache status.
pub fn cmd_status(settings: Settings) -> anyhow::Result<()> {
    settings.ensure_directories()?;
    let batches = BatchRepository::new(&settings.database_path())?;
    let docs = crate::repository::DocumentRepository::new(&settings.database_path())?;

    let all = batches.list()?;
    if all.is_empty() {
        println!("No batches yet. Drop files into {} and run `docuflow scan`.",
            settings.intake_dir().display());
        return Ok(());
    }

    for batch in all {
        println!(
            "batch {} [{}] {}",
            batch.id,
            batch.kind.as_str(),
            style(batch.status.as_str()).cyan()
        );
        for (state, count) in docs.count_by_state(batch.id)? {
            println!("    {:>4} {}", count, state);
        }
    }
    Ok(())
}

/// Force a normalized-cache GC pass.
pub fn cmd_gc(settings: &Settings) -> anyhow::Result<()> {
    let normalizer = Normalizer::new(settings.normalized_cache_dir(), settings.normalize_dpi);
    let removed = normalizer.gc(settings.normalized_cache_max_age_days)?;
    println!(
        "{} Removed {} stale normalized PDFs",
        style("✓").green(),
        removed
    );
    Ok(())
}

/// Parse a bind address that can be:
/// - Just a port: "8737" -> 127.0.0.1:8737
/// - Just a host: "0.0.0.0" -> 0.0.0.0:8737
/// - Host and port: "0.0.0.0:8737"
fn parse_bind_address(bind: &str) -> anyhow::Result<(String, u16)> {
    if let Ok(port) = bind.parse::<u16>() {
        return Ok(("127.0.0.1".to_string(), port));
    }

    if let Some((host, port_str)) = bind.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }

    Ok((bind.to_string(), 8737))
}
