//! End-to-end smart processing runs in fast test mode: dual-batch routing,
//! progress stream shape, resumability, and cancellation.

use std::path::{Path, PathBuf};

use docuflow::config::Settings;
use docuflow::models::{BatchKind, BatchStatus, DocumentState};
use docuflow::orchestrator::events::{Phase, ProgressEvent, TerminalEvent};
use docuflow::orchestrator::OrchestratorRuntime;
use docuflow::pdf::{image_to_pdf, write_image_pdf, PageSpec};
use docuflow::utils::sha256_file;
use tempfile::tempdir;

fn test_settings(data_dir: &Path) -> Settings {
    let mut settings = Settings::with_data_dir(data_dir.to_path_buf());
    settings.fast_test_mode = true;
    settings.workers = 2;
    settings
}

fn write_png(dir: &Path, name: &str, shade: u8) -> PathBuf {
    let path = dir.join(name);
    let img = image::ImageBuffer::from_pixel(20, 28, image::Rgb([shade, shade, shade]));
    img.save(&path).unwrap();
    path
}

fn write_single_page_pdf(dir: &Path, name: &str, shade: u8) -> PathBuf {
    let png = write_png(dir, &format!(".tmp_{}.png", name), shade);
    let pdf = dir.join(name);
    image_to_pdf(&png, &pdf, 150, 95).unwrap();
    std::fs::remove_file(png).unwrap();
    pdf
}

fn write_multi_page_pdf(dir: &Path, name: &str, pages: u32) -> PathBuf {
    let png = write_png(dir, &format!(".tmp_{}.png", name), 77);
    let specs: Vec<PageSpec> = (0..pages)
        .map(|_| PageSpec::from_image_file(&png, 150, 95, None).unwrap())
        .collect();
    let pdf = dir.join(name);
    write_image_pdf(&specs, &pdf).unwrap();
    std::fs::remove_file(png).unwrap();
    pdf
}

async fn run_to_terminal(
    runtime: &std::sync::Arc<OrchestratorRuntime>,
) -> (Vec<ProgressEvent>, TerminalEvent) {
    let (token, cancel) = runtime.tokens().create();
    runtime.clone().run(token.clone(), cancel).await;
    let subscription = runtime.tokens().subscribe(&token).unwrap();
    let terminal = subscription
        .history
        .iter()
        .find_map(|e| match e {
            ProgressEvent::Terminal(t) => Some(t.clone()),
            _ => None,
        })
        .expect("run must publish a terminal event");
    (subscription.history, terminal)
}

#[tokio::test]
async fn test_mixed_intake_creates_exactly_two_batches() {
    let dir = tempdir().unwrap();
    let runtime = OrchestratorRuntime::new(test_settings(dir.path())).unwrap();

    let intake = runtime.settings().intake_dir();
    let invoice = write_single_page_pdf(&intake, "invoice_acme.pdf", 120);
    let scan = write_multi_page_pdf(&intake, "scan_stack.pdf", 6);

    let (history, terminal) = run_to_terminal(&runtime).await;

    assert_eq!(terminal.phase, Phase::Finalize);
    assert!(terminal.terminal);
    assert_eq!(terminal.processed, 2);
    assert_eq!(terminal.failed, 0);

    let single_id = terminal.single_batch_id.expect("single batch created");
    let grouped_id = terminal.grouped_batch_id.expect("grouped batch created");
    assert_ne!(single_id, grouped_id);

    // Every artifact lands in exactly one batch
    let single_batch = runtime.batches().get(single_id).unwrap().unwrap();
    assert_eq!(single_batch.kind, BatchKind::SingleDocumentBatch);
    assert_eq!(single_batch.status, BatchStatus::PendingVerification);
    let docs = runtime.documents().list_by_batch(single_id).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].source_hash, sha256_file(&invoice).unwrap());
    assert_eq!(docs[0].state, DocumentState::AiDone);
    assert!(docs[0].searchable_pdf_path.as_ref().unwrap().exists());
    assert!(docs[0].ai_category.is_some());

    let grouped_batch = runtime.batches().get(grouped_id).unwrap().unwrap();
    assert_eq!(grouped_batch.kind, BatchKind::GroupedBatch);
    assert_eq!(grouped_batch.status, BatchStatus::PendingGrouping);
    let scan_hash = sha256_file(&scan).unwrap();
    assert_eq!(runtime.documents().count_intake_pages(&scan_hash).unwrap(), 6);

    // Events are monotonic in `current` within each (token, phase)
    use std::collections::HashMap;
    let mut last_current: HashMap<Phase, u64> = HashMap::new();
    for event in &history {
        if let ProgressEvent::Progress(e) = event {
            let previous = last_current.entry(e.phase).or_insert(0);
            assert!(
                e.current >= *previous,
                "phase {:?} went backwards: {} after {}",
                e.phase,
                e.current,
                previous
            );
            *previous = e.current;
        }
    }
}

#[tokio::test]
async fn test_second_run_attaches_and_reuses_caches() {
    let dir = tempdir().unwrap();
    let runtime = OrchestratorRuntime::new(test_settings(dir.path())).unwrap();

    let intake = runtime.settings().intake_dir();
    write_single_page_pdf(&intake, "invoice_acme.pdf", 120);
    write_multi_page_pdf(&intake, "scan_stack.pdf", 6);

    let (_, first) = run_to_terminal(&runtime).await;
    let (history, second) = run_to_terminal(&runtime).await;

    // Same batch identities on re-run
    assert_eq!(first.single_batch_id, second.single_batch_id);
    assert_eq!(first.grouped_batch_id, second.grouped_batch_id);
    assert_eq!(second.processed, 2);
    assert_eq!(second.failed, 0);

    // The second run did no OCR: the single document is a signature cache
    // hit and every scan page comes back from the intake page store
    let persist_messages: Vec<String> = history
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress(p) if p.phase == Phase::Persist => {
                Some(p.message.clone())
            }
            _ => None,
        })
        .collect();
    assert!(persist_messages.iter().any(|m| m.contains("cache hit")));
    assert!(persist_messages
        .iter()
        .any(|m| m.contains("0 pages ocr'd, 6 cached")));
}

#[tokio::test]
async fn test_pre_cancelled_run_terminates_with_cancelled_phase() {
    let dir = tempdir().unwrap();
    let runtime = OrchestratorRuntime::new(test_settings(dir.path())).unwrap();
    write_single_page_pdf(&runtime.settings().intake_dir(), "doc.pdf", 30);

    let (token, cancel) = runtime.tokens().create();
    cancel.cancel();
    runtime.clone().run(token.clone(), cancel).await;

    let subscription = runtime.tokens().subscribe(&token).unwrap();
    let terminal = subscription
        .history
        .iter()
        .find_map(|e| match e {
            ProgressEvent::Terminal(t) => Some(t.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(terminal.phase, Phase::Cancelled);
    assert!(terminal.terminal);
}

#[tokio::test]
async fn test_unsupported_files_are_skipped_without_failing_the_run() {
    let dir = tempdir().unwrap();
    let runtime = OrchestratorRuntime::new(test_settings(dir.path())).unwrap();
    let intake = runtime.settings().intake_dir();
    write_single_page_pdf(&intake, "invoice.pdf", 60);
    // Wrong content behind a supported extension: analysis fails, run survives
    std::fs::write(intake.join("broken.pdf"), b"not a pdf at all").unwrap();

    let (_, terminal) = run_to_terminal(&runtime).await;
    assert_eq!(terminal.phase, Phase::Finalize);
    assert_eq!(terminal.processed, 1);
    assert!(!terminal.errors.is_empty());
}
