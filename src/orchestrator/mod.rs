//! Smart processing orchestrator.
//!
//! One runtime value owns the token registry, the worker pool, and the two
//! pipelines (single-document and batch-scan). Background runs are children
//! of this runtime; nothing lives in module globals. Progress flows through
//! the registry as `ProgressEvent`s and out to clients over SSE.

pub mod events;
mod token;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::config::Settings;
use crate::export::Exporter;
use crate::intake::{scan_intake_dir, IntakeDetector, IntakeError, Normalizer};
use crate::llm::{classifier_for, Classifier};
use crate::models::{Analysis, BatchKind, BatchStatus, ProcessingStrategy};
use crate::ocr::engine_for;
use crate::pipeline::{CancelFlag, DocumentPipeline, PipelineError};
use crate::repository::{interaction::events as log_events, BatchRepository, DocumentRepository, InteractionLog};

use events::{Phase, PhaseEvent, ProgressEvent, TerminalEvent};
pub use token::{Subscription, TokenRegistry};

/// Cap on error strings carried by the terminal event.
const MAX_TERMINAL_ERRORS: usize = 20;

#[derive(Default)]
struct Counters {
    ocr: AtomicU64,
    ai: AtomicU64,
    persist: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

enum JobTarget {
    Single { batch_id: i64 },
    BatchScan,
}

struct Job {
    analysis: Analysis,
    target: JobTarget,
}

enum JobResult {
    Done(Vec<String>),
    Failed(String),
    Cancelled,
}

pub struct OrchestratorRuntime {
    settings: Arc<Settings>,
    detector: Arc<IntakeDetector>,
    pipeline: Arc<DocumentPipeline>,
    exporter: Arc<Exporter>,
    batches: BatchRepository,
    docs: DocumentRepository,
    log: InteractionLog,
    tokens: Arc<TokenRegistry>,
}

impl OrchestratorRuntime {
    /// Build the runtime and everything it drives. Called once at startup.
    pub fn new(settings: Settings) -> anyhow::Result<Arc<Self>> {
        settings.ensure_directories()?;
        let db = settings.database_path();

        let batches = BatchRepository::new(&db)?;
        let docs = DocumentRepository::new(&db)?;
        let log = InteractionLog::new(&db)?;

        let engine = engine_for(&settings);
        let classifier: Arc<dyn Classifier> = classifier_for(&settings);
        let normalizer = Normalizer::new(settings.normalized_cache_dir(), settings.normalize_dpi);

        let detector = Arc::new(IntakeDetector::new(
            normalizer.clone(),
            classifier.clone(),
            engine.clone(),
        ));
        let pipeline = Arc::new(DocumentPipeline::new(
            &settings,
            docs.clone(),
            engine.clone(),
            classifier.clone(),
            normalizer.clone(),
        ));
        let exporter = Arc::new(Exporter::new(
            &settings,
            batches.clone(),
            docs.clone(),
            log.clone(),
            classifier,
            engine,
            normalizer,
        ));
        let tokens = Arc::new(TokenRegistry::new(Duration::from_secs(
            settings.token_ttl_secs,
        )));

        Ok(Arc::new(Self {
            settings: Arc::new(settings),
            detector,
            pipeline,
            exporter,
            batches,
            docs,
            log,
            tokens,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    pub fn pipeline(&self) -> &Arc<DocumentPipeline> {
        &self.pipeline
    }

    pub fn exporter(&self) -> &Arc<Exporter> {
        &self.exporter
    }

    pub fn batches(&self) -> &BatchRepository {
        &self.batches
    }

    pub fn documents(&self) -> &DocumentRepository {
        &self.docs
    }

    pub fn interaction_log(&self) -> &InteractionLog {
        &self.log
    }

    pub fn normalizer(&self) -> &Normalizer {
        self.detector.normalizer()
    }

    /// Kick off a smart-processing run over the intake directory.
    /// Returns the token immediately; progress streams via the registry.
    pub fn start_smart_processing(self: &Arc<Self>) -> String {
        let (token, cancel) = self.tokens.create();
        let runtime = self.clone();
        let spawned_token = token.clone();
        tokio::spawn(async move {
            runtime.run(spawned_token, cancel).await;
        });
        token
    }

    /// Request cancellation for a run. Unknown tokens report false.
    pub fn cancel(&self, token: &str) -> bool {
        self.tokens.cancel(token)
    }

    /// Drive one run to its terminal event. Used by the spawn above and
    /// directly by the CLI.
    pub async fn run(self: Arc<Self>, token: String, cancel: CancelFlag) {
        if let Err(e) = self.clone().run_inner(&token, &cancel).await {
            tracing::error!("smart processing failed: {}", e);
            self.tokens.publish(
                &token,
                ProgressEvent::Terminal(TerminalEvent {
                    token: token.clone(),
                    phase: Phase::Finalize,
                    terminal: true,
                    current: 0,
                    total: 0,
                    message: format!("run failed: {}", e),
                    single_batch_id: None,
                    grouped_batch_id: None,
                    processed: 0,
                    failed: 0,
                    errors: vec![e.to_string()],
                }),
            );
        }
    }

    async fn run_inner(
        self: Arc<Self>,
        token: &str,
        cancel: &CancelFlag,
    ) -> anyhow::Result<()> {
        let intake_dir = self.settings.intake_dir();
        let files = scan_intake_dir(&intake_dir)?;
        let total = files.len() as u64;
        let workers = self.settings.workers.max(1);
        let mut errors: Vec<String> = Vec::new();

        // ==================== Analysis ====================
        let mut analyses: Vec<Analysis> = Vec::with_capacity(files.len());
        let mut analyzed = 0u64;
        for chunk in files.chunks(workers) {
            if cancel.is_cancelled() {
                break;
            }
            let futures = chunk.iter().map(|path| {
                let detector = self.detector.clone();
                let path = path.clone();
                async move {
                    let result = detector.analyze(&path).await;
                    (path, result)
                }
            });
            for (path, result) in join_all(futures).await {
                analyzed += 1;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("artifact")
                    .to_string();
                match result {
                    Ok(analysis) => {
                        self.emit(
                            token,
                            Phase::Analyze,
                            analyzed,
                            total,
                            format!("{} -> {}", name, analysis.strategy.as_str()),
                            Some(name.clone()),
                            None,
                            None,
                        );
                        self.emit(
                            token,
                            Phase::Normalize,
                            analyzed,
                            total,
                            if analysis.reused {
                                format!("{} normalized (cache hit)", name)
                            } else {
                                format!("{} normalized", name)
                            },
                            Some(name),
                            None,
                            None,
                        );
                        analyses.push(analysis);
                    }
                    Err(IntakeError::Unsupported(_)) => {
                        self.emit(
                            token,
                            Phase::Analyze,
                            analyzed,
                            total,
                            format!("{} skipped: unsupported kind", name),
                            Some(name),
                            None,
                            None,
                        );
                    }
                    Err(e) => {
                        let message = format!("{}: {}", name, e);
                        self.emit(
                            token,
                            Phase::Analyze,
                            analyzed,
                            total,
                            message.clone(),
                            Some(name),
                            None,
                            Some(e.to_string()),
                        );
                        errors.push(message);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            self.publish_terminal(
                token,
                Phase::Cancelled,
                analyzed,
                total,
                "analysis cancelled",
                None,
                None,
                0,
                errors.len() as u64,
                errors,
            );
            return Ok(());
        }

        // ==================== Batch routing ====================
        let (singles, scans): (Vec<_>, Vec<_>) = analyses
            .into_iter()
            .partition(|a| a.strategy == ProcessingStrategy::SingleDocument);

        let single_batch = if singles.is_empty() {
            None
        } else {
            let batches = self.batches.clone();
            Some(
                tokio::task::spawn_blocking(move || {
                    batches.get_or_create_processing_batch(BatchKind::SingleDocumentBatch)
                })
                .await??,
            )
        };
        let grouped_batch = if scans.is_empty() {
            None
        } else {
            let batches = self.batches.clone();
            Some(
                tokio::task::spawn_blocking(move || {
                    batches.get_or_create_processing_batch(BatchKind::GroupedBatch)
                })
                .await??,
            )
        };

        let mut jobs: Vec<Job> = Vec::with_capacity(singles.len() + scans.len());
        if let Some(batch) = &single_batch {
            let batch_id = batch.id;
            jobs.extend(singles.into_iter().map(|analysis| Job {
                analysis,
                target: JobTarget::Single { batch_id },
            }));
        }
        jobs.extend(scans.into_iter().map(|analysis| Job {
            analysis,
            target: JobTarget::BatchScan,
        }));

        // ==================== Processing ====================
        let total_jobs = jobs.len() as u64;
        let counters = Arc::new(Counters::default());
        let mut cancelled = false;

        let mut queue = jobs.into_iter().peekable();
        while queue.peek().is_some() && !cancelled {
            let chunk: Vec<Job> = queue.by_ref().take(workers).collect();
            let futures = chunk.into_iter().map(|job| {
                let runtime = self.clone();
                let token = token.to_string();
                let cancel = cancel.clone();
                let counters = counters.clone();
                async move { runtime.run_job(&token, &cancel, &counters, total_jobs, job).await }
            });
            for result in join_all(futures).await {
                match result {
                    JobResult::Done(warnings) => errors.extend(warnings),
                    JobResult::Failed(message) => errors.push(message),
                    JobResult::Cancelled => cancelled = true,
                }
            }
            if cancel.is_cancelled() {
                cancelled = true;
            }
        }

        let processed = counters.processed.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);

        if cancelled {
            self.publish_terminal(
                token,
                Phase::Cancelled,
                processed + failed,
                total_jobs,
                "processing cancelled",
                single_batch.as_ref().map(|b| b.id),
                grouped_batch.as_ref().map(|b| b.id),
                processed,
                failed,
                errors,
            );
            return Ok(());
        }

        // ==================== Finalize ====================
        if let Some(batch) = &single_batch {
            self.advance_batch(batch.id, BatchStatus::PendingVerification);
        }
        if let Some(batch) = &grouped_batch {
            self.advance_batch(batch.id, BatchStatus::PendingGrouping);
        }

        self.publish_terminal(
            token,
            Phase::Finalize,
            total_jobs,
            total_jobs,
            format!("{} processed, {} failed", processed, failed),
            single_batch.as_ref().map(|b| b.id),
            grouped_batch.as_ref().map(|b| b.id),
            processed,
            failed,
            errors,
        );
        Ok(())
    }

    async fn run_job(
        self: Arc<Self>,
        token: &str,
        cancel: &CancelFlag,
        counters: &Counters,
        total_jobs: u64,
        job: Job,
    ) -> JobResult {
        if cancel.is_cancelled() {
            return JobResult::Cancelled;
        }
        let analysis = job.analysis;
        let name = analysis
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact")
            .to_string();

        match job.target {
            JobTarget::Single { batch_id } => {
                let doc = match self.docs.insert_or_get(
                    batch_id,
                    &analysis.content_hash,
                    &analysis.path,
                    analysis.page_count,
                ) {
                    Ok(doc) => doc,
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        return JobResult::Failed(format!("{}: {}", name, e));
                    }
                };

                let current = counters.ocr.fetch_add(1, Ordering::Relaxed) + 1;
                self.emit(
                    token,
                    Phase::Ocr,
                    current,
                    total_jobs,
                    format!("ocr {}", name),
                    Some(name.clone()),
                    Some(doc.id),
                    None,
                );

                match self
                    .pipeline
                    .process_single(&doc, &analysis.normalized_path, None, cancel)
                    .await
                {
                    Ok(outcome) => {
                        if outcome.ai.is_some() {
                            let current = counters.ai.fetch_add(1, Ordering::Relaxed) + 1;
                            self.emit(
                                token,
                                Phase::AiClassify,
                                current,
                                total_jobs,
                                format!("classified {}", name),
                                Some(name.clone()),
                                Some(doc.id),
                                None,
                            );
                        }
                        let current = counters.persist.fetch_add(1, Ordering::Relaxed) + 1;
                        self.emit(
                            token,
                            Phase::Persist,
                            current,
                            total_jobs,
                            if outcome.cached {
                                format!("{} up to date (cache hit)", name)
                            } else {
                                format!("{} persisted", name)
                            },
                            Some(name),
                            Some(doc.id),
                            None,
                        );
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        let warnings = outcome
                            .page_errors
                            .into_iter()
                            .map(|(page, e)| {
                                format!("{} page {}: {}", doc.source_hash, page + 1, e)
                            })
                            .collect();
                        JobResult::Done(warnings)
                    }
                    Err(PipelineError::Cancelled) => JobResult::Cancelled,
                    Err(e) => {
                        let _ = self.docs.mark_failed(doc.id, &e.to_string());
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        let current = counters.persist.fetch_add(1, Ordering::Relaxed) + 1;
                        self.emit(
                            token,
                            Phase::Persist,
                            current,
                            total_jobs,
                            format!("{} failed", name),
                            Some(name.clone()),
                            Some(doc.id),
                            Some(e.to_string()),
                        );
                        JobResult::Failed(format!("{}: {}", name, e))
                    }
                }
            }
            JobTarget::BatchScan => {
                let current = counters.ocr.fetch_add(1, Ordering::Relaxed) + 1;
                self.emit(
                    token,
                    Phase::Ocr,
                    current,
                    total_jobs,
                    format!("ocr pages of {}", name),
                    Some(name.clone()),
                    None,
                    None,
                );

                match self
                    .pipeline
                    .process_batch_scan(
                        &analysis.content_hash,
                        &analysis.normalized_path,
                        analysis.page_count,
                        cancel,
                    )
                    .await
                {
                    Ok(outcome) => {
                        let current = counters.persist.fetch_add(1, Ordering::Relaxed) + 1;
                        self.emit(
                            token,
                            Phase::Persist,
                            current,
                            total_jobs,
                            format!(
                                "{}: {} pages ocr'd, {} cached",
                                name, outcome.pages_done, outcome.pages_cached
                            ),
                            Some(name),
                            None,
                            None,
                        );
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                        let warnings = outcome
                            .page_errors
                            .into_iter()
                            .map(|(page, e)| {
                                format!("{} page {}: {}", analysis.content_hash, page + 1, e)
                            })
                            .collect();
                        JobResult::Done(warnings)
                    }
                    Err(PipelineError::Cancelled) => JobResult::Cancelled,
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        JobResult::Failed(format!("{}: {}", name, e))
                    }
                }
            }
        }
    }

    fn advance_batch(&self, batch_id: i64, status: BatchStatus) {
        match self.batches.transition(batch_id, status) {
            Ok(batch) => {
                self.log.append(
                    log_events::BATCH_STATUS,
                    Some(batch.id),
                    None,
                    status.as_str(),
                );
            }
            Err(e) => tracing::warn!("batch {} transition skipped: {}", batch_id, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        token: &str,
        phase: Phase,
        current: u64,
        total: u64,
        message: impl Into<String>,
        artifact: Option<String>,
        document_id: Option<i64>,
        error: Option<String>,
    ) {
        self.tokens.publish(
            token,
            ProgressEvent::Progress(PhaseEvent {
                token: token.to_string(),
                phase,
                current,
                total,
                message: message.into(),
                artifact,
                document_id,
                error,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_terminal(
        &self,
        token: &str,
        phase: Phase,
        current: u64,
        total: u64,
        message: impl Into<String>,
        single_batch_id: Option<i64>,
        grouped_batch_id: Option<i64>,
        processed: u64,
        failed: u64,
        mut errors: Vec<String>,
    ) {
        errors.truncate(MAX_TERMINAL_ERRORS);
        self.tokens.publish(
            token,
            ProgressEvent::Terminal(TerminalEvent {
                token: token.to_string(),
                phase,
                terminal: true,
                current,
                total,
                message: message.into(),
                single_batch_id,
                grouped_batch_id,
                processed,
                failed,
                errors,
            }),
        );
    }
}
