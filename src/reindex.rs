//! Reindex orchestration.
//!
//! Drives one catalog-wide ingestion run:
//!
//! ```text
//! trigger ─▶ RUNNING(preparing_index) ─▶ per active source, in catalog order:
//!              resolve location → checksum → ingesting:<alias> | skipping:<alias>
//!           ─▶ save catalog (version + 1) ─▶ save index version ─▶ SUCCEEDED
//!                        any error ─▶ FAILED(stage = "failed")
//! ```
//!
//! Sources are processed sequentially so catalog versioning and audit
//! ordering stay deterministic. At most one run is in flight per
//! orchestrator; a second trigger fails with [`ReindexError::AlreadyRunning`].
//!
//! After every source the run records a [`Checkpoint`] (work ids are the
//! active aliases in catalog order) in an in-memory job ledger, so a failed
//! job can later be resumed with `resume_job_id` without re-ingesting the
//! sources it already finished.
//!
//! A client disconnecting does not stop a run: the run is spawned on its
//! own task and keeps going with no listener.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use rag_backend_core::audit::{AuditEntry, SourceMutation};
use rag_backend_core::clock::Clock;
use rag_backend_core::models::{
    ContentIndexVersion, IndexStatus, IngestionJob, IngestionTrigger, SourceCatalog, SourceRecord,
    SourceSnapshot,
};
use rag_backend_core::recovery::{Checkpoint, JobRecoveryService, RecoveryError};
use rag_backend_core::store::{
    AuditSink, CatalogStore, ChecksumCalculator, ChunkBuilder, ChunkRequest, IndexVersionWriter,
};
use uuid::Uuid;

use crate::checksum::{resolve_location, source_size};
use crate::config::ReindexConfig;
use crate::job_stream::{job_channel, JobEvents, JobStream};

const AUDIT_ACTION: &str = "admin_reindex";
const SOURCE_AUDIT_ACTION: &str = "source_reindex";

/// Terminal jobs kept in the ledger; older ones are forgotten.
pub const MAX_FINISHED_JOBS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ReindexError {
    #[error("a reindex job is already running")]
    AlreadyRunning,

    #[error("unknown reindex job '{0}'")]
    JobNotFound(String),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("reindex failed: {0:#}")]
    Failed(#[from] anyhow::Error),
}

/// Progress throttling and index freshness.
#[derive(Debug, Clone)]
pub struct ReindexSettings {
    pub progress_every_sources: usize,
    pub progress_interval: Duration,
    pub freshness: chrono::Duration,
}

impl Default for ReindexSettings {
    fn default() -> Self {
        Self::from_config(&ReindexConfig::default())
    }
}

impl ReindexSettings {
    pub fn from_config(config: &ReindexConfig) -> Self {
        Self {
            progress_every_sources: config.progress_every_sources.max(1),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            freshness: chrono::Duration::days(config.index_freshness_days),
        }
    }
}

/// External collaborators used by a run.
#[derive(Clone)]
pub struct ReindexDeps {
    pub catalog: Arc<dyn CatalogStore>,
    pub index_versions: Arc<dyn IndexVersionWriter>,
    pub audit: Arc<dyn AuditSink>,
    pub checksums: Arc<dyn ChecksumCalculator>,
    pub chunks: Arc<dyn ChunkBuilder>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReindexRequest {
    pub trigger: IngestionTrigger,
    /// Ingest every active source, even when its checksum is unchanged.
    pub force: bool,
    /// Resume this failed (or interrupted) job from its last checkpoint.
    pub resume_job_id: Option<String>,
}

struct LedgerEntry {
    job: IngestionJob,
    checkpoint: Option<Checkpoint>,
}

#[derive(Default)]
struct JobLedger {
    entries: HashMap<String, LedgerEntry>,
    /// Terminal job ids, oldest first.
    finished: VecDeque<String>,
}

impl JobLedger {
    fn get(&self, job_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(job_id)
    }

    fn record(&mut self, job: &IngestionJob, checkpoint: Option<Checkpoint>) {
        let entry = self.entries.entry(job.job_id.clone()).or_insert_with(|| LedgerEntry {
            job: job.clone(),
            checkpoint: None,
        });
        entry.job = job.clone();
        if checkpoint.is_some() {
            entry.checkpoint = checkpoint;
        }

        self.finished.retain(|id| id != &job.job_id);
        if job.status.is_terminal() {
            self.finished.push_back(job.job_id.clone());
        }
        while self.finished.len() > MAX_FINISHED_JOBS {
            if let Some(evicted) = self.finished.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

/// Clears the single-flight flag when dropped.
struct RunPermit(Arc<AtomicBool>);

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PreparedRun {
    job: IngestionJob,
    resumed: HashSet<String>,
    force: bool,
    _permit: RunPermit,
}

pub struct ReindexOrchestrator {
    deps: ReindexDeps,
    settings: ReindexSettings,
    recovery: JobRecoveryService,
    ledger: Mutex<JobLedger>,
    running: Arc<AtomicBool>,
}

impl ReindexOrchestrator {
    pub fn new(deps: ReindexDeps, settings: ReindexSettings) -> Self {
        let recovery = JobRecoveryService::new(deps.clock.clone());
        Self {
            deps,
            settings,
            recovery,
            ledger: Mutex::new(JobLedger::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Latest known state of a job started by this orchestrator.
    ///
    /// Only the last [`MAX_FINISHED_JOBS`] terminal jobs are remembered.
    pub fn job(&self, job_id: &str) -> Option<IngestionJob> {
        self.ledger.lock().unwrap().get(job_id).map(|e| e.job.clone())
    }

    pub fn checkpoint(&self, job_id: &str) -> Option<Checkpoint> {
        self.ledger
            .lock()
            .unwrap()
            .get(job_id)
            .and_then(|e| e.checkpoint.clone())
    }

    /// Start a run on a background task.
    ///
    /// Returns the initial job snapshot and the stream of subsequent job
    /// events. Precondition failures (already running, unknown job, invalid
    /// recovery state) are returned before anything is spawned.
    pub fn begin(self: &Arc<Self>, request: ReindexRequest) -> Result<(IngestionJob, JobStream), ReindexError> {
        let prepared = self.prepare(&request)?;
        let initial = prepared.job.clone();
        let (events, stream) = job_channel();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.execute(prepared, events).await {
                tracing::warn!(error = %e, "detached reindex run ended with an error");
            }
        });
        Ok((initial, stream))
    }

    /// Run to completion on the current task.
    pub async fn run(&self, request: ReindexRequest, events: JobEvents) -> Result<IngestionJob, ReindexError> {
        let prepared = self.prepare(&request)?;
        self.execute(prepared, events).await
    }

    fn prepare(&self, request: &ReindexRequest) -> Result<PreparedRun, ReindexError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReindexError::AlreadyRunning);
        }
        let permit = RunPermit(self.running.clone());

        let Some(resume_id) = request.resume_job_id.as_deref() else {
            let job_id = format!("reindex-{}", Uuid::new_v4().simple());
            let job = IngestionJob::started(job_id, request.trigger, self.deps.clock.now());
            self.record(&job, None);
            return Ok(PreparedRun {
                job,
                resumed: HashSet::new(),
                force: request.force,
                _permit: permit,
            });
        };

        let (previous, checkpoint) = {
            let ledger = self.ledger.lock().unwrap();
            let entry = ledger
                .get(resume_id)
                .ok_or_else(|| ReindexError::JobNotFound(resume_id.to_string()))?;
            (entry.job.clone(), entry.checkpoint.clone())
        };

        let ordered = self.deps.catalog.load()?.active_aliases();
        let (job, plan) = self.recovery.resume(&previous, &ordered, checkpoint.as_ref())?;
        let remaining: HashSet<&String> = plan.remaining_document_ids.iter().collect();
        let resumed: HashSet<String> = ordered
            .iter()
            .filter(|alias| !remaining.contains(alias))
            .cloned()
            .collect();

        tracing::info!(
            job_id = %job.job_id,
            status = %job.status,
            skipped = resumed.len(),
            remaining = plan.remaining_document_ids.len(),
            "resuming reindex job"
        );
        self.record(&job, checkpoint);
        Ok(PreparedRun {
            job,
            resumed,
            force: request.force,
            _permit: permit,
        })
    }

    async fn execute(&self, prepared: PreparedRun, events: JobEvents) -> Result<IngestionJob, ReindexError> {
        let job = prepared.job.clone();
        tracing::info!(job_id = %job.job_id, trigger = job.trigger.as_str(), force = prepared.force, "reindex started");
        events.progress(&job);
        self.audit(
            AuditEntry::new(self.deps.clock.now(), AUDIT_ACTION, "started", &job.job_id)
                .with_field("trigger", job.trigger.as_str().into()),
        );

        let mut current = job;
        let (finished, result) = match self.process(&mut current, &prepared, &events).await {
            Ok(done) => {
                self.record_job(&done);
                self.audit(AuditEntry::new(self.deps.clock.now(), AUDIT_ACTION, "success", &done.job_id));
                tracing::info!(
                    job_id = %done.job_id,
                    documents = done.documents_processed,
                    "reindex succeeded"
                );
                (done.clone(), Ok(done))
            }
            Err(err) => {
                let message = format!("{:#}", err);
                let failed = current.failed(self.deps.clock.now(), message.clone());
                self.record_job(&failed);
                self.audit(
                    AuditEntry::new(self.deps.clock.now(), AUDIT_ACTION, "failure", &failed.job_id)
                        .with_details(message.clone()),
                );
                tracing::error!(job_id = %failed.job_id, stage = ?current.stage, error = %message, "reindex failed");
                (failed, Err(ReindexError::Failed(err)))
            }
        };

        // The slot must be free before a listener can observe the terminal event.
        drop(prepared);
        events.complete(&finished);
        result
    }

    async fn process(&self, current: &mut IngestionJob, run: &PreparedRun, events: &JobEvents) -> Result<IngestionJob> {
        let emit = !current.status.is_terminal();
        let catalog = self.deps.catalog.load()?;
        let ordered = catalog.active_aliases();
        let total = ordered.len();

        let mut processed: Vec<String> = ordered
            .iter()
            .filter(|alias| run.resumed.contains(*alias))
            .cloned()
            .collect();
        let mut documents = current.documents_processed;
        let mut sources: Vec<SourceRecord> = Vec::with_capacity(catalog.sources.len());
        let mut snapshots: Vec<SourceSnapshot> = Vec::with_capacity(total);
        let mut throttle = ProgressThrottle::new(&self.settings);

        for record in &catalog.sources {
            if !record.is_active() {
                sources.push(record.clone());
                continue;
            }

            let alias = record.alias.as_str();
            let location = resolve_location(&record.location)?;
            let checksum = self.deps.checksums.checksum(&location)?;
            let size_bytes = source_size(&location)?;
            let already_done = run.resumed.contains(alias);
            let changed = record.checksum.as_deref() != Some(checksum.as_str());

            let stage = if !already_done && (changed || run.force) {
                let stage = format!("ingesting:{}", alias);
                let before = percent_of(processed.len(), total);
                let base = current.with_progress(stage.clone(), documents, before);
                let sub_progress =
                    SubSourceProgress::new(events.clone(), base, before, total, &self.settings, emit);
                let progress = |done: usize, of: usize| sub_progress.report(done, of);

                tracing::info!(job_id = %current.job_id, alias, changed, "ingesting source");
                let built = self
                    .deps
                    .chunks
                    .build(ChunkRequest {
                        alias,
                        checksum: &checksum,
                        location: &location,
                        source_type: record.source_type,
                        progress: Some(&progress),
                    })
                    .await?;
                documents += built.len() as u64;
                self.log_source_mutation(current, record, built.len());
                stage
            } else {
                tracing::debug!(job_id = %current.job_id, alias, "skipping unchanged source");
                format!("skipping:{}", alias)
            };

            sources.push(SourceRecord {
                location: location.display().to_string(),
                size_bytes,
                last_updated: self.deps.clock.now(),
                checksum: Some(checksum.clone()),
                ..record.clone()
            });
            snapshots.push(SourceSnapshot::new(alias, checksum));
            if !already_done {
                processed.push(alias.to_string());
            }

            let checkpoint = if emit {
                Some(self.recovery.record_progress(current, &processed, &ordered)?)
            } else {
                None
            };
            let percent = checkpoint
                .as_ref()
                .map(|c| c.percent_complete)
                .unwrap_or_else(|| percent_of(processed.len(), total));
            *current = current.with_progress(stage, documents, percent);
            self.record(current, checkpoint);
            if emit && throttle.ready() {
                events.progress(current);
            }
        }

        sources.sort_by(|a, b| a.alias.cmp(&b.alias));
        snapshots.sort_by(|a, b| a.alias.cmp(&b.alias));

        let now = self.deps.clock.now();
        let new_catalog = SourceCatalog {
            version: catalog.version + 1,
            updated_at: now,
            sources,
            snapshots,
        };
        self.deps.catalog.save(&new_catalog)?;

        let index_version = ContentIndexVersion {
            index_id: Uuid::new_v4().to_string(),
            status: IndexStatus::Ready,
            checksum: SourceSnapshot::digest(&new_catalog.snapshots),
            source_snapshot: new_catalog.snapshots.clone(),
            size_bytes: new_catalog.active_sources().map(|s| s.size_bytes).sum(),
            document_count: documents,
            trigger_job_id: current.job_id.clone(),
            built_at: now,
            freshness_expires_at: now + self.settings.freshness,
        };
        self.deps.index_versions.save(&index_version)?;
        tracing::debug!(
            job_id = %current.job_id,
            catalog_version = new_catalog.version,
            index_id = %index_version.index_id,
            "catalog and index version persisted"
        );

        Ok(current.with_progress("completed", documents, 100.0).succeeded(now))
    }

    fn log_source_mutation(&self, job: &IngestionJob, record: &SourceRecord, chunks: usize) {
        let mutation = SourceMutation {
            action: SOURCE_AUDIT_ACTION.to_string(),
            alias: record.alias.clone(),
            status: "success".to_string(),
            language: record.language.clone(),
            trace_id: Some(job.job_id.clone()),
            details: Some(format!("chunks={}", chunks)),
        };
        if let Err(e) = self.deps.audit.log_mutation(self.deps.clock.now(), &mutation) {
            tracing::warn!(alias = %record.alias, error = %e, "failed to write source audit entry");
        }
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.deps.audit.append(&entry) {
            tracing::warn!(action = %entry.action, status = %entry.status, error = %e, "failed to write audit entry");
        }
    }

    fn record(&self, job: &IngestionJob, checkpoint: Option<Checkpoint>) {
        self.ledger.lock().unwrap().record(job, checkpoint);
    }

    fn record_job(&self, job: &IngestionJob) {
        self.record(job, None);
    }
}

fn percent_of(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Emits per-source progress every K sources or every T, whichever first.
struct ProgressThrottle {
    every: usize,
    interval: Duration,
    pending: usize,
    last: Instant,
}

impl ProgressThrottle {
    fn new(settings: &ReindexSettings) -> Self {
        Self {
            every: settings.progress_every_sources,
            interval: settings.progress_interval,
            pending: 0,
            last: Instant::now(),
        }
    }

    fn ready(&mut self) -> bool {
        self.pending += 1;
        if self.pending >= self.every || self.last.elapsed() >= self.interval {
            self.pending = 0;
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Time-throttled progress from inside one source's chunk build.
struct SubSourceProgress {
    events: JobEvents,
    base: IngestionJob,
    start_percent: f64,
    span: f64,
    interval: Duration,
    last: Mutex<Instant>,
    enabled: bool,
}

impl SubSourceProgress {
    fn new(
        events: JobEvents,
        base: IngestionJob,
        start_percent: f64,
        total_sources: usize,
        settings: &ReindexSettings,
        enabled: bool,
    ) -> Self {
        Self {
            events,
            base,
            start_percent,
            span: if total_sources == 0 { 0.0 } else { 100.0 / total_sources as f64 },
            interval: settings.progress_interval,
            last: Mutex::new(Instant::now()),
            enabled,
        }
    }

    fn report(&self, done: usize, of: usize) {
        if !self.enabled || of == 0 {
            return;
        }
        let mut last = self.last.lock().unwrap();
        if last.elapsed() < self.interval {
            return;
        }
        *last = Instant::now();
        let percent = self.start_percent + self.span * (done.min(of) as f64 / of as f64);
        let stage = self.base.stage.clone().unwrap_or_default();
        self.events
            .progress(&self.base.with_progress(stage, self.base.documents_processed, percent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_stream::JobEvent;
    use chrono::{TimeZone, Utc};
    use rag_backend_core::clock::FixedClock;
    use rag_backend_core::models::{IngestionStatus, SourceStatus, SourceType};
    use rag_backend_core::store::memory::{
        InMemoryCatalogStore, InMemoryIndexVersions, RecordingAuditSink, ScriptedChunkBuilder,
        StaticChecksums,
    };
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Records entries, sleeping before each terminal reindex entry.
    struct SlowAuditSink {
        inner: Arc<RecordingAuditSink>,
        delay: Duration,
    }

    impl AuditSink for SlowAuditSink {
        fn append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
            if entry.action == AUDIT_ACTION && entry.status != "started" {
                std::thread::sleep(self.delay);
            }
            self.inner.append(entry)
        }
    }

    struct Fixture {
        _tmp: TempDir,
        catalog: Arc<InMemoryCatalogStore>,
        versions: Arc<InMemoryIndexVersions>,
        audit: Arc<RecordingAuditSink>,
        builder: Arc<ScriptedChunkBuilder>,
        orchestrator: Arc<ReindexOrchestrator>,
        dirs: HashMap<String, PathBuf>,
    }

    fn record(alias: &str, location: &PathBuf, status: SourceStatus, checksum: Option<&str>) -> SourceRecord {
        SourceRecord {
            alias: alias.to_string(),
            source_type: SourceType::Man,
            location: location.display().to_string(),
            language: "en".to_string(),
            size_bytes: 0,
            last_updated: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            status,
            checksum: checksum.map(str::to_string),
            notes: None,
        }
    }

    /// Sources `b-docs` (changed), `a-docs` (unchanged), `z-old` (quarantined),
    /// listed in that catalog order.
    fn fixture(settings: ReindexSettings) -> Fixture {
        fixture_with_audit_delay(settings, Duration::ZERO)
    }

    fn fixture_with_audit_delay(settings: ReindexSettings, audit_delay: Duration) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut dirs = HashMap::new();
        for alias in ["a-docs", "b-docs", "z-old"] {
            let dir = tmp.path().join(alias);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("page.txt"), format!("{} content", alias)).unwrap();
            dirs.insert(alias.to_string(), dir);
        }

        let checksums = Arc::new(StaticChecksums::new());
        checksums.set(&dirs["a-docs"], "sum-a");
        checksums.set(&dirs["b-docs"], "sum-b-new");

        let now = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        let catalog = Arc::new(InMemoryCatalogStore::new(SourceCatalog {
            version: 3,
            updated_at: now,
            sources: vec![
                record("b-docs", &dirs["b-docs"], SourceStatus::Active, Some("sum-b-old")),
                record("a-docs", &dirs["a-docs"], SourceStatus::Active, Some("sum-a")),
                record("z-old", &dirs["z-old"], SourceStatus::Quarantined, None),
            ],
            snapshots: vec![
                SourceSnapshot::new("a-docs", "sum-a"),
                SourceSnapshot::new("b-docs", "sum-b-old"),
            ],
        }));
        let versions = Arc::new(InMemoryIndexVersions::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let builder = Arc::new(ScriptedChunkBuilder::new(3));

        let deps = ReindexDeps {
            catalog: catalog.clone(),
            index_versions: versions.clone(),
            audit: Arc::new(SlowAuditSink {
                inner: audit.clone(),
                delay: audit_delay,
            }),
            checksums,
            chunks: builder.clone(),
            clock: Arc::new(FixedClock::new(now)),
        };
        Fixture {
            orchestrator: Arc::new(ReindexOrchestrator::new(deps, settings)),
            _tmp: tmp,
            catalog,
            versions,
            audit,
            builder,
            dirs,
        }
    }

    async fn drain(mut stream: JobStream) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    fn stages(events: &[JobEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.job().stage.clone())
            .collect()
    }

    #[tokio::test]
    async fn reindex_ingests_changed_and_skips_unchanged() {
        let f = fixture(ReindexSettings::default());
        let (events, stream) = job_channel();
        let done = f.orchestrator.run(ReindexRequest::default(), events).await.unwrap();
        let events = drain(stream).await;

        assert_eq!(done.status, IngestionStatus::Succeeded);
        assert_eq!(done.percent_complete, Some(100.0));
        assert_eq!(done.stage.as_deref(), Some("completed"));
        assert_eq!(done.documents_processed, 3);

        let stages = stages(&events);
        assert_eq!(stages.iter().filter(|s| s.starts_with("ingesting:")).count(), 1);
        assert_eq!(stages.iter().filter(|s| s.starts_with("skipping:")).count(), 1);
        assert_eq!(stages.first().map(String::as_str), Some("preparing_index"));
        assert!(events.last().unwrap().is_complete());
        assert_eq!(f.builder.built_aliases(), vec!["b-docs".to_string()]);

        let saved = f.catalog.current();
        assert_eq!(saved.version, 4);
        let aliases: Vec<_> = saved.sources.iter().map(|s| s.alias.as_str()).collect();
        assert_eq!(aliases, vec!["a-docs", "b-docs", "z-old"]);
        assert_eq!(
            saved.snapshots,
            vec![
                SourceSnapshot::new("a-docs", "sum-a"),
                SourceSnapshot::new("b-docs", "sum-b-new"),
            ]
        );
        assert_eq!(saved.sources[2].status, SourceStatus::Quarantined);
        assert_eq!(saved.sources[1].size_bytes, "b-docs content".len() as u64);
        assert!(rag_backend_core::guard::ensure_index_current(&saved).is_ok());

        let version = f.versions.load().unwrap().unwrap();
        assert_eq!(version.document_count, 3);
        assert_eq!(version.trigger_job_id, done.job_id);
        assert_eq!(version.checksum, SourceSnapshot::digest(&saved.snapshots));
        assert_eq!(version.freshness_expires_at - version.built_at, chrono::Duration::days(30));

        let actions = f.audit.actions();
        assert_eq!(
            actions,
            vec![
                ("admin_reindex".to_string(), "started".to_string()),
                ("source_reindex".to_string(), "success".to_string()),
                ("admin_reindex".to_string(), "success".to_string()),
            ]
        );
        assert!(!f.orchestrator.is_running());
    }

    #[tokio::test]
    async fn percent_reaches_hundred_through_progress() {
        let f = fixture(ReindexSettings::default());
        let (events, stream) = job_channel();
        f.orchestrator.run(ReindexRequest::default(), events).await.unwrap();
        let percents: Vec<f64> = drain(stream)
            .await
            .iter()
            .filter_map(|e| e.job().percent_complete)
            .collect();
        assert_eq!(percents, vec![0.0, 50.0, 100.0, 100.0]);
    }

    #[tokio::test]
    async fn force_reingests_every_active_source() {
        let f = fixture(ReindexSettings::default());
        let request = ReindexRequest {
            force: true,
            ..ReindexRequest::default()
        };
        let done = f.orchestrator.run(request, JobEvents::detached()).await.unwrap();
        assert_eq!(done.documents_processed, 6);
        assert_eq!(
            f.builder.built_aliases(),
            vec!["b-docs".to_string(), "a-docs".to_string()]
        );
    }

    #[tokio::test]
    async fn throttle_limits_progress_frames() {
        let f = fixture(ReindexSettings {
            progress_every_sources: 5,
            progress_interval: Duration::from_secs(3600),
            ..ReindexSettings::default()
        });
        let (events, stream) = job_channel();
        f.orchestrator.run(ReindexRequest::default(), events).await.unwrap();
        let events = drain(stream).await;
        // initial snapshot plus the terminal one
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn collaborator_failure_fails_the_job() {
        let f = fixture(ReindexSettings::default());
        f.builder.fail_on("b-docs");
        let (events, stream) = job_channel();
        let err = f.orchestrator.run(ReindexRequest::default(), events).await.unwrap_err();
        assert!(matches!(err, ReindexError::Failed(_)));

        let events = drain(stream).await;
        let last = events.last().unwrap();
        assert!(last.is_complete());
        let failed = last.job();
        assert_eq!(failed.status, IngestionStatus::Failed);
        assert_eq!(failed.stage.as_deref(), Some("failed"));
        assert!(failed.error_message.as_deref().unwrap().contains("embedding service unavailable"));

        assert_eq!(f.catalog.save_count(), 0);
        assert!(f.versions.load().unwrap().is_none());
        let actions = f.audit.actions();
        assert_eq!(actions.last().unwrap(), &("admin_reindex".to_string(), "failure".to_string()));
        assert_eq!(f.orchestrator.job(&failed.job_id).unwrap().status, IngestionStatus::Failed);
        assert!(!f.orchestrator.is_running());
    }

    #[tokio::test]
    async fn missing_location_fails_the_job() {
        let f = fixture(ReindexSettings::default());
        fs::remove_dir_all(&f.dirs["a-docs"]).unwrap();
        let err = f
            .orchestrator
            .run(ReindexRequest::default(), JobEvents::detached())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn failed_job_resumes_from_checkpoint() {
        let f = fixture(ReindexSettings::default());
        // b-docs succeeds, a-docs fails on a forced run
        f.builder.fail_on("a-docs");
        let request = ReindexRequest {
            force: true,
            ..ReindexRequest::default()
        };
        let (events, stream) = job_channel();
        f.orchestrator.run(request, events).await.unwrap_err();
        let failed = drain(stream).await.last().unwrap().job().clone();
        let checkpoint = f.orchestrator.checkpoint(&failed.job_id).unwrap();
        assert_eq!(checkpoint.processed_document_ids, vec!["b-docs".to_string()]);
        assert_eq!(checkpoint.percent_complete, 50.0);

        f.builder.clear_failures();
        let resume = ReindexRequest {
            force: true,
            resume_job_id: Some(failed.job_id.clone()),
            ..ReindexRequest::default()
        };
        let done = f.orchestrator.run(resume, JobEvents::detached()).await.unwrap();
        assert_eq!(done.job_id, failed.job_id);
        assert_eq!(done.status, IngestionStatus::Succeeded);
        assert_eq!(done.started_at, failed.started_at);
        assert_eq!(
            f.builder.built_aliases(),
            vec!["b-docs".to_string(), "a-docs".to_string(), "a-docs".to_string()]
        );
        assert_eq!(f.catalog.current().version, 4);
    }

    #[tokio::test]
    async fn resume_of_unknown_job_is_rejected() {
        let f = fixture(ReindexSettings::default());
        let request = ReindexRequest {
            resume_job_id: Some("reindex-nope".into()),
            ..ReindexRequest::default()
        };
        let err = f.orchestrator.run(request, JobEvents::detached()).await.unwrap_err();
        assert!(matches!(err, ReindexError::JobNotFound(id) if id == "reindex-nope"));
        assert!(!f.orchestrator.is_running());
    }

    #[tokio::test]
    async fn resume_of_succeeded_job_is_invalid_state() {
        let f = fixture(ReindexSettings::default());
        let done = f
            .orchestrator
            .run(ReindexRequest::default(), JobEvents::detached())
            .await
            .unwrap();
        let request = ReindexRequest {
            resume_job_id: Some(done.job_id),
            ..ReindexRequest::default()
        };
        let err = f.orchestrator.run(request, JobEvents::detached()).await.unwrap_err();
        assert!(matches!(err, ReindexError::Recovery(RecoveryError::NotResumable { .. })));
    }

    #[test]
    fn second_trigger_is_rejected_while_running() {
        let f = fixture(ReindexSettings::default());
        let first = f.orchestrator.prepare(&ReindexRequest::default()).unwrap();
        assert!(f.orchestrator.is_running());
        let err = f.orchestrator.prepare(&ReindexRequest::default()).err().unwrap();
        assert!(matches!(err, ReindexError::AlreadyRunning));
        drop(first);
        assert!(f.orchestrator.prepare(&ReindexRequest::default()).is_ok());
    }

    #[tokio::test]
    async fn begin_streams_until_completion() {
        let f = fixture(ReindexSettings::default());
        let (initial, stream) = f.orchestrator.begin(ReindexRequest::default()).unwrap();
        assert_eq!(initial.stage.as_deref(), Some("preparing_index"));
        assert_eq!(initial.status, IngestionStatus::Running);
        let events = drain(stream).await;
        assert!(events.len() >= 3);
        assert_eq!(events.last().unwrap().job().status, IngestionStatus::Succeeded);
    }

    #[tokio::test]
    async fn run_continues_after_listener_drops() {
        let f = fixture(ReindexSettings::default());
        let (initial, stream) = f.orchestrator.begin(ReindexRequest::default()).unwrap();
        drop(stream);
        for _ in 0..200 {
            if !f.orchestrator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let job = f.orchestrator.job(&initial.job_id).unwrap();
        assert_eq!(job.status, IngestionStatus::Succeeded);
        assert_eq!(f.catalog.current().version, 4);
    }

    #[tokio::test]
    async fn detached_failure_is_reported_and_frees_the_slot() {
        let f = fixture(ReindexSettings::default());
        f.builder.fail_on("b-docs");
        let (initial, stream) = f.orchestrator.begin(ReindexRequest::default()).unwrap();
        let events = drain(stream).await;
        assert_eq!(events.last().unwrap().job().status, IngestionStatus::Failed);
        assert!(!f.orchestrator.is_running());
        assert_eq!(f.orchestrator.job(&initial.job_id).unwrap().status, IngestionStatus::Failed);
        assert!(f.orchestrator.begin(ReindexRequest::default()).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trigger_right_after_completion_is_accepted() {
        let f = fixture_with_audit_delay(ReindexSettings::default(), Duration::from_millis(200));
        let (_, mut stream) = f.orchestrator.begin(ReindexRequest::default()).unwrap();
        loop {
            let event = stream.next().await.unwrap();
            if event.is_complete() {
                break;
            }
        }

        let (_, next) = f
            .orchestrator
            .begin(ReindexRequest::default())
            .expect("slot is free once the terminal event is observed");
        let events = drain(next).await;
        assert_eq!(events.last().unwrap().job().status, IngestionStatus::Succeeded);
        let actions = f.audit.actions();
        assert_eq!(
            actions.iter().filter(|(a, s)| a == AUDIT_ACTION && s == "success").count(),
            2
        );
    }

    #[tokio::test]
    async fn ledger_forgets_the_oldest_finished_jobs() {
        let f = fixture(ReindexSettings::default());
        let mut ids = Vec::new();
        for _ in 0..MAX_FINISHED_JOBS + 3 {
            let done = f
                .orchestrator
                .run(ReindexRequest::default(), JobEvents::detached())
                .await
                .unwrap();
            ids.push(done.job_id);
        }

        for evicted in &ids[..3] {
            assert!(f.orchestrator.job(evicted).is_none());
        }
        for kept in &ids[3..] {
            assert_eq!(f.orchestrator.job(kept).unwrap().status, IngestionStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn empty_catalog_completes_at_hundred_percent() {
        let f = fixture(ReindexSettings::default());
        f.catalog
            .save(&SourceCatalog::empty(Utc::now()))
            .unwrap();
        let done = f
            .orchestrator
            .run(ReindexRequest::default(), JobEvents::detached())
            .await
            .unwrap();
        assert_eq!(done.percent_complete, Some(100.0));
        assert_eq!(f.catalog.current().version, 1);
    }
}
