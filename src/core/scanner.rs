use crate::core::cluster::{Cluster, ClusterError, DuplicateClusterer};
use crate::core::exif::{CaptureTimeSource, ExifCaptureTime};
use crate::core::extractor::{DecodingLoader, ExtractionError, FeatureExtractor, ImageLoader};
use crate::core::record::{Clusterable, ImageRecord};
use crate::database::{IncrementalStore, StoreError};
use crossbeam_channel::Sender;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use walkdir::WalkDir;

/// Extensions picked up during enumeration unless configured otherwise.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No directories configured to scan")]
    NoDirectories,

    #[error("None of the configured directories could be read: {}", paths.join(", "))]
    AllDirectoriesUnreachable { paths: Vec<String> },

    #[error("Found {attempted} new images but none could be processed")]
    NothingExtractable { attempted: usize },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Clustering error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Failed to start extraction workers: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn scan thread: {0}")]
    Spawn(std::io::Error),

    #[error("Scan worker panicked")]
    WorkerPanicked,
}

/// Cooperative cancellation flag shared between a scan and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The roots one scan covers, plus its cancellation flag.
#[derive(Debug, Clone)]
pub struct ScanConfiguration {
    directories: Vec<PathBuf>,
    cancelled: CancellationToken,
}

impl ScanConfiguration {
    /// Roots are resolved to canonical paths, so aliases of one directory
    /// (symlinks, `..`) collapse into a single root. A root that doesn't
    /// exist is only made absolute. Duplicates are dropped, keeping
    /// first-seen order.
    pub fn new<I, P>(directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut seen = HashSet::new();
        let directories = directories
            .into_iter()
            .map(|dir| {
                let dir = dir.as_ref();
                fs::canonicalize(dir)
                    .or_else(|_| std::path::absolute(dir))
                    .unwrap_or_else(|_| dir.to_path_buf())
            })
            .filter(|dir| seen.insert(dir.clone()))
            .collect();

        Self {
            directories,
            cancelled: CancellationToken::new(),
        }
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancelled
    }

    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanPhase {
    Idle,
    Enumerating,
    Reconciling,
    Extracting,
    Clustering,
    Done,
    Cancelled,
    Failed,
}

/// Observation-only progress report for a UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub processed: usize,
    pub total: usize,
    pub current_file: Option<String>,
}

/// A file that could not be turned into an embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedFile {
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Every record for the files currently under the scanned roots.
    pub records: Vec<ImageRecord>,
    pub clusters: Vec<Cluster>,
    pub added: usize,
    pub removed: usize,
    pub skipped: Vec<SkippedFile>,
}

impl ScanReport {
    /// Clusters that actually contain duplicates.
    pub fn duplicate_groups(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.iter().filter(|c| !c.is_noise)
    }
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// Extraction stopped early. Records committed before cancellation stay
    /// in the store; no clustering was done.
    Cancelled { committed: usize, total: usize },
}

struct Discovery {
    roots: Vec<PathBuf>,
    /// Paths under a root that could not be walked; their records are kept.
    unreadable: Vec<PathBuf>,
    files: HashSet<String>,
}

/// Enumerate, reconcile, extract and cluster.
///
/// One pipeline may serve many scans, but only one at a time; see
/// [`ScanRunner`](crate::core::runner::ScanRunner) for supersede semantics.
pub struct ScanPipeline {
    store: Arc<IncrementalStore>,
    extractor: Arc<dyn FeatureExtractor>,
    loader: Box<dyn ImageLoader>,
    capture_time: Box<dyn CaptureTimeSource>,
    clusterer: DuplicateClusterer,
    supported_formats: HashSet<String>,
    workers: usize,
    progress_sender: Option<Sender<ScanProgress>>,
    phase: Mutex<ScanPhase>,
}

impl ScanPipeline {
    pub fn new(store: Arc<IncrementalStore>, extractor: Arc<dyn FeatureExtractor>) -> Self {
        if store.model_id() != extractor.model_id() {
            log::warn!(
                "Store was opened for model {} but extractor is {}",
                store.model_id(),
                extractor.model_id()
            );
        }

        Self {
            store,
            extractor,
            loader: Box::new(DecodingLoader),
            capture_time: Box::new(ExifCaptureTime),
            clusterer: DuplicateClusterer::default(),
            supported_formats: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            workers: num_cpus::get(),
            progress_sender: None,
            phase: Mutex::new(ScanPhase::Idle),
        }
    }

    pub fn with_loader(mut self, loader: impl ImageLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn with_capture_time_source(mut self, source: impl CaptureTimeSource + 'static) -> Self {
        self.capture_time = Box::new(source);
        self
    }

    pub fn with_clusterer(mut self, clusterer: DuplicateClusterer) -> Self {
        self.clusterer = clusterer;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_supported_formats<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.supported_formats = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    pub fn with_progress_sender(mut self, sender: Sender<ScanProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn store(&self) -> &Arc<IncrementalStore> {
        &self.store
    }

    pub fn clusterer(&self) -> &DuplicateClusterer {
        &self.clusterer
    }

    /// Current state of the most recent scan.
    pub fn phase(&self) -> ScanPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.phase(),
            ScanPhase::Enumerating
                | ScanPhase::Reconciling
                | ScanPhase::Extracting
                | ScanPhase::Clustering
        )
    }

    pub fn is_supported_format(&self, file_path: &Path) -> bool {
        if let Some(extension) = file_path.extension() {
            let ext = extension.to_string_lossy().to_lowercase();
            self.supported_formats.contains(&ext)
        } else {
            false
        }
    }

    /// Run one scan to completion or cancellation.
    ///
    /// An empty configuration is rejected before anything is touched.
    pub fn run(&self, config: &ScanConfiguration) -> Result<ScanOutcome, ScanError> {
        if config.directories().is_empty() {
            return Err(ScanError::NoDirectories);
        }

        let result = self.run_phases(config);
        match &result {
            Ok(ScanOutcome::Completed(report)) => {
                log::info!(
                    "Scan complete: {} images, {} added, {} removed, {} skipped",
                    report.records.len(),
                    report.added,
                    report.removed,
                    report.skipped.len()
                );
                self.enter(ScanPhase::Done, report.records.len(), report.records.len());
            }
            Ok(ScanOutcome::Cancelled { committed, total }) => {
                log::info!("Scan cancelled after {committed} of {total} new images");
                self.enter(ScanPhase::Cancelled, *committed, *total);
            }
            Err(e) => {
                log::error!("Scan failed: {e}");
                self.enter(ScanPhase::Failed, 0, 0);
            }
        }
        result
    }

    fn run_phases(&self, config: &ScanConfiguration) -> Result<ScanOutcome, ScanError> {
        let token = config.cancellation_token();

        self.enter(ScanPhase::Enumerating, 0, 0);
        let Some(discovery) = self.discover_files(config)? else {
            return Ok(ScanOutcome::Cancelled {
                committed: 0,
                total: 0,
            });
        };

        self.enter(ScanPhase::Reconciling, 0, discovery.files.len());
        let mut reconciliation =
            self.store
                .reconcile_under(&discovery.roots, &discovery.unreadable, &discovery.files)?;
        let stale = self.refresh_stored(&discovery.files)?;
        if !stale.is_empty() {
            log::warn!("Re-embedding {} records from an older extractor", stale.len());
            reconciliation.to_add.extend(stale);
        }

        let total = reconciliation.to_add.len();
        if token.is_cancelled() {
            return Ok(ScanOutcome::Cancelled {
                committed: 0,
                total,
            });
        }

        self.enter(ScanPhase::Extracting, 0, total);
        let (added, skipped) = self.extract_all(&reconciliation.to_add, token)?;
        self.store.flush()?;

        if token.is_cancelled() {
            return Ok(ScanOutcome::Cancelled {
                committed: added,
                total,
            });
        }

        let dimension = self.extractor.dimension();
        let records: Vec<ImageRecord> = self
            .store
            .get_all()?
            .into_iter()
            .filter(|record| discovery.files.contains(&record.identity))
            .filter(|record| record.is_well_formed() && record.dimension() == dimension)
            .collect();

        if total > 0 && added == 0 && records.is_empty() {
            return Err(ScanError::NothingExtractable { attempted: total });
        }

        self.enter(ScanPhase::Clustering, 0, records.len());
        let clusters = self.clusterer.cluster(&records)?;

        Ok(ScanOutcome::Completed(ScanReport {
            records,
            clusters,
            added,
            removed: reconciliation.to_remove.len(),
            skipped,
        }))
    }

    /// Returns `None` if cancelled while walking.
    fn discover_files(&self, config: &ScanConfiguration) -> Result<Option<Discovery>, ScanError> {
        let token = config.cancellation_token();
        let mut roots = Vec::new();
        let mut unreachable = Vec::new();
        let mut unreadable = Vec::new();
        let mut files = HashSet::new();

        for root in config.directories() {
            if token.is_cancelled() {
                return Ok(None);
            }

            if let Err(e) = fs::read_dir(root) {
                log::warn!("Skipping unreadable directory {}: {}", root.display(), e);
                unreachable.push(root.display().to_string());
                continue;
            }

            for entry in WalkDir::new(root).follow_links(false) {
                if token.is_cancelled() {
                    return Ok(None);
                }

                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                        if let Some(path) = e.path() {
                            unreadable.push(path.to_path_buf());
                        }
                        continue;
                    }
                };

                if !entry.file_type().is_file() || !self.is_supported_format(entry.path()) {
                    continue;
                }

                match entry.path().to_str() {
                    Some(path) => {
                        files.insert(path.to_string());
                    }
                    None => log::warn!("Skipping non UTF-8 path {}", entry.path().display()),
                }
            }

            roots.push(root.clone());
        }

        if roots.is_empty() {
            return Err(ScanError::AllDirectoriesUnreachable { paths: unreachable });
        }

        log::info!(
            "Found {} images under {} directories",
            files.len(),
            roots.len()
        );
        Ok(Some(Discovery {
            roots,
            unreadable,
            files,
        }))
    }

    /// Fill in capture times that could not be resolved when first stored,
    /// and return the records whose embeddings the current extractor can't
    /// have produced. Those need embedding again.
    fn refresh_stored(&self, files: &HashSet<String>) -> Result<BTreeSet<String>, StoreError> {
        let dimension = self.extractor.dimension();
        let mut stale = BTreeSet::new();

        for mut record in self.store.get_all()? {
            if !files.contains(&record.identity) {
                continue;
            }
            if record.dimension() != dimension || !record.is_well_formed() {
                stale.insert(record.identity);
                continue;
            }
            if record.captured_at != 0 {
                continue;
            }
            let captured_at = self.capture_time.captured_at(Path::new(&record.identity));
            if captured_at != 0 {
                record.captured_at = captured_at;
                self.store.upsert(&record)?;
            }
        }
        Ok(stale)
    }

    fn extract_all(
        &self,
        to_add: &BTreeSet<String>,
        token: &CancellationToken,
    ) -> Result<(usize, Vec<SkippedFile>), ScanError> {
        let total = to_add.len();
        if total == 0 {
            return Ok((0, Vec::new()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("dupimg-extract-{i}"))
            .build()?;

        let processed = AtomicUsize::new(0);
        let added = AtomicUsize::new(0);
        let skipped = Mutex::new(Vec::new());
        let files: Vec<&String> = to_add.iter().collect();

        pool.install(|| {
            files
                .par_iter()
                .try_for_each(|identity| -> Result<(), StoreError> {
                    // Checked between files; an embedding in flight still completes.
                    if token.is_cancelled() {
                        return Ok(());
                    }

                    match self.extract_one(Path::new(identity.as_str())) {
                        Ok(record) => {
                            self.store.upsert(&record)?;
                            added.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            log::warn!("Skipping {}: {}", identity, e);
                            skipped
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(SkippedFile {
                                    identity: identity.to_string(),
                                    reason: e.to_string(),
                                });
                        }
                    }

                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    self.send_progress(ScanProgress {
                        phase: ScanPhase::Extracting,
                        processed: done,
                        total,
                        current_file: Some(identity.to_string()),
                    });
                    Ok(())
                })
        })?;

        let skipped = skipped.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok((added.into_inner(), skipped))
    }

    fn extract_one(&self, path: &Path) -> Result<ImageRecord, ExtractionError> {
        let image = self.loader.load(path, self.extractor.input_size())?;
        let embedding = self.extractor.embed(&image)?;

        let expected = self.extractor.dimension();
        if embedding.len() != expected {
            return Err(ExtractionError::DimensionMismatch {
                expected,
                found: embedding.len(),
            });
        }

        let captured_at = self.capture_time.captured_at(path);
        Ok(ImageRecord::new(path.to_string_lossy(), captured_at, embedding))
    }

    fn set_phase(&self, phase: ScanPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn enter(&self, phase: ScanPhase, processed: usize, total: usize) {
        log::debug!("Scan phase: {:?}", phase);
        self.set_phase(phase);
        self.send_progress(ScanProgress {
            phase,
            processed,
            total,
            current_file: None,
        });
    }

    fn send_progress(&self, progress: ScanProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }
}
