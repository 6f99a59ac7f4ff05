use crate::core::scanner::{ScanConfiguration, ScanError, ScanOutcome, ScanPipeline};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

struct ActiveScan {
    config: ScanConfiguration,
    handle: JoinHandle<Result<ScanOutcome, ScanError>>,
}

impl ActiveScan {
    fn join(self) -> Result<ScanOutcome, ScanError> {
        self.handle
            .join()
            .unwrap_or(Err(ScanError::WorkerPanicked))
    }
}

/// Runs scans on a background thread, at most one at a time.
///
/// Starting a scan while another is active cancels the old one and waits
/// for it to finish before the new one begins.
pub struct ScanRunner {
    pipeline: Arc<ScanPipeline>,
    active: Mutex<Option<ActiveScan>>,
}

impl ScanRunner {
    pub fn new(pipeline: Arc<ScanPipeline>) -> Self {
        Self {
            pipeline,
            active: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<ScanPipeline> {
        &self.pipeline
    }

    /// Supersede any running scan with a fresh one over `directories`.
    pub fn start(&self, directories: Vec<PathBuf>) -> Result<ScanConfiguration, ScanError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = active.take() {
            previous.config.cancel();
            match previous.join() {
                Ok(_) => log::info!("Previous scan stopped, starting a new one"),
                Err(e) => log::warn!("Previous scan ended with an error: {e}"),
            }
        }

        let config = ScanConfiguration::new(directories);
        let pipeline = self.pipeline.clone();
        let worker_config = config.clone();
        let handle = thread::Builder::new()
            .name("dupimg-scan".to_string())
            .spawn(move || pipeline.run(&worker_config))
            .map_err(ScanError::Spawn)?;

        *active = Some(ActiveScan {
            config: config.clone(),
            handle,
        });
        Ok(config)
    }

    /// Ask the active scan to stop; returns immediately.
    pub fn cancel(&self) {
        if let Some(scan) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            scan.config.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|scan| !scan.handle.is_finished())
    }

    /// Block until the active scan ends. `None` if nothing was started.
    pub fn wait(&self) -> Option<Result<ScanOutcome, ScanError>> {
        let scan = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(scan.join())
    }
}

impl Drop for ScanRunner {
    fn drop(&mut self) {
        self.cancel();
        let _ = self.wait();
    }
}
