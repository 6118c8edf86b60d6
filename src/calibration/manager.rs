//! Calibration cache with copy-on-replace snapshots.

use super::dataset::{CalibrationDataset, CalibrationType};
use super::format::CalibrationFile;
use super::CalibrationError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Immutable set of the currently active datasets.
///
/// A processing call holds one `Arc<CalibrationSet>` for its whole duration,
/// so a concurrent reload can never hand it a mix of old and new data.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    /// Active dark frame
    pub dark_frame: Option<Arc<CalibrationDataset>>,
    /// Active gain map
    pub gain_map: Option<Arc<CalibrationDataset>>,
    /// Active defect map
    pub defect_map: Option<Arc<CalibrationDataset>>,
    /// Active scatter parameters
    pub scatter_params: Option<Arc<CalibrationDataset>>,
}

impl CalibrationSet {
    /// Dataset of `kind`, if one is active.
    pub fn get(&self, kind: CalibrationType) -> Option<&Arc<CalibrationDataset>> {
        match kind {
            CalibrationType::DarkFrame => self.dark_frame.as_ref(),
            CalibrationType::GainMap => self.gain_map.as_ref(),
            CalibrationType::DefectMap => self.defect_map.as_ref(),
            CalibrationType::ScatterParams => self.scatter_params.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: CalibrationType) -> &mut Option<Arc<CalibrationDataset>> {
        match kind {
            CalibrationType::DarkFrame => &mut self.dark_frame,
            CalibrationType::GainMap => &mut self.gain_map,
            CalibrationType::DefectMap => &mut self.defect_map,
            CalibrationType::ScatterParams => &mut self.scatter_params,
        }
    }
}

/// Per-type calibration status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationStatus {
    /// Dataset kind
    pub kind: CalibrationType,
    /// A dataset is cached
    pub loaded: bool,
    /// The cached dataset passed every check
    pub valid: bool,
    /// Older than the configured maximum age (advisory)
    pub stale: bool,
    /// Acquisition time of the cached dataset
    pub acquired_at: Option<DateTime<Utc>>,
    /// File the cached dataset came from
    pub source: Option<PathBuf>,
    /// Why the most recent load of this kind was rejected, if it was
    pub last_rejection: Option<String>,
}

/// Owns the correction datasets for one detector geometry.
pub struct CalibrationManager {
    width: u32,
    height: u32,
    max_age: Option<Duration>,
    current: RwLock<Arc<CalibrationSet>>,
    rejections: Mutex<HashMap<CalibrationType, String>>,
}

impl std::fmt::Debug for CalibrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationManager")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl CalibrationManager {
    /// Create an empty manager for `width` x `height` frames.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_age: None,
            current: RwLock::new(Arc::new(CalibrationSet::default())),
            rejections: Mutex::new(HashMap::new()),
        }
    }

    /// Flag datasets older than `max_age` as stale.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Configured frame dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Load a dark frame.
    pub fn load_dark_frame<P: AsRef<Path>>(&self, path: P) -> Arc<CalibrationDataset> {
        self.load(CalibrationType::DarkFrame, path.as_ref())
    }

    /// Load a gain map.
    pub fn load_gain_map<P: AsRef<Path>>(&self, path: P) -> Arc<CalibrationDataset> {
        self.load(CalibrationType::GainMap, path.as_ref())
    }

    /// Load a defect map.
    pub fn load_defect_map<P: AsRef<Path>>(&self, path: P) -> Arc<CalibrationDataset> {
        self.load(CalibrationType::DefectMap, path.as_ref())
    }

    /// Load scatter parameters.
    pub fn load_scatter_params<P: AsRef<Path>>(&self, path: P) -> Arc<CalibrationDataset> {
        self.load(CalibrationType::ScatterParams, path.as_ref())
    }

    /// Replace the `kind` dataset at runtime.
    ///
    /// Processing calls already holding a snapshot keep the old dataset.
    pub fn hot_reload<P: AsRef<Path>>(&self, kind: CalibrationType, path: P) -> Arc<CalibrationDataset> {
        let path = path.as_ref();
        info!(kind = %kind, path = %path.display(), "Hot-reloading calibration");
        self.load(kind, path)
    }

    /// Read and verify `path` as a `kind` dataset.
    ///
    /// On success the dataset replaces the cached one. On failure an invalid
    /// dataset without payload is returned and the cache is left alone.
    pub fn load(&self, kind: CalibrationType, path: &Path) -> Arc<CalibrationDataset> {
        match CalibrationFile::read(path, kind, self.width, self.height) {
            Ok(dataset) => {
                let dataset = Arc::new(dataset);
                info!(
                    kind = %kind,
                    path = %path.display(),
                    acquired_at = %dataset.acquired_at,
                    checksum = %dataset.checksum_hex(),
                    "Calibration loaded"
                );
                self.publish(kind, Arc::clone(&dataset));
                dataset
            }
            Err(err) => {
                warn!(kind = %kind, path = %path.display(), error = %err, "Calibration rejected");
                self.rejections.lock().insert(kind, err.to_string());
                Arc::new(CalibrationDataset::invalid(kind, err.to_string()).with_source(path))
            }
        }
    }

    /// Activate an in-memory dataset, e.g. one built by [`acquisition`](super::acquisition).
    pub fn install(&self, dataset: CalibrationDataset) -> Result<Arc<CalibrationDataset>, CalibrationError> {
        if !dataset.is_valid() {
            return Err(CalibrationError::InvalidPayload(
                dataset
                    .invalid_reason()
                    .unwrap_or("dataset is invalid")
                    .to_string(),
            ));
        }
        if !dataset.matches_dimensions(self.width, self.height) {
            return Err(CalibrationError::DimensionMismatch {
                expected: (self.width, self.height),
                found: (dataset.width, dataset.height),
            });
        }
        let kind = dataset.kind;
        let dataset = Arc::new(dataset);
        self.publish(kind, Arc::clone(&dataset));
        info!(kind = %kind, "Calibration installed");
        Ok(dataset)
    }

    /// Load every conventionally named file present in `dir`.
    ///
    /// Returns the outcome per file found; missing files are skipped.
    pub fn load_directory<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Vec<(CalibrationType, Arc<CalibrationDataset>)> {
        let dir = dir.as_ref();
        CalibrationType::ALL
            .into_iter()
            .filter_map(|kind| {
                let path = dir.join(kind.file_name());
                path.is_file().then(|| (kind, self.load(kind, &path)))
            })
            .collect()
    }

    /// Remove the cached `kind` dataset.
    pub fn clear(&self, kind: CalibrationType) {
        let mut current = self.current.write();
        let mut next = CalibrationSet::clone(&current);
        *next.slot_mut(kind) = None;
        *current = Arc::new(next);
    }

    fn publish(&self, kind: CalibrationType, dataset: Arc<CalibrationDataset>) {
        {
            let mut current = self.current.write();
            let mut next = CalibrationSet::clone(&current);
            *next.slot_mut(kind) = Some(dataset);
            *current = Arc::new(next);
        }
        self.rejections.lock().remove(&kind);
    }

    /// The active datasets.
    pub fn snapshot(&self) -> Arc<CalibrationSet> {
        Arc::clone(&self.current.read())
    }

    /// Cached dataset of `kind`.
    pub fn get(&self, kind: CalibrationType) -> Option<Arc<CalibrationDataset>> {
        self.snapshot().get(kind).cloned()
    }

    /// Status of every kind, judged against the current time.
    pub fn status(&self) -> Vec<CalibrationStatus> {
        self.status_at(Utc::now())
    }

    /// Status of every kind, judged against `now`.
    pub fn status_at(&self, now: DateTime<Utc>) -> Vec<CalibrationStatus> {
        let snapshot = self.snapshot();
        let rejections = self.rejections.lock();
        CalibrationType::ALL
            .into_iter()
            .map(|kind| {
                let dataset = snapshot.get(kind);
                CalibrationStatus {
                    kind,
                    loaded: dataset.is_some(),
                    valid: dataset.is_some_and(|d| d.is_valid()),
                    stale: dataset.is_some_and(|d| self.is_stale(d, now)),
                    acquired_at: dataset.map(|d| d.acquired_at),
                    source: dataset.and_then(|d| d.source.clone()),
                    last_rejection: rejections.get(&kind).cloned(),
                }
            })
            .collect()
    }

    fn is_stale(&self, dataset: &CalibrationDataset, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.max_age else {
            return false;
        };
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => dataset.age(now) > max_age,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::dataset::CalibrationPayload;

    fn dark(width: u32, height: u32, value: f32) -> CalibrationDataset {
        CalibrationDataset::new(
            width,
            height,
            Utc::now(),
            CalibrationPayload::DarkFrame(vec![value; (width * height) as usize]),
        )
    }

    #[test]
    fn install_rejects_wrong_dimensions() {
        let manager = CalibrationManager::new(4, 4);
        let err = manager.install(dark(2, 2, 1.0)).unwrap_err();
        assert!(matches!(err, CalibrationError::DimensionMismatch { .. }));
        assert!(manager.get(CalibrationType::DarkFrame).is_none());
    }

    #[test]
    fn install_rejects_short_payload() {
        let manager = CalibrationManager::new(2, 2);
        let short = CalibrationDataset::new(2, 2, Utc::now(), CalibrationPayload::DarkFrame(vec![1.0]));
        let err = manager.install(short).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidPayload(_)));
        assert!(manager.get(CalibrationType::DarkFrame).is_none());
    }

    #[test]
    fn snapshot_is_not_affected_by_replacement() {
        let manager = CalibrationManager::new(2, 2);
        manager.install(dark(2, 2, 1.0)).unwrap();
        let before = manager.snapshot();
        manager.install(dark(2, 2, 5.0)).unwrap();

        let old = before.dark_frame.as_ref().unwrap().dark_frame().unwrap()[0];
        let new = manager.snapshot().dark_frame.as_ref().unwrap().dark_frame().unwrap()[0];
        assert_eq!(old, 1.0);
        assert_eq!(new, 5.0);
    }

    #[test]
    fn missing_file_yields_invalid_dataset() {
        let manager = CalibrationManager::new(2, 2);
        let dataset = manager.load_dark_frame("/nonexistent/dark.xcal");
        assert!(!dataset.is_valid());
        assert!(dataset.payload().is_none());

        let status = manager.status();
        assert!(!status[0].loaded);
        assert!(status[0].last_rejection.is_some());
    }

    #[test]
    fn staleness_follows_max_age() {
        let manager = CalibrationManager::new(2, 2).with_max_age(Duration::from_secs(3600));
        let mut old = dark(2, 2, 1.0);
        old.acquired_at = Utc::now() - chrono::Duration::hours(2);
        manager.install(old).unwrap();

        let status = manager.status();
        assert!(status[0].valid);
        assert!(status[0].stale);
        assert!(!status[1].loaded);
    }
}
