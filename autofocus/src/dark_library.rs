//! Dark-library lookup
//!
//! The library is an injected service: the controller only sees the
//! [`DarkLibrary`] trait. [`InMemoryDarkLibrary`] keeps master darks and
//! defect maps in memory and picks the best match for a capture.

use crate::config::DarkConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use starfocus_imaging::{DefectMap, ImageFrame};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Duration mismatch, in seconds, above which a substitute dark is reported
const DURATION_WARNING_SECS: f64 = 3.0;

/// Which sensor a calibration frame belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChipIdentity {
    /// Camera device name
    pub device: String,
    /// Chip on that camera, e.g. "primary" or "guide"
    pub chip: String,
    pub binning: u32,
    /// Gain, when the camera reports one
    pub gain: Option<i32>,
}

impl ChipIdentity {
    pub fn new(device: impl Into<String>, chip: impl Into<String>, binning: u32) -> Self {
        Self {
            device: device.into(),
            chip: chip.into(),
            binning,
            gain: None,
        }
    }

    pub fn with_gain(mut self, gain: i32) -> Self {
        self.gain = Some(gain);
        self
    }

    fn accepts(&self, entry: &ChipIdentity) -> bool {
        self.device == entry.device
            && self.chip == entry.chip
            && self.binning == entry.binning
            && self.gain.map_or(true, |g| entry.gain == Some(g))
    }
}

/// A stored calibration product with the conditions it was taken under
#[derive(Debug, Clone)]
pub struct CalibrationEntry<T> {
    pub chip: ChipIdentity,
    pub temperature: Option<f64>,
    pub exposure_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub data: Arc<T>,
}

impl<T> CalibrationEntry<T> {
    pub fn new(chip: ChipIdentity, temperature: Option<f64>, exposure_secs: f64, data: T) -> Self {
        Self {
            chip,
            temperature,
            exposure_secs,
            timestamp: Utc::now(),
            data: Arc::new(data),
        }
    }

    pub fn taken_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Calibration lookups needed by the dark processor
#[async_trait]
pub trait DarkLibrary: Send + Sync {
    /// Best master dark for `chip` at `temperature` and `exposure_secs`
    async fn find_dark_frame(
        &self,
        chip: &ChipIdentity,
        temperature: Option<f64>,
        exposure_secs: f64,
    ) -> Option<Arc<ImageFrame>>;

    /// Best defect map for `chip` at `temperature` and `exposure_secs`
    async fn find_defect_map(
        &self,
        chip: &ChipIdentity,
        temperature: Option<f64>,
        exposure_secs: f64,
    ) -> Option<Arc<DefectMap>>;
}

pub type SharedDarkLibrary = Arc<dyn DarkLibrary>;

/// Pairwise comparison weights between a candidate and the current best
#[derive(Debug, Clone, Copy)]
struct ScoreWeights {
    temperature: u32,
    duration: u32,
    recency: u32,
}

const DARK_WEIGHTS: ScoreWeights = ScoreWeights { temperature: 1, duration: 5, recency: 1 };
const DEFECT_WEIGHTS: ScoreWeights = ScoreWeights { temperature: 1, duration: 2, recency: 0 };

/// Award `weight` to whichever distance is smaller
fn compare(a: f64, b: f64, weight: u32) -> (u32, u32) {
    if a < b {
        (weight, 0)
    } else if b < a {
        (0, weight)
    } else {
        (0, 0)
    }
}

/// True when `candidate` outscores `best`
fn outscores<T>(
    candidate: &CalibrationEntry<T>,
    best: &CalibrationEntry<T>,
    temperature: Option<f64>,
    exposure_secs: f64,
    now: DateTime<Utc>,
    weights: ScoreWeights,
) -> bool {
    let mut candidate_score = 0;
    let mut best_score = 0;

    if let (Some(t), Some(tc), Some(tb)) = (temperature, candidate.temperature, best.temperature) {
        let (c, b) = compare((t - tc).abs(), (t - tb).abs(), weights.temperature);
        candidate_score += c;
        best_score += b;
    }

    let (c, b) = compare(
        (candidate.exposure_secs - exposure_secs).abs(),
        (best.exposure_secs - exposure_secs).abs(),
        weights.duration,
    );
    candidate_score += c;
    best_score += b;

    let age = |e: &CalibrationEntry<T>| (now - e.timestamp).num_seconds() as f64;
    let (c, b) = compare(age(candidate), age(best), weights.recency);
    candidate_score += c;
    best_score += b;

    candidate_score > best_score
}

/// Calibration library held in memory
#[derive(Debug)]
pub struct InMemoryDarkLibrary {
    darks: RwLock<Vec<CalibrationEntry<ImageFrame>>>,
    defect_maps: RwLock<Vec<CalibrationEntry<DefectMap>>>,
    temperature_tolerance: f64,
    max_age: Duration,
}

impl InMemoryDarkLibrary {
    pub fn new(temperature_tolerance: f64, max_age_days: i64) -> Self {
        Self {
            darks: RwLock::new(Vec::new()),
            defect_maps: RwLock::new(Vec::new()),
            temperature_tolerance,
            max_age: Duration::days(max_age_days),
        }
    }

    pub fn from_config(config: &DarkConfig) -> Self {
        Self::new(config.temperature_tolerance, config.max_age_days)
    }

    pub async fn add_dark(&self, entry: CalibrationEntry<ImageFrame>) {
        tracing::debug!(
            "Dark library: adding {}s dark for {}/{} bin {}",
            entry.exposure_secs,
            entry.chip.device,
            entry.chip.chip,
            entry.chip.binning
        );
        self.darks.write().await.push(entry);
    }

    pub async fn add_defect_map(&self, entry: CalibrationEntry<DefectMap>) {
        tracing::debug!(
            "Dark library: adding defect map ({} defects) for {}/{}",
            entry.data.len(),
            entry.chip.device,
            entry.chip.chip
        );
        self.defect_maps.write().await.push(entry);
    }

    fn eligible<T>(&self, entry: &CalibrationEntry<T>, chip: &ChipIdentity, temperature: Option<f64>, now: DateTime<Utc>) -> bool {
        if !chip.accepts(&entry.chip) {
            return false;
        }
        if let (Some(t), Some(te)) = (temperature, entry.temperature) {
            if (t - te).abs() > self.temperature_tolerance {
                return false;
            }
        }
        if now - entry.timestamp > self.max_age {
            tracing::info!("Dark library: skipping expired {}s entry from {}", entry.exposure_secs, entry.timestamp);
            return false;
        }
        true
    }

    fn select<'a, T>(
        &self,
        entries: &'a [CalibrationEntry<T>],
        chip: &ChipIdentity,
        temperature: Option<f64>,
        exposure_secs: f64,
        weights: ScoreWeights,
    ) -> Option<&'a CalibrationEntry<T>> {
        let now = Utc::now();
        entries
            .iter()
            .filter(|e| self.eligible(e, chip, temperature, now))
            .fold(None, |best, candidate| match best {
                Some(b) if !outscores(candidate, b, temperature, exposure_secs, now, weights) => Some(b),
                _ => Some(candidate),
            })
    }
}

#[async_trait]
impl DarkLibrary for InMemoryDarkLibrary {
    async fn find_dark_frame(
        &self,
        chip: &ChipIdentity,
        temperature: Option<f64>,
        exposure_secs: f64,
    ) -> Option<Arc<ImageFrame>> {
        let darks = self.darks.read().await;
        let best = self.select(&darks, chip, temperature, exposure_secs, DARK_WEIGHTS)?;
        if (best.exposure_secs - exposure_secs).abs() > DURATION_WARNING_SECS {
            tracing::warn!(
                "Using available dark frame with {:.1} seconds exposure. Take a dark frame with {:.1} seconds exposure for more accurate results.",
                best.exposure_secs,
                exposure_secs
            );
        }
        Some(Arc::clone(&best.data))
    }

    async fn find_defect_map(
        &self,
        chip: &ChipIdentity,
        temperature: Option<f64>,
        exposure_secs: f64,
    ) -> Option<Arc<DefectMap>> {
        let maps = self.defect_maps.read().await;
        let best = self.select(&maps, chip, temperature, exposure_secs, DEFECT_WEIGHTS)?;
        Some(Arc::clone(&best.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip() -> ChipIdentity {
        ChipIdentity::new("CCD Simulator", "primary", 1)
    }

    fn dark(value: u16) -> ImageFrame {
        ImageFrame::new(4, 4, vec![value; 16]).unwrap()
    }

    #[tokio::test]
    async fn test_duration_outweighs_temperature_and_age() {
        let library = InMemoryDarkLibrary::new(5.0, 30);
        // Closer temperature and newer, but wrong duration
        library.add_dark(CalibrationEntry::new(chip(), Some(-10.0), 60.0, dark(1))).await;
        library
            .add_dark(CalibrationEntry::new(chip(), Some(-12.0), 5.0, dark(2)).taken_at(Utc::now() - Duration::days(3)))
            .await;

        let found = library.find_dark_frame(&chip(), Some(-10.0), 5.0).await.unwrap();
        assert_eq!(found.value(0, 0), Some(2.0), "Exact duration (+5) beats temperature (+1) and recency (+1)");
    }

    #[tokio::test]
    async fn test_temperature_breaks_duration_tie() {
        let library = InMemoryDarkLibrary::new(5.0, 30);
        let taken = Utc::now() - Duration::hours(1);
        library.add_dark(CalibrationEntry::new(chip(), Some(-5.0), 10.0, dark(1)).taken_at(taken)).await;
        library.add_dark(CalibrationEntry::new(chip(), Some(-9.5), 10.0, dark(2)).taken_at(taken)).await;

        let found = library.find_dark_frame(&chip(), Some(-10.0), 10.0).await.unwrap();
        assert_eq!(found.value(0, 0), Some(2.0));
    }

    #[tokio::test]
    async fn test_filters_chip_temperature_and_age() {
        let library = InMemoryDarkLibrary::new(2.0, 30);
        library.add_dark(CalibrationEntry::new(ChipIdentity::new("Other", "primary", 1), None, 10.0, dark(1))).await;
        library.add_dark(CalibrationEntry::new(ChipIdentity::new("CCD Simulator", "primary", 2), None, 10.0, dark(2))).await;
        library.add_dark(CalibrationEntry::new(chip(), Some(5.0), 10.0, dark(3))).await;
        library
            .add_dark(CalibrationEntry::new(chip(), Some(-10.0), 10.0, dark(4)).taken_at(Utc::now() - Duration::days(45)))
            .await;

        assert!(
            library.find_dark_frame(&chip(), Some(-10.0), 10.0).await.is_none(),
            "Wrong device, binning, temperature or age must all be excluded"
        );

        // Gain only filters when the capture reports one
        library.add_dark(CalibrationEntry::new(chip().with_gain(100), Some(-10.0), 10.0, dark(5))).await;
        assert!(library.find_dark_frame(&chip(), Some(-10.0), 10.0).await.is_some());
        assert!(library.find_dark_frame(&chip().with_gain(200), Some(-10.0), 10.0).await.is_none());
    }

    #[tokio::test]
    async fn test_defect_map_prefers_duration() {
        let library = InMemoryDarkLibrary::new(5.0, 30);
        let map = |n: usize| DefectMap { width: 4, height: 4, hot: vec![(0, 0); n], cold: Vec::new() };
        library.add_defect_map(CalibrationEntry::new(chip(), Some(-10.0), 30.0, map(1))).await;
        library.add_defect_map(CalibrationEntry::new(chip(), Some(-12.0), 2.0, map(2))).await;

        let found = library.find_defect_map(&chip(), Some(-10.0), 2.0).await.unwrap();
        assert_eq!(found.len(), 2, "Duration (+2) beats temperature (+1)");
    }
}
