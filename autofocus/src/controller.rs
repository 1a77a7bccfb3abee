//! Autofocus controller
//!
//! Owns the run state and drives capture → measure → decide → move until the
//! focus strategy converges or fails. Every device call is raced against the
//! abort signal, so cancellation never waits for a slow exposure or move.
//! Progress is published on a broadcast channel; nothing reads it back.

use crate::algorithm::{
    AbsoluteFocusAlgorithm, FocusDecision, FocusStrategy, LinearFocusAlgorithm, Measurement, RelativeFocusAlgorithm,
};
use crate::config::{FocusAlgorithm, FocusConfig};
use crate::dark_library::SharedDarkLibrary;
use crate::dark_processor::{DarkProcessor, DenoiseOutcome};
use crate::device::{CaptureRequest, SharedFocusDevice};
use crate::error::{FocusError, FocusFailure, FocusResult};
use crate::events::{FocusEvent, FocusState};
use crate::state::{FocusRunState, FocusSample};
use serde::{Deserialize, Serialize};
use starfocus_imaging::{FrameMetric, ImageFrame, MetricKind, StarMetricExtractor};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};

/// Turns a calibrated frame into a focus metric
pub trait FrameMeasurer: Send + Sync {
    fn measure_frame(&self, frame: &ImageFrame) -> FrameMetric;
}

impl FrameMeasurer for StarMetricExtractor {
    fn measure_frame(&self, frame: &ImageFrame) -> FrameMetric {
        // Capture sub-framing already selected the region of interest
        self.measure(frame, None)
    }
}

/// Result of a focus run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusOutcome {
    pub success: bool,
    /// Final focuser position
    pub position: i32,
    /// Metric at `position` on success, best metric seen otherwise
    pub metric: Option<f64>,
    pub iterations: u32,
    pub samples: Vec<FocusSample>,
    pub failure: Option<FocusFailure>,
}

impl FocusOutcome {
    /// Turn a failed run into [`FocusError::Failed`]
    pub fn into_result(self) -> FocusResult<Self> {
        match self.failure.clone() {
            Some(failure) => Err(FocusError::Failed(failure)),
            None => Ok(self),
        }
    }
}

/// Metric the strategies minimise. Fourier power grows with sharpness, so
/// its reciprocal is used.
pub fn to_measurement(metric: &FrameMetric) -> Measurement {
    if !metric.is_valid() {
        return Measurement::invalid();
    }
    let value = if metric.kind.lower_is_better() { metric.value } else { 1.0 / metric.value };
    Measurement::new(value, metric.weight, metric.star_count)
}

fn reported_metric(kind: MetricKind, value: f64) -> f64 {
    if kind.lower_is_better() || value == 0.0 {
        value
    } else {
        1.0 / value
    }
}

/// Resolves once an abort has been requested
async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn guarded<T>(abort: &mut watch::Receiver<bool>, operation: impl Future<Output = FocusResult<T>>) -> FocusResult<T> {
    tokio::select! {
        result = operation => result,
        _ = aborted(abort) => Err(FocusError::Aborted),
    }
}

/// The autofocus state machine
pub struct FocusController {
    config: FocusConfig,
    device: SharedFocusDevice,
    measurer: Arc<dyn FrameMeasurer>,
    dark: Option<DarkProcessor>,
    state: Arc<RwLock<FocusState>>,
    event_tx: broadcast::Sender<FocusEvent>,
    abort_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl FocusController {
    pub fn new(config: FocusConfig, device: SharedFocusDevice, measurer: Arc<dyn FrameMeasurer>) -> FocusResult<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        let (abort_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            device,
            measurer,
            dark: None,
            state: Arc::new(RwLock::new(FocusState::Idle)),
            event_tx,
            abort_tx,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Controller measuring with a [`StarMetricExtractor`] built from the config
    pub fn with_extractor(config: FocusConfig, device: SharedFocusDevice) -> FocusResult<Self> {
        let extractor = StarMetricExtractor::new(config.metric.clone());
        Self::new(config, device, Arc::new(extractor))
    }

    /// Calibrate focus frames from `library` when dark calibration is enabled
    pub fn with_dark_library(mut self, library: SharedDarkLibrary) -> Self {
        if self.config.dark.enabled {
            self.dark = Some(DarkProcessor::new(library, self.config.dark.use_defect_map));
        } else {
            tracing::debug!("Dark calibration disabled, ignoring dark library");
        }
        self
    }

    pub fn config(&self) -> &FocusConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FocusEvent> {
        self.event_tx.subscribe()
    }

    pub async fn state(&self) -> FocusState {
        *self.state.read().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request cancellation of the active run or loop. No-op when idle.
    pub async fn abort(&self) -> FocusResult<()> {
        if !self.is_running() {
            tracing::debug!("Abort requested while autofocus is idle");
            return Ok(());
        }
        if self.abort_tx.send_replace(true) {
            return Ok(());
        }
        tracing::info!("Aborting autofocus");
        self.device.abort().await.map_err(|e| FocusError::device("abort", e))
    }

    /// Run one autofocus pass to completion.
    ///
    /// Focus failures come back as an unsuccessful [`FocusOutcome`]; device
    /// faults, cancellation and a concurrent run are errors. Either way a
    /// single [`FocusEvent::Completed`] is emitted.
    pub async fn run(&self) -> FocusResult<FocusOutcome> {
        let mut abort = self.begin()?;
        let result = self.run_inner(&mut abort).await;

        let (state, success, position, metric, message) = match &result {
            Ok(outcome) => (
                if outcome.success { FocusState::Converged } else { FocusState::Failed },
                outcome.success,
                outcome.position,
                outcome.metric,
                match &outcome.failure {
                    Some(failure) => format!("Autofocus failed: {}", failure),
                    None => format!("Autofocus complete at position {}", outcome.position),
                },
            ),
            Err(e) => {
                tracing::warn!("Autofocus ended: {}", e);
                let state = if matches!(e, FocusError::Aborted) { FocusState::Aborted } else { FocusState::Failed };
                let position = self.device.focuser_position().await.unwrap_or(0);
                (state, false, position, None, format!("Autofocus ended: {}", e))
            }
        };
        self.transition(state, Some(message.clone())).await;
        let completed = FocusEvent::Completed { success, position, metric, message };
        let _ = self.event_tx.send(completed);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Capture and measure continuously, without moving the focuser, until
    /// aborted. Returns the number of frames measured.
    pub async fn run_loop(&self) -> FocusResult<u32> {
        let mut abort = self.begin()?;
        let position = self.device.focuser_position().await.unwrap_or(0);
        self.transition(FocusState::Looping, Some("Looping focus frames".to_string())).await;

        let mut frames = 0;
        let result = loop {
            if *abort.borrow() {
                break Ok(frames);
            }
            match self.capture(&mut abort).await {
                Ok(frame) => {
                    self.measure(&frame, position);
                    frames += 1;
                }
                Err(FocusError::Aborted) => break Ok(frames),
                Err(e) => break Err(e),
            }
        };

        let state = if result.is_ok() { FocusState::Idle } else { FocusState::Failed };
        self.transition(state, Some(format!("Focus loop stopped after {} frames", frames))).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn begin(&self) -> FocusResult<watch::Receiver<bool>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FocusError::AlreadyRunning);
        }
        self.abort_tx.send_replace(false);
        Ok(self.abort_tx.subscribe())
    }

    async fn transition(&self, state: FocusState, message: Option<String>) {
        *self.state.write().await = state;
        let _ = self.event_tx.send(FocusEvent::StateChanged(state));
        if let Some(message) = message {
            tracing::info!("{}", message);
            let _ = self.event_tx.send(FocusEvent::Message(message));
        }
    }

    fn notify(&self, message: String) {
        tracing::info!("{}", message);
        let _ = self.event_tx.send(FocusEvent::Message(message));
    }

    async fn capture(&self, abort: &mut watch::Receiver<bool>) -> FocusResult<ImageFrame> {
        if !self.device.is_connected().await {
            return Err(FocusError::Disconnected("capture".to_string()));
        }
        let request = CaptureRequest {
            exposure_secs: self.config.exposure_secs,
            region: self.config.region,
            binning: self.config.binning,
        };
        let captured = guarded(abort, async {
            self.device.capture(&request).await.map_err(|e| FocusError::device("capture", e))
        })
        .await?;

        let Some(processor) = &self.dark else {
            return Ok(captured.frame);
        };
        let outcome = guarded(abort, processor.denoise(captured)).await?;
        if let DenoiseOutcome::Unmodified { warning, .. } = &outcome {
            self.notify(format!("Dark calibration skipped: {}", warning));
        }
        Ok(outcome.into_frame())
    }

    fn measure(&self, frame: &ImageFrame, position: i32) -> FrameMetric {
        let metric = self.measurer.measure_frame(frame);
        let _ = self.event_tx.send(FocusEvent::SampleMeasured {
            position,
            value: metric.value,
            weight: metric.weight,
            star_count: metric.star_count,
        });
        metric
    }

    async fn settle(&self, abort: &mut watch::Receiver<bool>) -> FocusResult<()> {
        if self.config.settle_time_ms == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.config.settle_time_ms)) => Ok(()),
            _ = aborted(abort) => Err(FocusError::Aborted),
        }
    }

    fn outcome(&self, state: &FocusRunState, kind: MetricKind, position: i32, failure: Option<FocusFailure>) -> FocusOutcome {
        let metric = match &failure {
            None => state.samples.last().map(|s| reported_metric(kind, s.metric)),
            Some(_) => state.min_metric.map(|m| reported_metric(kind, m)),
        };
        FocusOutcome {
            success: failure.is_none(),
            position,
            metric,
            iterations: state.iteration,
            samples: state.samples.clone(),
            failure,
        }
    }

    async fn run_inner(&self, abort: &mut watch::Receiver<bool>) -> FocusResult<FocusOutcome> {
        if !self.device.is_connected().await {
            return Err(FocusError::NotConnected);
        }
        let absolute = self.device.can_absolute_move().await;

        let mut strategy: Box<dyn FocusStrategy> = if absolute {
            let start = guarded(abort, async {
                self.device.focuser_position().await.map_err(|e| FocusError::device("focuser position", e))
            })
            .await?;
            let range = guarded(abort, async {
                self.device.focuser_limits().await.map_err(|e| FocusError::device("focuser limits", e))
            })
            .await?;
            self.notify(format!(
                "Starting autofocus at {} (range {}..{}), step {}",
                start, range.0, range.1, self.config.step_size
            ));
            match self.config.algorithm {
                FocusAlgorithm::Linear => Box::new(LinearFocusAlgorithm::new(self.config.clone(), range, start)),
                FocusAlgorithm::Iterative | FocusAlgorithm::Polynomial => {
                    Box::new(AbsoluteFocusAlgorithm::new(self.config.clone(), range, start))
                }
            }
        } else {
            let start = self.device.focuser_position().await.unwrap_or(0);
            self.notify(format!("Starting relative autofocus, step {}", self.config.step_size));
            Box::new(RelativeFocusAlgorithm::new(self.config.clone(), start))
        };

        loop {
            if *abort.borrow() {
                return Err(FocusError::Aborted);
            }
            let position = strategy.state().current_position;
            self.transition(FocusState::Capturing, Some(format!("Capturing focus frame at {}", position))).await;
            let frame = self.capture(abort).await?;

            self.transition(FocusState::Measuring, Some(format!("Measuring frame at {}", position))).await;
            let metric = self.measure(&frame, position);
            let kind = metric.kind;
            if metric.is_valid() {
                self.notify(format!("Frame at {}: {:?} {:.3} from {} stars", position, kind, metric.value, metric.star_count));
            }

            match strategy.next(&to_measurement(&metric)) {
                FocusDecision::MoveTo { position: target } => {
                    self.transition(FocusState::Moving, Some(format!("Moving focuser to {}", target))).await;
                    guarded(abort, async {
                        self.device.move_absolute(target).await.map_err(|e| FocusError::device("move", e))
                    })
                    .await?;
                    self.settle(abort).await?;
                }
                FocusDecision::MoveRelative { steps, direction } => {
                    self.transition(FocusState::Moving, Some(format!("Moving focuser {:?} by {}", direction, steps))).await;
                    guarded(abort, async {
                        self.device.move_relative(steps, direction).await.map_err(|e| FocusError::device("move", e))
                    })
                    .await?;
                    self.settle(abort).await?;
                }
                FocusDecision::Recapture => {}
                FocusDecision::Converged { position, .. } => {
                    return Ok(self.outcome(strategy.state(), kind, position, None));
                }
                FocusDecision::Failed(failure) => {
                    let start = strategy.state().start_position;
                    let mut position = strategy.state().current_position;
                    if absolute && position != start {
                        self.notify(format!("Restoring focuser to start position {}", start));
                        match self.device.move_absolute(start).await {
                            Ok(()) => position = start,
                            Err(e) => tracing::warn!("Failed to restore focuser position: {}", e),
                        }
                    }
                    return Ok(self.outcome(strategy.state(), kind, position, Some(failure)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dark_library::{ChipIdentity, InMemoryDarkLibrary};
    use crate::device::{CapturedFrame, DeviceResult, FocusDevice, NullFocusDevice};
    use crate::state::FocusDirection;
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use starfocus_imaging::INVALID_MEASURE;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn v_curve(position: f64) -> f64 {
        1.5 * (1.0 + ((position - 5300.0) / 150.0).powi(2)).sqrt()
    }

    /// Focuser whose frames carry its own position in their single pixel
    struct FakeFocuser {
        position: Mutex<i32>,
        absolute: bool,
        moves: Mutex<Vec<i32>>,
        captures: AtomicU32,
        aborts: AtomicU32,
        capture_delay_ms: u64,
        disconnect_after: Option<u32>,
    }

    impl FakeFocuser {
        fn new(start: i32, absolute: bool) -> Self {
            Self {
                position: Mutex::new(start),
                absolute,
                moves: Mutex::new(Vec::new()),
                captures: AtomicU32::new(0),
                aborts: AtomicU32::new(0),
                capture_delay_ms: 0,
                disconnect_after: None,
            }
        }

        fn moves(&self) -> Vec<i32> {
            self.moves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FocusDevice for FakeFocuser {
        async fn is_connected(&self) -> bool {
            self.disconnect_after.map_or(true, |n| self.captures.load(Ordering::SeqCst) < n)
        }

        async fn can_absolute_move(&self) -> bool {
            self.absolute
        }

        async fn focuser_position(&self) -> DeviceResult<i32> {
            Ok(*self.position.lock().unwrap())
        }

        async fn focuser_limits(&self) -> DeviceResult<(i32, i32)> {
            Ok((0, 100_000))
        }

        async fn move_absolute(&self, position: i32) -> DeviceResult<()> {
            *self.position.lock().unwrap() = position;
            self.moves.lock().unwrap().push(position);
            Ok(())
        }

        async fn move_relative(&self, steps: i32, direction: FocusDirection) -> DeviceResult<()> {
            let mut position = self.position.lock().unwrap();
            *position += steps * direction.sign();
            self.moves.lock().unwrap().push(*position);
            Ok(())
        }

        async fn capture(&self, request: &CaptureRequest) -> DeviceResult<CapturedFrame> {
            if self.capture_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.capture_delay_ms)).await;
            }
            self.captures.fetch_add(1, Ordering::SeqCst);
            let position = *self.position.lock().unwrap();
            let frame = ImageFrame::new(1, 1, vec![position as f64]).map_err(|e| e.to_string())?;
            Ok(CapturedFrame {
                frame,
                chip: ChipIdentity::new("Fake", "primary", request.binning),
                exposure_secs: request.exposure_secs,
                offset_x: 0,
                offset_y: 0,
                temperature: None,
            })
        }

        async fn abort(&self) -> DeviceResult<()> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CurveMeasurer;

    impl FrameMeasurer for CurveMeasurer {
        fn measure_frame(&self, frame: &ImageFrame) -> FrameMetric {
            let position = frame.value(0, 0).unwrap_or(0.0);
            FrameMetric { value: v_curve(position), weight: 1.0, star_count: 12, ..FrameMetric::invalid(MetricKind::Hfr) }
        }
    }

    fn config() -> FocusConfig {
        FocusConfig { step_size: 100, settle_time_ms: 0, ..Default::default() }
    }

    fn controller(device: Arc<FakeFocuser>, config: FocusConfig) -> FocusController {
        FocusController::new(config, device, Arc::new(CurveMeasurer)).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<FocusEvent>) -> Vec<FocusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_absolute_run_converges() {
        let device = Arc::new(FakeFocuser::new(5000, true));
        let controller = controller(device.clone(), config());
        let mut rx = controller.subscribe();

        let outcome = controller.run().await.unwrap();
        assert!(outcome.success, "Run failed: {:?}", outcome.failure);
        assert!((outcome.position - 5300).abs() <= 50, "Converged at {}", outcome.position);
        assert_eq!(device.moves().last(), Some(&outcome.position), "Focuser rests at the reported position");
        assert_eq!(controller.state().await, FocusState::Converged);
        assert!(!controller.is_running());

        let events = drain(&mut rx);
        let completed = events.iter().filter(|e| matches!(e, FocusEvent::Completed { .. })).count();
        assert_eq!(completed, 1, "Completion is signalled exactly once");
        assert!(events.contains(&FocusEvent::StateChanged(FocusState::Moving)));
        let samples = events.iter().filter(|e| matches!(e, FocusEvent::SampleMeasured { .. })).count();
        assert_eq!(samples, outcome.samples.len());
    }

    #[tokio::test]
    async fn test_linear_run_converges() -> anyhow::Result<()> {
        let device = Arc::new(FakeFocuser::new(5000, true));
        let config = FocusConfig { algorithm: FocusAlgorithm::Linear, ..config() };
        let outcome = controller(device.clone(), config).run().await?.into_result()?;
        assert!((outcome.position - 5300).abs() <= 25, "Converged at {}", outcome.position);
        let moves = device.moves();
        assert_eq!(moves.first(), Some(&5500), "Sweep starts outside focus");
        assert_eq!(moves.last(), Some(&outcome.position));
        Ok(())
    }

    #[tokio::test]
    async fn test_relative_run_converges() -> anyhow::Result<()> {
        let device = Arc::new(FakeFocuser::new(5800, false));
        let config = FocusConfig { step_size: 200, ..config() };
        let outcome = controller(device.clone(), config).run().await?.into_result()?;
        assert!(outcome.success, "Run failed: {:?}", outcome.failure);
        let position = *device.position.lock().unwrap();
        assert!((position - 5300).abs() <= 100, "Focuser ended at {}", position);
        assert_eq!(outcome.position, position, "Dead reckoning matches the device");
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_restores_start_position() {
        let device = Arc::new(FakeFocuser::new(5000, true));
        let config = FocusConfig { max_travel: 150, ..config() };
        let controller = controller(device.clone(), config);
        let mut rx = controller.subscribe();

        let outcome = controller.run().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(FocusFailure::MaxTravel { target: 5200, start: 5000 }));
        assert_eq!(outcome.position, 5000);
        assert_eq!(device.moves(), vec![5100, 5000], "Focuser returns to where it started");
        assert_eq!(controller.state().await, FocusState::Failed);
        assert!(matches!(outcome.into_result(), Err(FocusError::Failed(FocusFailure::MaxTravel { .. }))));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, FocusEvent::Completed { success: false, .. })));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent_and_single_run() {
        let device = Arc::new(FakeFocuser { capture_delay_ms: 200, ..FakeFocuser::new(5000, true) });
        let controller = Arc::new(controller(device.clone(), config()));

        assert!(controller.abort().await.is_ok(), "Abort while idle is a no-op");
        assert_eq!(device.aborts.load(Ordering::SeqCst), 0);

        let runner = controller.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(controller.is_running());
        assert!(matches!(controller.run().await, Err(FocusError::AlreadyRunning)));

        controller.abort().await.unwrap();
        controller.abort().await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FocusError::Aborted)), "Got {:?}", result);
        assert_eq!(device.aborts.load(Ordering::SeqCst), 1, "Device abort issued once");
        assert_eq!(controller.state().await, FocusState::Aborted);
        assert!(controller.abort().await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_mid_run_is_fatal() {
        let device = Arc::new(FakeFocuser { disconnect_after: Some(2), ..FakeFocuser::new(5000, true) });
        let controller = controller(device, config());
        let result = controller.run().await;
        assert!(matches!(result, Err(FocusError::Disconnected(_))), "Got {:?}", result);
        assert_eq!(controller.state().await, FocusState::Failed);
    }

    #[tokio::test]
    async fn test_loop_measures_until_aborted() {
        let device = Arc::new(FakeFocuser { capture_delay_ms: 5, ..FakeFocuser::new(5300, true) });
        let controller = Arc::new(controller(device.clone(), config()));
        let mut rx = controller.subscribe();

        let runner = controller.clone();
        let handle = tokio::spawn(async move { runner.run_loop().await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(controller.state().await, FocusState::Looping);
        controller.abort().await.unwrap();

        let frames = handle.await.unwrap().unwrap();
        assert!(frames >= 1, "At least one frame measured");
        assert!(device.moves().is_empty(), "Looping never moves the focuser");
        assert_eq!(controller.state().await, FocusState::Idle);
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, FocusEvent::Completed { .. })), "Looping is not a focus run");
    }

    #[tokio::test]
    async fn test_blank_frames_fail_with_extractor() {
        let controller = FocusController::with_extractor(config(), Arc::new(NullFocusDevice::default())).unwrap();
        let outcome = controller.run().await.unwrap();
        assert!(!outcome.success, "No stars can never converge");
        assert!(outcome.failure.is_some());
        assert!(outcome.samples.iter().all(|s| s.penalty), "Every sample is a penalty");
    }

    #[tokio::test]
    async fn test_missing_dark_is_reported_and_run_continues() {
        let device = Arc::new(FakeFocuser::new(5000, true));
        let config = FocusConfig {
            dark: crate::config::DarkConfig { enabled: true, ..Default::default() },
            ..config()
        };
        let library = Arc::new(InMemoryDarkLibrary::from_config(&config.dark));
        let controller = controller(device, config).with_dark_library(library);
        let mut rx = controller.subscribe();

        let outcome = controller.run().await.unwrap();
        assert!(outcome.success, "Missing calibration data is not fatal");
        let events = drain(&mut rx);
        assert!(
            events.iter().any(|e| matches!(e, FocusEvent::Message(m) if m.contains("Dark calibration skipped"))),
            "A warning is published"
        );
    }

    #[test]
    fn test_fourier_power_is_inverted() {
        let metric = FrameMetric { value: 4.0, weight: 1.0, star_count: 0, ..FrameMetric::invalid(MetricKind::FourierPower) };
        let measurement = to_measurement(&metric);
        assert_relative_eq!(measurement.value, 0.25);
        assert_relative_eq!(reported_metric(MetricKind::FourierPower, measurement.value), 4.0);

        let invalid = to_measurement(&FrameMetric::invalid(MetricKind::Hfr));
        assert_eq!(invalid.value, INVALID_MEASURE);
        assert!(!invalid.is_valid());
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = FocusOutcome {
            success: false,
            position: 5000,
            metric: Some(2.0),
            iterations: 4,
            samples: Vec::new(),
            failure: Some(FocusFailure::Deadlock { position: 5100 }),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: FocusOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }
}
