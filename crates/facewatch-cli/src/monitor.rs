//! The presence-verification session loop.
//!
//! Pulls frames from an [`ImageSource`] at a fixed cadence, gates each frame
//! through the cheap [`LocalDetector`] before spending a [`RemoteVerifier`]
//! call, and debounces misses into a trigger decision. The loop compensates
//! for per-iteration latency so the sampling cadence stays close to the
//! configured interval.

use facewatch_core::{DetectionBox, LocalDetector, ReferenceModel, RemoteVerifier};
use facewatch_hw::{Frame, ImageSource};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::action::TriggerAction;
use crate::preview::FrameSink;

/// Backoff before retrying a tick while the camera is unavailable.
const DEVICE_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Target wall-clock spacing between evaluated frames.
    pub sample_interval: Duration,
    /// Sustained absence required before the action fires.
    pub trigger_after: Duration,
    /// Minimum remote confidence counted as a match.
    pub confidence_threshold: f32,
    /// Keep monitoring after a trigger instead of ending the session.
    pub continue_after_trigger: bool,
    /// Publish annotated frames to the preview sink.
    pub display_overlay: bool,
}

impl MonitorConfig {
    /// Consecutive misses required to fire: round(trigger / interval),
    /// clamped to at least one full miss.
    pub fn miss_threshold(&self) -> u32 {
        let ratio = self.trigger_after.as_secs_f64() / self.sample_interval.as_secs_f64();
        (ratio.round() as u32).max(1)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.sample_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "sample interval must be positive".into(),
            ));
        }
        if self.trigger_after.is_zero() {
            return Err(SessionError::InvalidConfig(
                "trigger duration must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(SessionError::InvalidConfig(format!(
                "confidence threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}

/// How a session came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The action fired in one-shot mode.
    Triggered,
    /// The stop signal was observed at an iteration boundary.
    Cancelled,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),
    #[error("reference model has an empty fingerprint")]
    InvalidModel,
}

/// What one evaluated tick observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    /// Remote confidence reached the threshold.
    Match,
    /// No local candidate, a below-threshold confidence, or an
    /// unverifiable frame.
    Miss,
    /// The tick produced no evidence either way; counter untouched.
    Skip,
}

/// State change produced by feeding one observation to the debouncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Counter reset to zero by a match.
    Present,
    /// Counter incremented but still below threshold.
    Degrading(u32),
    /// Counter reached the threshold; action fires, counter resets.
    Triggered,
    /// Skipped tick, nothing changed.
    Unchanged,
}

/// Debounce counter: consecutive non-matching ticks, reset on any match.
/// Reaching the threshold is the sole trigger condition.
#[derive(Debug)]
struct Debounce {
    misses: u32,
    threshold: u32,
}

impl Debounce {
    fn new(threshold: u32) -> Self {
        Self { misses: 0, threshold }
    }

    fn observe(&mut self, obs: Observation) -> Transition {
        match obs {
            Observation::Match => {
                self.misses = 0;
                Transition::Present
            }
            Observation::Skip => Transition::Unchanged,
            Observation::Miss => {
                self.misses += 1;
                if self.misses >= self.threshold {
                    self.misses = 0;
                    Transition::Triggered
                } else {
                    Transition::Degrading(self.misses)
                }
            }
        }
    }
}

/// Remaining sleep to hold the sampling cadence: max(0, interval − elapsed).
fn pace(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// The monitoring session, parameterized by its pluggable capabilities.
///
/// Owns the camera for the session lifetime; every exit path releases it by
/// dropping the source.
pub struct PresenceMonitor<S, D, V, A, P> {
    pub source: S,
    pub detector: D,
    pub verifier: V,
    pub action: A,
    pub preview: P,
}

impl<S, D, V, A, P> PresenceMonitor<S, D, V, A, P>
where
    S: ImageSource,
    D: LocalDetector,
    V: RemoteVerifier,
    A: TriggerAction,
    P: FrameSink,
{
    /// Run the sampling loop until a one-shot trigger or cancellation.
    ///
    /// Cancellation is cooperative and observed only at iteration
    /// boundaries, never mid-network-call.
    pub async fn run(
        &mut self,
        model: &ReferenceModel,
        config: &MonitorConfig,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, SessionError> {
        config.validate()?;
        if !model.is_valid() {
            return Err(SessionError::InvalidModel);
        }

        let threshold = config.miss_threshold();
        let mut debounce = Debounce::new(threshold);
        tracing::info!(
            threshold,
            interval = ?config.sample_interval,
            continuous = config.continue_after_trigger,
            "monitor session started"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled);
            }
            let tick_start = Instant::now();

            if !self.source.is_available() {
                tracing::warn!(backoff = ?DEVICE_BACKOFF, "camera unavailable, retrying");
                tokio::time::sleep(DEVICE_BACKOFF).await;
                continue;
            }

            let frame = match self.source.grab() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?DEVICE_BACKOFF, "frame capture failed, retrying");
                    tokio::time::sleep(DEVICE_BACKOFF).await;
                    continue;
                }
            };

            let observation = self.evaluate(&frame, model, config).await;
            match debounce.observe(observation) {
                Transition::Present => {
                    tracing::info!("presence confirmed, counter reset");
                }
                Transition::Degrading(misses) => {
                    tracing::info!(misses, threshold, "no verified presence");
                }
                Transition::Unchanged => {}
                Transition::Triggered => {
                    tracing::info!("sustained absence, firing trigger action");
                    if let Err(e) = self.action.fire() {
                        tracing::error!(error = %e, "trigger action failed");
                    }
                    if !config.continue_after_trigger {
                        return Ok(SessionEnd::Triggered);
                    }
                }
            }

            let pause = pace(config.sample_interval, tick_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            }
        }
    }

    /// Evaluate one frame: local gate first, remote verification only when
    /// a local candidate exists.
    async fn evaluate(
        &mut self,
        frame: &Frame,
        model: &ReferenceModel,
        config: &MonitorConfig,
    ) -> Observation {
        let faces = match self.detector.detect(&frame.data, frame.width, frame.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "local detector failed, skipping tick");
                return Observation::Skip;
            }
        };

        if faces.is_empty() {
            // Cost-avoidance gate: no local candidate, the remote call is
            // not spent.
            self.publish(frame, None, config);
            return Observation::Miss;
        }

        let jpeg = match frame.to_jpeg() {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "frame encoding failed, skipping tick");
                return Observation::Skip;
            }
        };

        match self.verifier.verify(model, &jpeg).await {
            Ok(result) if result.is_match(config.confidence_threshold) => {
                self.publish(frame, result.matched_box.as_ref(), config);
                Observation::Match
            }
            Ok(result) => {
                tracing::info!(confidence = result.confidence, "face did not match");
                self.publish(frame, None, config);
                Observation::Miss
            }
            Err(e) => {
                // Policy: an unverifiable frame counts as a miss. It is not
                // evidence of presence and never resets the counter.
                tracing::warn!(error = %e, "remote verification failed");
                self.publish(frame, None, config);
                Observation::Miss
            }
        }
    }

    fn publish(&mut self, frame: &Frame, matched: Option<&DetectionBox>, config: &MonitorConfig) {
        if !config.display_overlay {
            return;
        }
        if let Err(e) = self.preview.publish(frame, matched) {
            tracing::warn!(error = %e, "preview publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionError;
    use crate::preview::PreviewError;
    use facewatch_core::{
        verifier::FaceApiError, Detection, DetectionBox, VerificationResult,
    };
    use facewatch_core::detector::DetectorError;
    use facewatch_hw::CameraError;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    fn test_model() -> ReferenceModel {
        ReferenceModel {
            fingerprint: "ref-face-id".into(),
            enrolled_at: chrono::Utc::now(),
            source_image: "/tmp/me.jpg".into(),
            rectangle: None,
            attributes: None,
        }
    }

    fn config(trigger_secs: f64, interval_secs: f64) -> MonitorConfig {
        MonitorConfig {
            sample_interval: Duration::from_secs_f64(interval_secs),
            trigger_after: Duration::from_secs_f64(trigger_secs),
            confidence_threshold: 0.5,
            continue_after_trigger: false,
            display_overlay: false,
        }
    }

    struct TestSource {
        unavailable_checks: Cell<u32>,
        grabs: Cell<u32>,
    }

    impl TestSource {
        fn ready() -> Self {
            Self {
                unavailable_checks: Cell::new(0),
                grabs: Cell::new(0),
            }
        }

        fn unavailable_for(checks: u32) -> Self {
            Self {
                unavailable_checks: Cell::new(checks),
                grabs: Cell::new(0),
            }
        }
    }

    impl ImageSource for TestSource {
        fn is_available(&self) -> bool {
            let left = self.unavailable_checks.get();
            if left > 0 {
                self.unavailable_checks.set(left - 1);
                false
            } else {
                true
            }
        }

        fn grab(&mut self) -> Result<Frame, CameraError> {
            self.grabs.set(self.grabs.get() + 1);
            Ok(Frame {
                data: vec![0; 4],
                width: 2,
                height: 2,
                timestamp: Instant::now(),
            })
        }
    }

    /// Pops one entry per tick; `true` = a local face candidate exists.
    /// An empty script keeps returning the default.
    struct TestDetector {
        script: VecDeque<bool>,
        default: bool,
    }

    impl TestDetector {
        fn always_face() -> Self {
            Self {
                script: VecDeque::new(),
                default: true,
            }
        }

        fn never_face() -> Self {
            Self {
                script: VecDeque::new(),
                default: false,
            }
        }
    }

    impl LocalDetector for TestDetector {
        fn detect(
            &mut self,
            _gray: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<Detection>, DetectorError> {
            let face = self.script.pop_front().unwrap_or(self.default);
            if face {
                Ok(vec![Detection {
                    bbox: DetectionBox {
                        left: 0.0,
                        top: 0.0,
                        width: 1.0,
                        height: 1.0,
                    },
                    confidence: 0.9,
                }])
            } else {
                Ok(vec![])
            }
        }
    }

    /// Scripted confidences; `None` entries are remote failures. When the
    /// script runs dry the session's cancel token is pulled so tests end
    /// deterministically.
    struct TestVerifier {
        script: RefCell<VecDeque<Option<f32>>>,
        calls: Cell<u32>,
        on_empty: CancellationToken,
    }

    impl TestVerifier {
        fn scripted(entries: &[Option<f32>], on_empty: CancellationToken) -> Self {
            Self {
                script: RefCell::new(entries.iter().copied().collect()),
                calls: Cell::new(0),
                on_empty,
            }
        }
    }

    impl RemoteVerifier for TestVerifier {
        async fn verify(
            &self,
            _model: &ReferenceModel,
            _jpeg: &[u8],
        ) -> Result<VerificationResult, FaceApiError> {
            self.calls.set(self.calls.get() + 1);
            match self.script.borrow_mut().pop_front() {
                Some(Some(confidence)) => Ok(VerificationResult {
                    confidence,
                    matched_box: None,
                }),
                Some(None) => Err(FaceApiError::Malformed("scripted failure".into())),
                None => {
                    self.on_empty.cancel();
                    Err(FaceApiError::Malformed("script exhausted".into()))
                }
            }
        }
    }

    struct TestAction {
        fires: Cell<u32>,
        cancel_after: Option<(u32, CancellationToken)>,
    }

    impl TestAction {
        fn new() -> Self {
            Self {
                fires: Cell::new(0),
                cancel_after: None,
            }
        }

        fn cancelling_after(fires: u32, token: CancellationToken) -> Self {
            Self {
                fires: Cell::new(0),
                cancel_after: Some((fires, token)),
            }
        }
    }

    impl TriggerAction for TestAction {
        fn fire(&mut self) -> Result<(), ActionError> {
            self.fires.set(self.fires.get() + 1);
            if let Some((limit, token)) = &self.cancel_after {
                if self.fires.get() >= *limit {
                    token.cancel();
                }
            }
            Ok(())
        }
    }

    struct TestSink {
        publishes: Cell<u32>,
    }

    impl FrameSink for TestSink {
        fn publish(
            &mut self,
            _frame: &Frame,
            _matched: Option<&DetectionBox>,
        ) -> Result<(), PreviewError> {
            self.publishes.set(self.publishes.get() + 1);
            Ok(())
        }
    }

    fn null_sink() -> TestSink {
        TestSink {
            publishes: Cell::new(0),
        }
    }

    // --- threshold arithmetic ---

    #[test]
    fn test_miss_threshold_exact_division() {
        assert_eq!(config(10.0, 1.0).miss_threshold(), 10);
        assert_eq!(config(10.0, 0.5).miss_threshold(), 20);
    }

    #[test]
    fn test_miss_threshold_rounds() {
        assert_eq!(config(2.4, 1.0).miss_threshold(), 2);
        assert_eq!(config(2.5, 1.0).miss_threshold(), 3); // half away from zero
    }

    #[test]
    fn test_miss_threshold_clamped_to_one() {
        assert_eq!(config(0.1, 1.0).miss_threshold(), 1);
    }

    // --- cadence ---

    #[test]
    fn test_pace_subtracts_elapsed() {
        assert_eq!(
            pace(Duration::from_secs(1), Duration::from_millis(300)),
            Duration::from_millis(700)
        );
    }

    #[test]
    fn test_pace_never_negative() {
        assert_eq!(pace(Duration::from_secs(1), Duration::from_secs(5)), Duration::ZERO);
    }

    // --- debounce state machine ---

    #[test]
    fn test_debounce_fires_at_threshold_never_earlier() {
        let mut d = Debounce::new(3);
        assert_eq!(d.observe(Observation::Miss), Transition::Degrading(1));
        assert_eq!(d.observe(Observation::Miss), Transition::Degrading(2));
        assert_eq!(d.observe(Observation::Miss), Transition::Triggered);
        // Counter reset after trigger.
        assert_eq!(d.observe(Observation::Miss), Transition::Degrading(1));
    }

    #[test]
    fn test_debounce_match_resets_same_tick() {
        let mut d = Debounce::new(3);
        d.observe(Observation::Miss);
        d.observe(Observation::Miss);
        assert_eq!(d.observe(Observation::Match), Transition::Present);
        assert_eq!(d.observe(Observation::Miss), Transition::Degrading(1));
    }

    #[test]
    fn test_debounce_skip_leaves_counter_unchanged() {
        let mut d = Debounce::new(2);
        d.observe(Observation::Miss);
        assert_eq!(d.observe(Observation::Skip), Transition::Unchanged);
        // Next miss triggers: skip neither incremented nor reset.
        assert_eq!(d.observe(Observation::Miss), Transition::Triggered);
    }

    // --- session loop ---

    #[tokio::test(start_paused = true)]
    async fn test_fires_exactly_on_tenth_miss() {
        let cancel = CancellationToken::new();
        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::always_face(),
            verifier: TestVerifier::scripted(&[Some(0.0); 10], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let end = monitor
            .run(&test_model(), &config(10.0, 1.0), &cancel)
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::Triggered);
        assert_eq!(monitor.action.fires.get(), 1);
        // One-shot: the session ended on the trigger tick, exactly ten
        // remote calls were spent.
        assert_eq!(monitor.verifier.calls.get(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_resets_counter_no_fire() {
        let cancel = CancellationToken::new();
        // Nine misses, one match, then the script runs dry and cancels.
        let mut script = vec![Some(0.0); 9];
        script.push(Some(0.9));
        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::always_face(),
            verifier: TestVerifier::scripted(&script, cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let end = monitor
            .run(&test_model(), &config(10.0, 1.0), &cancel)
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(monitor.action.fires.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_local_face_never_calls_remote() {
        let cancel = CancellationToken::new();
        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::never_face(),
            verifier: TestVerifier::scripted(&[], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let end = monitor
            .run(&test_model(), &config(3.0, 1.0), &cancel)
            .await
            .unwrap();

        // Three local misses trigger the one-shot action without spending
        // a single remote call.
        assert_eq!(end, SessionEnd::Triggered);
        assert_eq!(monitor.action.fires.get(), 1);
        assert_eq!(monitor.verifier.calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_mode_keeps_running_after_trigger() {
        let cancel = CancellationToken::new();
        let mut cfg = config(2.0, 1.0);
        cfg.continue_after_trigger = true;

        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::never_face(),
            verifier: TestVerifier::scripted(&[], cancel.clone()),
            action: TestAction::cancelling_after(2, cancel.clone()),
            preview: null_sink(),
        };

        let end = monitor.run(&test_model(), &cfg, &cancel).await.unwrap();

        // The counter reset after the first trigger and accumulated to the
        // threshold a second time before the action cancelled the session.
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(monitor.action.fires.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_backoff_does_not_touch_counter() {
        let cancel = CancellationToken::new();
        let mut monitor = PresenceMonitor {
            source: TestSource::unavailable_for(2),
            detector: TestDetector::never_face(),
            verifier: TestVerifier::scripted(&[], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let end = monitor
            .run(&test_model(), &config(1.0, 1.0), &cancel)
            .await
            .unwrap();

        // Two unavailable checks consumed no frames; the first real tick
        // was the single miss that fired the one-shot action.
        assert_eq!(end, SessionEnd::Triggered);
        assert_eq!(monitor.source.grabs.get(), 1);
        assert_eq!(monitor.action.fires.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_counts_as_miss_and_loop_survives() {
        let cancel = CancellationToken::new();
        // Error on tick 1, match on tick 2, then dry-cancel.
        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::always_face(),
            verifier: TestVerifier::scripted(&[None, Some(0.9)], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let end = monitor
            .run(&test_model(), &config(10.0, 1.0), &cancel)
            .await
            .unwrap();

        assert_eq!(end, SessionEnd::Cancelled);
        // The loop reached tick 2 (and the dry tick 3) after the failure.
        assert!(monitor.verifier.calls.get() >= 2);
        assert_eq!(monitor.action.fires.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_overlay_publishes_each_evaluated_tick() {
        let cancel = CancellationToken::new();
        let mut cfg = config(2.0, 1.0);
        cfg.display_overlay = true;

        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::never_face(),
            verifier: TestVerifier::scripted(&[], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        monitor.run(&test_model(), &cfg, &cancel).await.unwrap();
        assert_eq!(monitor.preview.publishes.get(), 2);
    }

    #[tokio::test]
    async fn test_rejects_zero_interval() {
        let cancel = CancellationToken::new();
        let mut cfg = config(10.0, 1.0);
        cfg.sample_interval = Duration::ZERO;

        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::always_face(),
            verifier: TestVerifier::scripted(&[], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let err = monitor.run(&test_model(), &cfg, &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_rejects_model_without_fingerprint() {
        let cancel = CancellationToken::new();
        let mut model = test_model();
        model.fingerprint.clear();

        let mut monitor = PresenceMonitor {
            source: TestSource::ready(),
            detector: TestDetector::always_face(),
            verifier: TestVerifier::scripted(&[], cancel.clone()),
            action: TestAction::new(),
            preview: null_sink(),
        };

        let err = monitor
            .run(&model, &config(10.0, 1.0), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidModel));
    }
}
