//! Call controller: lifecycle, status, mute, and teardown of one voice call.
//!
//! ## Event flow
//!
//! ```text
//! transport task ─┐
//! output callback ┼──► mpsc<CallEvent> ──► CallController::run ──► handle_event
//! CallHandle      ┘                                                    │
//!                                          status / scheduler / capture ◄┘
//! ```
//!
//! The controller is the only owner of the [`PlaybackScheduler`] and of the
//! status, so every side effect happens in queue order. After `end_call` the
//! liveness flag is cleared and anything still queued is discarded.

pub mod state;

use std::ops::ControlFlow;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    capture::{self, CaptureConfig, CaptureDiagnostics, CaptureHandle, CaptureLinks, Microphone, VolumeLevel},
    codec::{decode_playback_buffer, OUTPUT_SAMPLE_RATE},
    error::{Result, VoiceError},
    events::{AudioLevelEvent, CallEvent, CallStatus, CallStatusEvent},
    playback::{OutputSink, PlaybackProgress, PlaybackScheduler},
    transport::{Outbound, SessionConfig, TransportEvent},
};

pub use state::{next_status, StatusTrigger};

/// Persona given to the live model at session setup.
pub const VOICE_PERSONA: &str = "You are Sangwari, a Chhattisgarhi friend. You are talking in a voice call. Speak casual Chhattisgarhi and Hindi. Keep sentences very short (1-2 sentences). Be warm and energetic.";

const STATUS_CHANNEL_CAPACITY: usize = 32;
const LEVEL_CHANNEL_CAPACITY: usize = 64;

/// Everything needed to place one call.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    /// Rate synthesized speech is expected at (Hz).
    pub output_sample_rate: u32,
    /// Fixed output gain, applied once by the mixer.
    pub output_gain: f32,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                system_instruction: VOICE_PERSONA.to_string(),
                ..SessionConfig::default()
            },
            capture: CaptureConfig::default(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            output_gain: 1.0,
            input_device: None,
            output_device: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CallDiagnostics {
    pub chunks_received: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
    pub buffers_scheduled: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl CallDiagnostics {
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub chunks_received: usize,
    pub chunks_dropped: usize,
    pub buffers_scheduled: usize,
    pub interruptions: usize,
}

/// State visible from the UI side.
struct CallShared {
    status: Mutex<CallStatus>,
    muted: Arc<AtomicBool>,
    level: Arc<VolumeLevel>,
    status_tx: broadcast::Sender<CallStatusEvent>,
    level_tx: broadcast::Sender<AudioLevelEvent>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
}

/// UI boundary of a running call. Cheap to clone.
#[derive(Clone)]
pub struct CallHandle {
    shared: Arc<CallShared>,
}

impl CallHandle {
    pub fn status(&self) -> CallStatus {
        *self.shared.status.lock()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Flip mute; returns the new state. Takes effect from the next frame.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.shared.muted.fetch_xor(true, Ordering::AcqRel);
        info!(muted, "mute toggled");
        muted
    }

    /// RMS of the latest captured frame, in [0.0, 1.0].
    pub fn volume_level(&self) -> f32 {
        self.shared.level.load()
    }

    /// Ask the controller to hang up. Processed in queue order.
    pub fn end_call(&self) {
        if self.shared.events_tx.send(CallEvent::EndCall).is_err() {
            debug!("end_call after controller exit");
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CallStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<AudioLevelEvent> {
        self.shared.level_tx.subscribe()
    }
}

pub struct CallController<S: OutputSink> {
    config: CallConfig,
    shared: Arc<CallShared>,
    scheduler: PlaybackScheduler<S>,
    transport: Arc<dyn Outbound>,
    microphone: Option<Box<dyn Microphone>>,
    capture: Option<CaptureHandle>,
    capture_diagnostics: Arc<CaptureDiagnostics>,
    diagnostics: Arc<CallDiagnostics>,
    live: bool,
    torn_down: bool,
}

impl<S: OutputSink> CallController<S> {
    /// `events_tx` must feed the queue later passed to [`run`](Self::run);
    /// `CallHandle::end_call` posts into it.
    pub fn new(
        config: CallConfig,
        sink: S,
        transport: Arc<dyn Outbound>,
        microphone: Box<dyn Microphone>,
        events_tx: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (level_tx, _) = broadcast::channel(LEVEL_CHANNEL_CAPACITY);
        let shared = Arc::new(CallShared {
            status: Mutex::new(CallStatus::Connecting),
            muted: Arc::new(AtomicBool::new(false)),
            level: Arc::new(VolumeLevel::default()),
            status_tx,
            level_tx,
            events_tx,
        });

        info!(session = ?config.session, "call created");
        Self {
            config,
            shared,
            scheduler: PlaybackScheduler::new(sink),
            transport,
            microphone: Some(microphone),
            capture: None,
            capture_diagnostics: Arc::new(CaptureDiagnostics::default()),
            diagnostics: Arc::new(CallDiagnostics::default()),
            live: true,
            torn_down: false,
        }
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn status(&self) -> CallStatus {
        *self.shared.status.lock()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<S> {
        &self.scheduler
    }

    pub fn diagnostics(&self) -> CallSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn capture_diagnostics(&self) -> capture::CaptureSnapshot {
        self.capture_diagnostics.snapshot()
    }

    /// Park the call in `Error` for a failure found outside the event queue,
    /// such as an output device that could not be opened.
    pub fn report_failure(&mut self, err: &VoiceError) {
        if self.live {
            self.fail(err.to_string());
        }
    }

    /// Consume events until the call ends or the queue closes, then tear down.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<CallEvent>) -> CallSnapshot {
        while let Some(event) = events.recv().await {
            if self.handle_event(event).is_break() {
                break;
            }
        }
        if let Err(e) = self.end_call() {
            warn!("call teardown incomplete: {e}");
        }
        self.diagnostics.snapshot()
    }

    /// Apply one event. `Break` once the call is over.
    pub fn handle_event(&mut self, event: CallEvent) -> ControlFlow<()> {
        if !self.live {
            debug!(?event, "call ended, discarding event");
            return ControlFlow::Break(());
        }

        match event {
            CallEvent::Transport(event) => self.on_transport(event),
            CallEvent::PlaybackEnded(id) => {
                if self.scheduler.on_buffer_ended(id) == PlaybackProgress::Drained {
                    debug!(id, "playback drained");
                    self.apply(StatusTrigger::PlaybackDrained, None);
                }
            }
            CallEvent::EndCall => {
                info!("end of call requested");
                if let Err(e) = self.end_call() {
                    warn!("call teardown incomplete: {e}");
                }
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                if self.status() == CallStatus::Error {
                    return;
                }
                match self.start_capture() {
                    Ok(()) => self.apply(StatusTrigger::Ready, None),
                    Err(e) => self.fail(e.to_string()),
                }
            }
            TransportEvent::AudioChunk(chunk) => {
                self.diagnostics
                    .chunks_received
                    .fetch_add(1, Ordering::Relaxed);
                if self.status() == CallStatus::Error {
                    return;
                }
                let buffer = match decode_playback_buffer(&chunk) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        self.diagnostics
                            .chunks_dropped
                            .fetch_add(1, Ordering::Relaxed);
                        warn!("dropping inbound chunk: {e}");
                        return;
                    }
                };
                if buffer.is_empty() {
                    return;
                }
                self.scheduler.enqueue(buffer);
                self.diagnostics
                    .buffers_scheduled
                    .fetch_add(1, Ordering::Relaxed);
                self.apply(StatusTrigger::AudioEnqueued, None);
            }
            TransportEvent::Interrupted => {
                self.scheduler.interrupt();
                self.diagnostics
                    .interruptions
                    .fetch_add(1, Ordering::Relaxed);
                self.apply(StatusTrigger::Interrupted, None);
            }
            TransportEvent::TurnComplete => debug!("assistant turn complete"),
            TransportEvent::Closed => {
                self.apply(StatusTrigger::Closed, None);
                self.on_closed();
            }
            TransportEvent::Error(cause) => self.fail(cause),
        }
    }

    /// Reconnection hook. Recovery is manual: the user ends and redials.
    fn on_closed(&self) {
        info!("live session closed; waiting for the user to redial");
    }

    fn start_capture(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let Some(microphone) = self.microphone.take() else {
            debug!("microphone already consumed");
            return Ok(());
        };
        let links = CaptureLinks {
            muted: Arc::clone(&self.shared.muted),
            level: Arc::clone(&self.shared.level),
            level_tx: self.shared.level_tx.clone(),
            outbound: Arc::clone(&self.transport),
            diagnostics: Arc::clone(&self.capture_diagnostics),
        };
        let handle = capture::start(microphone, self.config.capture.clone(), links)?;
        self.capture = Some(handle);
        Ok(())
    }

    /// Unrecoverable failure: halt every stage and park in `Error`.
    fn fail(&mut self, detail: String) {
        error!("call failed: {detail}");
        self.transport.suspend();
        if let Some(capture) = &self.capture {
            capture.stop();
        }
        self.scheduler.interrupt();
        self.apply(StatusTrigger::Failed, Some(detail));
    }

    fn apply(&self, trigger: StatusTrigger, detail: Option<String>) {
        let mut status = self.shared.status.lock();
        let next = next_status(*status, trigger);
        if next == *status {
            return;
        }
        let previous = *status;
        info!(from = %previous, to = %next, ?trigger, "call status");
        *status = next;
        drop(status);
        let _ = self.shared.status_tx.send(CallStatusEvent {
            status: next,
            detail,
        });
    }

    /// Release everything. Every step runs even if an earlier one failed;
    /// the first failure is returned. Idempotent.
    pub fn end_call(&mut self) -> Result<()> {
        self.live = false;
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut first_err: Option<VoiceError> = None;

        self.transport.close();

        if let Some(capture) = &self.capture {
            capture.stop();
        }

        if let Err(e) = self.scheduler.shutdown() {
            warn!("output shutdown failed: {e}");
            first_err.get_or_insert(e);
        }

        if let Some(capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("microphone release failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        self.microphone = None;

        let call = self.diagnostics.snapshot();
        let capture = self.capture_diagnostics.snapshot();
        info!(
            chunks_received = call.chunks_received,
            chunks_dropped = call.chunks_dropped,
            buffers_scheduled = call.buffers_scheduled,
            interruptions = call.interruptions,
            frames_sent = capture.frames_sent,
            frames_suppressed = capture.frames_suppressed,
            "call ended"
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S: OutputSink> Drop for CallController<S> {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.end_call() {
                warn!("teardown on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::testing::ScriptedMic,
        codec::{encode_pcm16, WireChunk},
        playback::testing::ManualSink,
        transport::testing::RecordingOutbound,
    };
    use std::time::Duration;

    struct Call {
        controller: CallController<ManualSink>,
        outbound: Arc<RecordingOutbound>,
        mic_released: Arc<AtomicBool>,
        _events: mpsc::UnboundedReceiver<CallEvent>,
    }

    fn call_with(mic: ScriptedMic, sink: ManualSink) -> Call {
        let outbound = Arc::new(RecordingOutbound::default());
        let mic_released = Arc::clone(&mic.released);
        let (events_tx, events) = mpsc::unbounded_channel();
        let controller = CallController::new(
            CallConfig::default(),
            sink,
            outbound.clone(),
            Box::new(mic),
            events_tx,
        );
        Call {
            controller,
            outbound,
            mic_released,
            _events: events,
        }
    }

    fn call() -> Call {
        call_with(
            ScriptedMic::new(vec![0.2; 4096 * 2], 16_000),
            ManualSink::default(),
        )
    }

    /// 100 ms of 24 kHz speech.
    fn speech_chunk() -> CallEvent {
        TransportEvent::AudioChunk(encode_pcm16(&[0.1; 2400], 24_000, 1)).into()
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn full_turn_listening_speaking_listening() {
        let mut call = call();
        let mut statuses = call.controller.handle().subscribe_status();
        assert_eq!(call.controller.status(), CallStatus::Connecting);

        call.controller.handle_event(TransportEvent::Ready.into());
        assert_eq!(call.controller.status(), CallStatus::Listening);
        let outbound = call.outbound.clone();
        wait_for(|| outbound.sent().len() >= 2).await;
        assert!(outbound
            .sent()
            .iter()
            .all(|c| c.mime_type == "audio/pcm;rate=16000"));

        call.controller.scheduler.sink_mut().now = 1.5;
        call.controller.handle_event(speech_chunk());
        assert_eq!(call.controller.status(), CallStatus::Speaking);
        assert_eq!(call.controller.scheduler().sink().started.len(), 1);
        let (id, at, duration) = call.controller.scheduler().sink().started[0];
        assert_eq!(at, 1.5, "buffer starts at the output clock");
        assert!((duration - 0.1).abs() < 1e-9);

        call.controller.handle_event(CallEvent::PlaybackEnded(id));
        assert_eq!(call.controller.status(), CallStatus::Listening);

        let seen: Vec<_> = std::iter::from_fn(|| statuses.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(
            seen,
            vec![CallStatus::Listening, CallStatus::Speaking, CallStatus::Listening]
        );
        call.controller.end_call().unwrap();
    }

    #[tokio::test]
    async fn interruption_stops_both_buffers() {
        let mut call = call();
        call.controller.handle_event(TransportEvent::Ready.into());
        call.controller.handle_event(speech_chunk());
        call.controller.handle_event(speech_chunk());
        assert_eq!(call.controller.scheduler().active_count(), 2);

        call.controller.scheduler.sink_mut().now = 0.05;
        call.controller.handle_event(TransportEvent::Interrupted.into());

        assert_eq!(call.controller.status(), CallStatus::Listening);
        assert_eq!(call.controller.scheduler().active_count(), 0);
        assert_eq!(call.controller.scheduler().sink().stopped, vec![0, 1]);
        assert_eq!(call.controller.scheduler().next_start(), 0.05);

        // Late end notification from a stopped buffer changes nothing.
        call.controller.handle_event(CallEvent::PlaybackEnded(0));
        assert_eq!(call.controller.status(), CallStatus::Listening);
        assert_eq!(call.controller.diagnostics().interruptions, 1);
    }

    #[tokio::test]
    async fn muted_call_sends_nothing_but_reports_level() {
        let mut call = call();
        let handle = call.controller.handle();
        assert!(handle.toggle_mute());
        call.controller.handle_event(TransportEvent::Ready.into());

        wait_for(|| call.controller.capture_diagnostics().frames_captured >= 2).await;
        assert!(call.outbound.sent().is_empty());
        assert_eq!(call.controller.capture_diagnostics().frames_suppressed, 2);
        assert!(handle.volume_level() > 0.1);

        assert!(!handle.toggle_mute());
        assert!(!handle.is_muted());
    }

    #[tokio::test]
    async fn malformed_chunk_is_dropped_and_call_continues() {
        let mut call = call();
        call.controller.handle_event(TransportEvent::Ready.into());
        let bad = WireChunk::from_inline("%%%".into(), "audio/pcm;rate=24000".into());
        call.controller
            .handle_event(TransportEvent::AudioChunk(bad).into());

        assert_eq!(call.controller.status(), CallStatus::Listening);
        assert!(call.controller.scheduler().sink().started.is_empty());
        assert_eq!(call.controller.diagnostics().chunks_dropped, 1);

        call.controller.handle_event(speech_chunk());
        assert_eq!(call.controller.status(), CallStatus::Speaking);
    }

    #[tokio::test]
    async fn transport_error_halts_everything() {
        let mut call = call();
        let mut statuses = call.controller.handle().subscribe_status();
        call.controller.handle_event(TransportEvent::Ready.into());
        call.controller.handle_event(speech_chunk());

        call.controller
            .handle_event(TransportEvent::Error("socket reset".into()).into());
        assert_eq!(call.controller.status(), CallStatus::Error);
        assert!(call.outbound.suspended.load(Ordering::Acquire));
        assert_eq!(call.controller.scheduler().active_count(), 0);

        call.controller.handle_event(speech_chunk());
        call.controller.handle_event(TransportEvent::Ready.into());
        assert_eq!(call.controller.status(), CallStatus::Error);
        assert_eq!(call.controller.scheduler().active_count(), 0);

        let last = std::iter::from_fn(|| statuses.try_recv().ok()).last().unwrap();
        assert_eq!(last.status, CallStatus::Error);
        assert_eq!(last.detail.as_deref(), Some("socket reset"));
    }

    #[tokio::test]
    async fn microphone_failure_is_an_error_status() {
        let mut call = call_with(ScriptedMic::failing(), ManualSink::default());
        call.controller.handle_event(TransportEvent::Ready.into());
        assert_eq!(call.controller.status(), CallStatus::Error);
        assert!(call.outbound.suspended.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn reported_device_failure_blocks_later_ready() {
        let mut call = call();
        call.controller
            .report_failure(&VoiceError::DeviceAcquisition("no speaker".into()));
        assert_eq!(call.controller.status(), CallStatus::Error);
        assert!(call.outbound.suspended.load(Ordering::Acquire));

        call.controller.handle_event(TransportEvent::Ready.into());
        assert_eq!(call.controller.status(), CallStatus::Error);
    }

    #[tokio::test]
    async fn close_returns_to_connecting() {
        let mut call = call();
        call.controller.handle_event(TransportEvent::Ready.into());
        call.controller.handle_event(TransportEvent::Closed.into());
        assert_eq!(call.controller.status(), CallStatus::Connecting);
        assert!(call.controller.is_live());
    }

    #[tokio::test]
    async fn teardown_runs_every_step_when_output_close_fails() {
        let sink = ManualSink {
            fail_close: true,
            ..ManualSink::default()
        };
        let mut call = call_with(ScriptedMic::new(vec![0.2; 100], 16_000), sink);
        call.controller.handle_event(TransportEvent::Ready.into());

        let err = call.controller.end_call().expect_err("sink close fails");
        assert!(matches!(err, VoiceError::AudioStream(_)));
        assert!(call.outbound.closed.load(Ordering::Acquire));
        assert!(call.controller.scheduler().sink().closed);
        assert!(call.mic_released.load(Ordering::Acquire));

        call.controller.end_call().unwrap();
    }

    #[tokio::test]
    async fn events_after_end_are_ignored() {
        let mut call = call();
        assert!(call
            .controller
            .handle_event(CallEvent::EndCall)
            .is_break());
        assert!(!call.controller.is_live());

        assert!(call
            .controller
            .handle_event(TransportEvent::Ready.into())
            .is_break());
        call.controller.handle_event(speech_chunk());
        assert_eq!(call.controller.status(), CallStatus::Connecting);
        assert!(call.controller.scheduler().sink().started.is_empty());
        assert!(call.outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_end_call_from_handle() {
        let outbound = Arc::new(RecordingOutbound::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let controller = CallController::new(
            CallConfig::default(),
            ManualSink::default(),
            outbound.clone(),
            Box::new(ScriptedMic::new(vec![], 16_000)),
            events_tx.clone(),
        );
        let handle = controller.handle();

        events_tx.send(TransportEvent::Ready.into()).unwrap();
        events_tx.send(speech_chunk()).unwrap();
        handle.end_call();
        events_tx.send(speech_chunk()).unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), controller.run(events))
            .await
            .expect("run finishes");
        assert_eq!(snapshot.buffers_scheduled, 1);
        assert!(outbound.closed.load(Ordering::Acquire));
    }

    #[test]
    fn default_config_carries_the_voice_persona() {
        let config = CallConfig::default();
        assert_eq!(config.session.system_instruction, VOICE_PERSONA);
        assert_eq!(config.capture.frame_samples, 4096);
        assert_eq!(config.output_sample_rate, 24_000);
    }
}
