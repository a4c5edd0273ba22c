use chrono::Local;
use image::RgbImage;
use rollcall_core::{AttendanceSink, FaceEncoder, MarkEvent, SessionSummary, Station, StationError};
use rollcall_hw::{Camera, CameraError, CaptureStream};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Station(#[from] StationError),
    #[error("camera is already in use by a session or an enrollment capture")]
    CameraBusy,
    #[error("no enrollment capture in progress")]
    NotCapturing,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Source of RGB frames for one open camera.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;
}

/// Opens the camera on demand. The returned source is dropped to release it.
pub trait CameraProvider: Send + 'static {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, CameraError>;
}

impl FrameSource for CaptureStream {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        self.next_frame().map(|frame| frame.image)
    }
}

/// V4L2 camera at a fixed device path, streamed for as long as it is open.
pub struct V4l2Provider {
    pub device: String,
    pub warmup_frames: usize,
}

impl CameraProvider for V4l2Provider {
    type Source = CaptureStream;

    fn open(&self) -> Result<CaptureStream, CameraError> {
        let mut stream = Camera::open(&self.device)?.stream()?;
        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            stream.warm_up(self.warmup_frames);
        }
        Ok(stream)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub tick: Duration,
    pub max_read_failures: u32,
}

/// Pushed from the engine thread to the presentation layer.
#[derive(Debug)]
pub enum EngineEvent {
    /// First recognition of an identity in the active session, already recorded.
    Marked(MarkEvent),
    /// The attendance row for a mark could not be written. The label stays unmarked.
    RecordFailed { event: MarkEvent, error: String },
    /// Too many consecutive failed reads; the session was stopped.
    CameraLost { summary: SessionSummary, error: String },
}

enum EngineRequest {
    StartSession {
        subject: String,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    StopSession {
        reply: oneshot::Sender<Result<SessionSummary, EngineError>>,
    },
    Enroll {
        label: String,
        image: RgbImage,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    BeginCapture {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    CaptureEnroll {
        label: String,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    CancelCapture {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<RgbImage>>,
    },
    Labels {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Start a session and open the camera. Returns the session id.
    pub async fn start_session(&self, subject: &str) -> Result<String, EngineError> {
        let subject = subject.to_string();
        self.request(|reply| EngineRequest::StartSession { subject, reply })
            .await?
    }

    /// Stop the session and release the camera. Takes effect before the next frame.
    pub async fn stop_session(&self) -> Result<SessionSummary, EngineError> {
        self.request(|reply| EngineRequest::StopSession { reply }).await?
    }

    /// Enroll from an image. Returns the gallery size.
    pub async fn enroll_image(&self, label: &str, image: RgbImage) -> Result<usize, EngineError> {
        let label = label.to_string();
        self.request(|reply| EngineRequest::Enroll { label, image, reply })
            .await?
    }

    /// Open the camera for an enrollment capture. Frames are pulled until
    /// [`capture_enroll`](Self::capture_enroll) or [`cancel_capture`](Self::cancel_capture).
    pub async fn begin_capture(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::BeginCapture { reply }).await?
    }

    /// Enroll the most recent capture frame and release the camera.
    pub async fn capture_enroll(&self, label: &str) -> Result<usize, EngineError> {
        let label = label.to_string();
        self.request(|reply| EngineRequest::CaptureEnroll { label, reply })
            .await?
    }

    /// Abandon the capture and release the camera. The gallery is untouched.
    pub async fn cancel_capture(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::CancelCapture { reply }).await?
    }

    /// Latest frame: annotated during a session, raw while capturing.
    pub async fn snapshot(&self) -> Result<Option<RgbImage>, EngineError> {
        self.request(|reply| EngineRequest::Snapshot { reply }).await
    }

    /// Distinct enrolled labels.
    pub async fn labels(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::Labels { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the encoder, station and camera; all state changes happen
/// there. It exits when every [`EngineHandle`] has been dropped.
pub fn spawn_engine<E, S, P>(
    encoder: E,
    station: Station<S>,
    cameras: P,
    settings: EngineSettings,
) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>), EngineError>
where
    E: FaceEncoder + Send + 'static,
    S: AttendanceSink + Send + 'static,
    P: CameraProvider,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let worker = Worker {
                encoder,
                station,
                cameras,
                camera: None,
                latest: None,
                preview: None,
                read_failures: 0,
                settings,
                events: events_tx,
            };
            worker.run(rx)
        })
        .map_err(EngineError::Spawn)?;

    Ok((EngineHandle { tx }, events_rx))
}

struct Worker<E, S, P: CameraProvider> {
    encoder: E,
    station: Station<S>,
    cameras: P,
    /// Open while a session or an enrollment capture is running.
    camera: Option<P::Source>,
    latest: Option<RgbImage>,
    /// Last raw frame of an enrollment capture.
    preview: Option<RgbImage>,
    read_failures: u32,
    settings: EngineSettings,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl<E, S, P> Worker<E, S, P>
where
    E: FaceEncoder,
    S: AttendanceSink,
    P: CameraProvider,
{
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!("engine thread started");
        loop {
            if self.camera.is_none() {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => break,
                }
                continue;
            }

            // Camera open: drain requests first so a stop lands before the next pull.
            match rx.try_recv() {
                Ok(req) => {
                    self.handle(req);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            self.tick();
            std::thread::sleep(self.settings.tick);
        }

        if self.station.is_session_active() {
            if let Ok(summary) = self.station.stop() {
                tracing::warn!(session = %summary.session_id, "engine closed with a session running");
            }
        }
        self.release_camera();
        tracing::info!("engine thread exiting");
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartSession { subject, reply } => {
                let _ = reply.send(self.start_session(&subject));
            }
            EngineRequest::StopSession { reply } => {
                let _ = reply.send(self.stop_session());
            }
            EngineRequest::Enroll {
                label,
                image,
                reply,
            } => {
                let result = self
                    .station
                    .enroll(&mut self.encoder, &label, &image)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::BeginCapture { reply } => {
                let _ = reply.send(self.begin_capture());
            }
            EngineRequest::CaptureEnroll { label, reply } => {
                let _ = reply.send(self.capture_enroll(&label));
            }
            EngineRequest::CancelCapture { reply } => {
                let _ = reply.send(self.cancel_capture());
            }
            EngineRequest::Snapshot { reply } => {
                let _ = reply.send(self.latest.clone());
            }
            EngineRequest::Labels { reply } => {
                let labels = self
                    .station
                    .gallery()
                    .labels()
                    .into_iter()
                    .map(String::from)
                    .collect();
                let _ = reply.send(labels);
            }
        }
    }

    fn capturing(&self) -> bool {
        self.camera.is_some() && !self.station.is_session_active()
    }

    fn open_camera(&mut self) -> Result<(), CameraError> {
        self.camera = Some(self.cameras.open()?);
        self.read_failures = 0;
        self.latest = None;
        self.preview = None;
        Ok(())
    }

    fn release_camera(&mut self) {
        self.camera = None;
        self.preview = None;
    }

    fn start_session(&mut self, subject: &str) -> Result<String, EngineError> {
        if self.capturing() {
            return Err(EngineError::CameraBusy);
        }
        let session_id = self.station.start(subject)?;
        if let Err(e) = self.open_camera() {
            tracing::error!(error = %e, "camera open failed; session aborted");
            let _ = self.station.stop();
            return Err(e.into());
        }
        Ok(session_id)
    }

    fn stop_session(&mut self) -> Result<SessionSummary, EngineError> {
        let summary = self.station.stop()?;
        self.release_camera();
        Ok(summary)
    }

    fn begin_capture(&mut self) -> Result<(), EngineError> {
        if self.camera.is_some() {
            return Err(EngineError::CameraBusy);
        }
        self.open_camera()?;
        tracing::info!("enrollment capture started");
        Ok(())
    }

    fn capture_enroll(&mut self, label: &str) -> Result<usize, EngineError> {
        if self.station.is_session_active() {
            return Err(EngineError::CameraBusy);
        }
        // Taken out of the worker: released when this returns, on every path.
        let mut camera = self.camera.take().ok_or(EngineError::NotCapturing)?;
        let frame = match self.preview.take() {
            Some(frame) => frame,
            None => camera.read_frame()?,
        };
        drop(camera);
        Ok(self.station.enroll(&mut self.encoder, label, &frame)?)
    }

    fn cancel_capture(&mut self) -> Result<(), EngineError> {
        if !self.capturing() {
            return Err(EngineError::NotCapturing);
        }
        self.release_camera();
        tracing::info!("enrollment capture cancelled");
        Ok(())
    }

    /// Pull one frame: processed during a session, kept as the preview while capturing.
    fn tick(&mut self) {
        let Some(camera) = self.camera.as_mut() else {
            return;
        };

        let frame = match camera.read_frame() {
            Ok(frame) => {
                self.read_failures = 0;
                frame
            }
            Err(e) => {
                self.read_failures += 1;
                tracing::warn!(error = %e, failures = self.read_failures, "frame read failed");
                if self.read_failures >= self.settings.max_read_failures {
                    self.give_up_camera(e);
                }
                return;
            }
        };

        if !self.station.is_session_active() {
            self.latest = Some(frame.clone());
            self.preview = Some(frame);
            return;
        }

        match self
            .station
            .process_frame(&mut self.encoder, &frame, Local::now())
        {
            Ok(outcome) => {
                for event in outcome.marks {
                    let _ = self.events.send(EngineEvent::Marked(event));
                }
                for (event, error) in outcome.failed {
                    let _ = self.events.send(EngineEvent::RecordFailed {
                        event,
                        error: error.to_string(),
                    });
                }
                self.latest = Some(outcome.overlay);
            }
            Err(e) => tracing::warn!(error = %e, "frame skipped"),
        }
    }

    fn give_up_camera(&mut self, error: CameraError) {
        self.release_camera();
        if !self.station.is_session_active() {
            tracing::error!(error = %error, "camera lost during enrollment capture");
            return;
        }
        match self.station.stop() {
            Ok(summary) => {
                tracing::error!(session = %summary.session_id, error = %error, "camera lost; session stopped");
                let _ = self.events.send(EngineEvent::CameraLost {
                    summary,
                    error: error.to_string(),
                });
            }
            Err(e) => tracing::error!(error = %e, "failed to stop session after camera loss"),
        }
    }
}
