use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::attendance::read_records;
use rollcall_core::types::confidence_percent;
use rollcall_core::{AttendanceRecord, CsvAttendanceSink, Gallery, MarkEvent, OnnxFaceEncoder, Station};
use rollcall_hw::Camera;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, EngineEvent, EngineHandle, EngineSettings, V4l2Provider};

#[derive(Parser)]
#[command(name = "rollcall", about = "Webcam face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an attendance session until Ctrl-C
    Session {
        /// Subject recorded with every attendance row (e.g., "Math")
        #[arg(short, long)]
        subject: String,
        /// Periodically write the annotated camera frame to this file
        #[arg(long)]
        overlay: Option<PathBuf>,
        /// Print marks as JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Enroll a face from an image file, or from the camera
    Enroll {
        /// Identity label (also the gallery file name)
        #[arg(short, long)]
        label: String,
        /// Image to enroll; captures from the camera when omitted
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// List enrolled identities
    List,
    /// Print recorded attendance
    Report {
        /// Only rows from this session id
        #[arg(long)]
        session: Option<String>,
    },
    /// Open the attendance file in the default application
    Export,
    /// Run camera diagnostics
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Session {
            subject,
            overlay,
            json,
        } => {
            let (engine, events) = start_engine(&config)?;
            run_session(&engine, events, &subject, overlay.as_deref(), json).await?;
        }
        Commands::Enroll { label, image } => {
            let (engine, _events) = start_engine(&config)?;
            let size = match image {
                Some(path) => {
                    let image = image::open(&path)
                        .with_context(|| format!("failed to open {}", path.display()))?
                        .into_rgb8();
                    engine.enroll_image(&label, image).await?
                }
                None => {
                    engine.begin_capture().await?;
                    println!("Look at the camera. Press Enter to capture, or q then Enter to cancel.");
                    let stdin = BufReader::new(tokio::io::stdin());
                    if !confirm_capture(stdin, tokio::signal::ctrl_c()).await? {
                        engine.cancel_capture().await?;
                        println!("Enrollment cancelled");
                        return Ok(());
                    }
                    engine.capture_enroll(&label).await?
                }
            };
            println!("Enrolled '{label}' ({size} encodings in gallery)");
        }
        Commands::List => {
            let mut encoder = OnnxFaceEncoder::load(&config.model_dir)?;
            let gallery = Gallery::load(&config.gallery_dir, &mut encoder)?;
            let labels = gallery.labels();
            if labels.is_empty() {
                println!("No faces enrolled in {}", config.gallery_dir.display());
            }
            for label in labels {
                println!("{label}");
            }
        }
        Commands::Report { session } => {
            let records = load_report(&config.attendance_path, session.as_deref())?;
            if records.is_empty() {
                println!("No attendance recorded");
            } else {
                println!(
                    "{:<10} {:<20} {:<20} {:<10} {:<8} {:>10}",
                    "SESSION", "NAME", "SUBJECT", "DATE", "TIME", "CONFIDENCE"
                );
                for r in &records {
                    println!(
                        "{:<10} {:<20} {:<20} {:<10} {:<8} {:>9.2}%",
                        r.session_id,
                        r.identity,
                        r.subject,
                        r.date,
                        r.time.format("%H:%M:%S"),
                        r.confidence
                    );
                }
                println!("{} record(s)", records.len());
            }
        }
        Commands::Export => {
            let path = &config.attendance_path;
            if !path.exists() {
                bail!("attendance file {} does not exist yet", path.display());
            }
            let status = std::process::Command::new("xdg-open")
                .arg(path)
                .status()
                .context("failed to run xdg-open")?;
            if !status.success() {
                bail!("xdg-open exited with {status}");
            }
        }
        Commands::Test => {
            println!("Running camera diagnostics...");
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in &devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }

            let mut stream = Camera::open(&config.camera_device)?.stream()?;
            stream.warm_up(config.warmup_frames);
            let frame = stream.next_frame()?;
            println!(
                "Captured {}x{} frame #{} from {} ({:?})",
                frame.width(),
                frame.height(),
                frame.sequence,
                config.camera_device,
                stream.camera().pixel_format()
            );
            if frame.is_dark(0.95) {
                println!("Warning: frame is almost entirely dark; check lighting or lens cover");
            }
        }
    }

    Ok(())
}

fn start_engine(config: &Config) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>)> {
    let mut encoder = OnnxFaceEncoder::load(&config.model_dir)?;
    let gallery = Gallery::load(&config.gallery_dir, &mut encoder)?.with_mode(config.enroll_mode);
    if gallery.is_empty() {
        tracing::warn!(dir = %config.gallery_dir.display(), "gallery is empty; every face will be Unknown");
    }

    let sink = CsvAttendanceSink::new(&config.attendance_path);
    let station = Station::new(gallery, config.policy, sink);
    let cameras = V4l2Provider {
        device: config.camera_device.clone(),
        warmup_frames: config.warmup_frames,
    };
    let settings = EngineSettings {
        tick: config.tick,
        max_read_failures: config.max_read_failures,
    };
    Ok(spawn_engine(encoder, station, cameras, settings)?)
}

async fn run_session(
    engine: &EngineHandle,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    subject: &str,
    overlay: Option<&Path>,
    json: bool,
) -> Result<()> {
    let session_id = engine.start_session(subject).await?;
    println!("Session {session_id} started for '{subject}'. Press Ctrl-C to stop.");
    if !json {
        println!("{:<8} {:<20} {:>10}", "TIME", "NAME", "CONFIDENCE");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut refresh = tokio::time::interval(Duration::from_secs(1));

    let summary = loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                break engine.stop_session().await?;
            }
            Some(event) = events.recv() => match event {
                EngineEvent::Marked(mark) => print_mark(&mark, json)?,
                EngineEvent::RecordFailed { event, error } => {
                    eprintln!("Could not record {}: {error}", event.label);
                }
                EngineEvent::CameraLost { summary, error } => {
                    eprintln!("Camera lost, session stopped: {error}");
                    break summary;
                }
            },
            _ = refresh.tick(), if overlay.is_some() => {
                if let (Some(path), Some(frame)) = (overlay, engine.snapshot().await?) {
                    if let Err(e) = frame.save(path) {
                        tracing::warn!(path = %path.display(), error = %e, "failed to write overlay");
                    }
                }
            }
        }
    };

    println!("Session {} ended. Total marked: {}", summary.session_id, summary.count());
    if !summary.marked.is_empty() {
        println!("Present: {}", summary.marked.join(", "));
    }
    Ok(())
}

/// Wait for the operator: an empty line confirms, `q`, end of input or `cancel` aborts.
async fn confirm_capture<R, C>(input: R, cancel: C) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    C: Future<Output = std::io::Result<()>>,
{
    let mut lines = input.lines();
    tokio::pin!(cancel);
    loop {
        tokio::select! {
            res = &mut cancel => {
                res?;
                return Ok(false);
            }
            line = lines.next_line() => match line? {
                None => return Ok(false),
                Some(line) => match line.trim() {
                    "" => return Ok(true),
                    "q" | "Q" => return Ok(false),
                    other => println!("Unrecognized input {other:?}: press Enter to capture or q to cancel"),
                },
            },
        }
    }
}

fn print_mark(mark: &MarkEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(mark)?);
    } else {
        println!(
            "{:<8} {:<20} {:>9.2}%",
            mark.timestamp.format("%H:%M:%S"),
            mark.label,
            confidence_percent(mark.confidence)
        );
    }
    Ok(())
}

/// Attendance rows, optionally for one session. A missing file is an empty report.
fn load_report(path: &Path, session: Option<&str>) -> Result<Vec<AttendanceRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut records = read_records(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if let Some(session) = session {
        records.retain(|r| r.session_id == session);
    }
    Ok(records)
}
