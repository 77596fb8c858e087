//! `lineup`: enroll faces from a camera or images and recognise them later.

mod config;
mod engine;
mod preview;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use engine::{spawn_engine, EngineHandle};
use image::GrayImage;
use lineup_core::capture::NoPreview;
use lineup_core::{
    AcquireOutcome, AcquireRequest, CancelToken, PreviewSink, RecognizeOutcome, SampleStore,
    Subject,
};
use lineup_hw::Camera;
use lineup_store::SqliteStore;
use preview::FilePreview;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lineup", about = "Face enrollment and recognition from a camera")]
struct Cli {
    /// TOML config file (default: $LINEUP_CONFIG, if set)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SubjectArgs {
    /// Positive subject id; reusing an id updates its name and label
    #[arg(long)]
    id: u32,
    #[arg(long)]
    name: String,
    /// Category shown with the name (e.g., the offence)
    #[arg(long, default_value = "")]
    label: String,
}

impl SubjectArgs {
    fn into_subject(self) -> Subject {
        Subject::new(self.id, self.name, self.label)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for a subject from the camera
    Enroll {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Samples to capture (default from config)
        #[arg(long)]
        quota: Option<usize>,
    },
    /// Add face samples for a subject from image files
    Upload {
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(required = true, value_name = "IMAGE")]
        images: Vec<PathBuf>,
    },
    /// Watch the camera (or search images) for an enrolled face
    Recognize {
        /// Search these images instead of the camera
        #[arg(long = "image", value_name = "IMAGE")]
        images: Vec<PathBuf>,
        /// Give up after this many seconds (default from config)
        #[arg(long)]
        timeout: Option<u64>,
        /// Save the enrolled sample that matched to this PNG
        #[arg(long, value_name = "FILE")]
        save_match: Option<PathBuf>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List enrolled subjects
    List {
        #[arg(long)]
        json: bool,
        /// Also write every enrolled sample to DIR/<id>/<key>.png
        #[arg(long, value_name = "DIR")]
        export: Option<PathBuf>,
    },
    /// Remove a subject and all of its samples
    Remove { id: u32 },
    /// Run camera diagnostics
    Test,
}

#[derive(Serialize)]
struct SubjectEntry {
    id: u32,
    name: Option<String>,
    label: Option<String>,
    samples: usize,
}

#[derive(Serialize)]
struct RecognizeReport {
    matched: bool,
    #[serde(flatten)]
    identification: Option<lineup_core::Identification>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { subject, quota } => {
            let store = open_store(&config)?;
            let engine = spawn_engine(&config, store)?;
            let request = AcquireRequest::new(subject.into_subject())
                .with_quota(quota.unwrap_or(config.quota));
            enroll(&engine, request, &config).await
        }
        Commands::Upload { subject, images } => {
            let uploads = images
                .iter()
                .map(|p| Ok((p.display().to_string(), load_gray(p)?)))
                .collect::<Result<Vec<_>>>()?;
            let store = open_store(&config)?;
            let engine = spawn_engine(&config, store)?;
            let subject = subject.into_subject();
            let id = subject.id;
            let report = engine.upload(subject, uploads).await?;
            for name in &report.skipped {
                println!("No face found in {name}");
            }
            println!("Stored {} face sample(s) for subject {id}", report.stored.len());
            Ok(())
        }
        Commands::Recognize {
            images,
            timeout,
            save_match,
            json,
        } => {
            let stills = if images.is_empty() {
                None
            } else {
                Some(images.iter().map(|p| load_gray(p)).collect::<Result<Vec<_>>>()?)
            };
            let timeout = match timeout {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => config.recognize_timeout(),
            };
            let store = open_store(&config)?;
            let engine = spawn_engine(&config, store.clone())?;
            recognize(&engine, store.as_ref(), stills, timeout, save_match.as_deref(), json, &config)
                .await
        }
        Commands::List { json, export } => {
            let store = open_store(&config)?;
            list(store.as_ref(), json)?;
            if let Some(dir) = export {
                let written = export_samples(store.as_ref(), &dir)?;
                if !json {
                    println!("Exported {written} sample(s) to {}", dir.display());
                }
            }
            Ok(())
        }
        Commands::Remove { id } => {
            let store = open_store(&config)?;
            let known = store.get_subject(id)?.is_some();
            let removed = store.remove_subject(id)?;
            if !known && removed == 0 {
                bail!("no subject with id {id}");
            }
            println!("Removed subject {id} ({removed} sample(s))");
            Ok(())
        }
        Commands::Test => camera_test(&config),
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)
        .with_context(|| format!("reading image {}", path.display()))?
        .to_luma8())
}

fn preview_for(config: &Config) -> Box<dyn PreviewSink> {
    match &config.preview_path {
        Some(path) => Box::new(FilePreview::new(path)),
        None => Box::new(NoPreview),
    }
}

/// Cancel `token` on Ctrl-C, and after `timeout` if one is given.
fn cancel_on_signal(token: &CancelToken, timeout: Option<Duration>) {
    let on_ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            on_ctrl_c.cancel();
        }
    });
    if let Some(timeout) = timeout {
        let on_timeout = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::info!(secs = timeout.as_secs(), "timed out");
            on_timeout.cancel();
        });
    }
}

async fn enroll(engine: &EngineHandle, request: AcquireRequest, config: &Config) -> Result<()> {
    let subject = request.subject.clone();
    println!(
        "Enrolling {} (id {}): look at the camera, Ctrl-C to stop",
        subject.name, subject.id
    );
    let cancel = CancelToken::new();
    cancel_on_signal(&cancel, None);

    match engine.enroll(request, cancel, preview_for(config)).await? {
        AcquireOutcome::Complete { samples } => {
            println!("Captured {} face sample(s) for {}", samples.len(), subject.name);
        }
        AcquireOutcome::Cancelled { samples } => {
            println!(
                "Stopped early: kept {} face sample(s) for {}",
                samples.len(),
                subject.name
            );
        }
    }
    Ok(())
}

async fn recognize(
    engine: &EngineHandle,
    store: &dyn SampleStore,
    stills: Option<Vec<GrayImage>>,
    timeout: Option<Duration>,
    save_match: Option<&Path>,
    json: bool,
    config: &Config,
) -> Result<()> {
    let cancel = CancelToken::new();
    let preview: Box<dyn PreviewSink> = if stills.is_some() {
        Box::new(NoPreview)
    } else {
        if !json {
            println!("Watching the camera, Ctrl-C to stop");
        }
        preview_for(config)
    };
    cancel_on_signal(&cancel, timeout);

    let outcome = engine.recognize(stills, cancel, preview).await?;
    let identification = match outcome {
        RecognizeOutcome::Matched(id) => Some(id),
        RecognizeOutcome::Aborted => None,
    };

    if let (Some(id), Some(path)) = (&identification, save_match) {
        let sample = store
            .get_sample(&id.result.representative)?
            .with_context(|| format!("sample {} disappeared", id.result.representative))?;
        sample
            .pixels
            .save(path)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    if json {
        let report = RecognizeReport {
            matched: identification.is_some(),
            identification,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match identification {
        Some(id) => {
            let r = &id.result;
            match &id.subject {
                Some(s) => println!("Match: {} (id {}, {})", s.name, s.id, s.label),
                None => println!("Match: subject {} (no metadata)", r.subject_id),
            }
            println!(
                "  confidence {:.1}  distance {:.2}  sample {}",
                r.confidence, r.distance, r.representative
            );
        }
        None => println!("No match"),
    }
    Ok(())
}

fn list(store: &dyn SampleStore, json: bool) -> Result<()> {
    let subjects = store.get_all_metadata()?;
    let counts = store.sample_counts()?;

    let mut ids: Vec<u32> = subjects.keys().chain(counts.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();
    let entries: Vec<SubjectEntry> = ids
        .into_iter()
        .map(|id| SubjectEntry {
            id,
            name: subjects.get(&id).map(|s| s.name.clone()),
            label: subjects.get(&id).map(|s| s.label.clone()),
            samples: counts.get(&id).copied().unwrap_or(0),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No subjects enrolled");
        return Ok(());
    }
    println!("{:>6}  {:<24} {:<16} {:>7}", "ID", "NAME", "LABEL", "SAMPLES");
    for e in &entries {
        println!(
            "{:>6}  {:<24} {:<16} {:>7}",
            e.id,
            e.name.as_deref().unwrap_or("-"),
            e.label.as_deref().unwrap_or("-"),
            e.samples
        );
    }
    Ok(())
}

/// Write each stored sample as `dir/<subject id>/<sample key>.png`.
fn export_samples(store: &dyn SampleStore, dir: &Path) -> Result<usize> {
    let samples = store.list_samples()?;
    for sample in &samples {
        let subject_dir = dir.join(sample.key.subject_id.to_string());
        std::fs::create_dir_all(&subject_dir)
            .with_context(|| format!("creating {}", subject_dir.display()))?;
        let path = subject_dir.join(format!("{}.png", sample.key));
        sample
            .pixels
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    tracing::info!(dir = %dir.display(), samples = samples.len(), "samples exported");
    Ok(samples.len())
}

fn camera_test(config: &Config) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("opening {}", config.camera_device))?;
    println!(
        "Opened {} at {}x{} ({})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );
    let frame = camera.capture_frame().context("capturing a frame")?;
    let mean = frame.pixels().map(|p| p.0[0] as f64).sum::<f64>() / frame.len().max(1) as f64;
    println!("Captured {}x{} frame, mean brightness {mean:.1}", frame.width(), frame.height());

    match lineup_core::HaarCascade::load(&config.cascade_path) {
        Ok(cascade) => {
            let faces = cascade.detect(&frame, &config.detect_params());
            println!("Faces located: {}", faces.len());
        }
        Err(e) => println!("Face locator unavailable: {e}"),
    }
    Ok(())
}
