//! Fit a single PLY scan and write the result artifacts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use face_forge::config::Config;
use face_forge::io::read_ply;
use face_forge::landmarks::LandmarkEmbedding;
use face_forge::model::{
    FlameAsset, FlameModel, LandmarkEmbeddingAsset, DEFAULT_EMBEDDING_PATH, DEFAULT_MODEL_PATH,
};
use face_forge::pipeline::{FitPipeline, JobOptions};
use face_forge::units::UnitLabel;

#[derive(Parser, Debug)]
#[command(name = "fit-one")]
#[command(about = "Fit the face model to a PLY scan and export mesh, landmarks and diagnostics")]
struct Args {
    /// Input PLY point cloud
    input: PathBuf,

    /// Output directory for artifacts
    #[arg(short, long, default_value = "out")]
    out_dir: PathBuf,

    /// Scan identifier used in artifact file names
    #[arg(long, default_value = "scan")]
    scan_id: String,

    /// Model asset (NPZ)
    #[arg(long, env = "FACE_FORGE_MODEL")]
    model: Option<PathBuf>,

    /// Landmark embedding asset (NPZ)
    #[arg(long, env = "FACE_FORGE_EMBEDDING")]
    embedding: Option<PathBuf>,

    /// Optional TOML configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Explicit unit scale override (e.g. 0.001 for millimeter input)
    #[arg(long)]
    unit_scale: Option<f32>,

    /// Explicit unit label override: meters | millimeters
    #[arg(long)]
    units: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };

    let model_path = args.model.unwrap_or_else(|| DEFAULT_MODEL_PATH.clone());
    let embedding_path = args
        .embedding
        .unwrap_or_else(|| DEFAULT_EMBEDDING_PATH.clone());

    let asset = FlameAsset::load(&model_path)
        .with_context(|| format!("loading model asset {}", model_path.display()))?;
    let embedding_asset = LandmarkEmbeddingAsset::load(&embedding_path)
        .with_context(|| format!("loading landmark embedding {}", embedding_path.display()))?;

    let device = Default::default();
    let model = FlameModel::from_asset(&asset, &device);
    let embedding = LandmarkEmbedding::from_asset(&embedding_asset, model.faces())?;

    let cloud = read_ply(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;

    let override_units = match args.units.as_deref() {
        Some("meters") => Some(UnitLabel::Meters),
        Some("millimeters") => Some(UnitLabel::Millimeters),
        Some(other) => anyhow::bail!("unknown unit label '{}'", other),
        None => None,
    };

    let options = JobOptions {
        override_scale: args.unit_scale,
        override_units,
        ..JobOptions::default()
    };

    let pipeline = FitPipeline::new(&model, &embedding, &config);
    let outcome = pipeline.run(cloud, &options)?;
    pipeline.export(&outcome, &args.out_dir, &args.scan_id)?;

    println!(
        "pass_fit={} confidence={:.3} p95={:.2}mm landmark_rms={:.2}mm nose_p95={:.2}mm",
        outcome.qc.pass_fit,
        outcome.qc.confidence,
        outcome.metrics.p95_mm,
        outcome.metrics.landmark_rms_mm,
        outcome.metrics.nose_p95_mm,
    );
    if !outcome.qc.warnings.is_empty() {
        println!("warnings: {}", outcome.qc.warnings.join(", "));
    }

    Ok(())
}
