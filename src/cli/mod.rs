//! rustfuse CLI entrypoint.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use glam::DVec3;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::{ConfigError, ConfigLoader, FusionConfig, FusionMode, LogFormat, SinkKind};
use crate::core::{PointCloud, SE3};
use crate::fusion::{Downsampler, VoxelGrid};
use crate::io::{
    export_outputs, load_cloud, save_cloud, DatasetError, DirectorySource, ExportError, ExportedFiles, FrameSource,
    PlyError, POSES_FILE,
};
use crate::pipeline::{FusionPipeline, PipelineError, RunReport};
use crate::registration::{rms_error, AlignmentError, KabschAligner, RigidAligner};

/// rustfuse command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "rustfuse", version, about = "Drift-corrected point cloud fusion")]
struct CliArgs {
    /// Run a standalone cloud tool instead of the fusion pipeline.
    #[command(subcommand)]
    tool: Option<Tool>,
    /// Dataset directory (poses.csv plus frames/).
    #[arg(long, value_name = "DIR")]
    input: Option<PathBuf>,
    /// Output directory path.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Path to TOML or YAML configuration file.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Streaming or full-batch processing.
    #[arg(long, value_enum)]
    mode: Option<FusionMode>,
    /// Frames per cycle.
    #[arg(long, value_name = "N")]
    window: Option<usize>,
    /// Worker threads used to build frame clouds.
    #[arg(long, value_name = "N")]
    batch_width: Option<usize>,
    /// Write a preview cloud after every cycle.
    #[arg(long)]
    preview: bool,
    /// Output format for the run summary.
    #[arg(long, value_enum, global = true)]
    output_format: Option<OutputFormat>,
    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevel>,
    /// Log format (text/json).
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Tool {
    /// Voxel-downsample a PLY cloud into downsampled_<name>.
    Downsample(DownsampleArgs),
    /// Rigidly align a PLY cloud onto another, pairing points by index, into aligned_<name>.
    Align(AlignArgs),
}

#[derive(Args, Debug)]
struct DownsampleArgs {
    #[arg(value_name = "CLOUD")]
    cloud: PathBuf,
    /// Voxel edge length; defaults to downsample.output_voxel_size.
    #[arg(long, value_name = "METERS")]
    voxel_size: Option<f32>,
    /// Drop voxels with fewer points; defaults to downsample.min_points_per_voxel.
    #[arg(long, value_name = "N")]
    min_points: Option<u32>,
    /// Directory for the result; defaults to the cloud's directory.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AlignArgs {
    /// Cloud to move.
    #[arg(value_name = "SOURCE")]
    source: PathBuf,
    /// Cloud to align onto; point i pairs with source point i.
    #[arg(value_name = "TARGET")]
    target: PathBuf,
    /// Directory for the result; defaults to the source cloud's directory.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

struct ResolvedConfig {
    input: PathBuf,
    output: PathBuf,
    output_format: OutputFormat,
    fusion: FusionConfig,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("input path is required but was not provided")]
    InputNotProvided,
    #[error("input directory not found: {0}")]
    InputMissing(PathBuf),
    #[error("input path is not a directory: {0}")]
    InputNotDirectory(PathBuf),
    #[error("failed to load config file {path}: {source}")]
    ConfigLoad { path: PathBuf, source: ConfigError },
    #[error("invalid configuration: {0}")]
    ConfigInvalid(ConfigError),
    #[error("failed to open dataset {path}: {source}")]
    Dataset { path: PathBuf, source: DatasetError },
    #[error("output path exists but is not a directory: {0}")]
    OutputNotDirectory(PathBuf),
    #[error("failed to create output directory {path}: {source}")]
    OutputCreate { path: PathBuf, source: std::io::Error },
    #[error("failed to write results to {path}: {source}")]
    OutputWrite { path: PathBuf, source: std::io::Error },
    #[error("failed to export outputs: {0}")]
    Export(#[from] ExportError),
    #[error("pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to serialize results: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to read cloud {path}: {source}")]
    CloudLoad { path: PathBuf, source: PlyError },
    #[error("failed to write cloud {path}: {source}")]
    CloudSave { path: PathBuf, source: PlyError },
    #[error("cloud alignment failed: {0}")]
    Alignment(#[from] AlignmentError),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::InputNotProvided
            | CliError::InputMissing(_)
            | CliError::InputNotDirectory(_)
            | CliError::ConfigLoad { .. }
            | CliError::ConfigInvalid(_)
            | CliError::Dataset { .. }
            | CliError::OutputNotDirectory(_)
            | CliError::CloudLoad { .. } => ExitCode::from(1),
            CliError::Alignment(err) if alignment_input_error(err) => ExitCode::from(1),
            CliError::OutputCreate { .. }
            | CliError::OutputWrite { .. }
            | CliError::Export(_)
            | CliError::Pipeline(_)
            | CliError::Serialize(_)
            | CliError::CloudSave { .. }
            | CliError::Alignment(_) => ExitCode::from(2),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            CliError::InputNotProvided
            | CliError::InputMissing(_)
            | CliError::InputNotDirectory(_)
            | CliError::Dataset { .. }
            | CliError::CloudLoad { .. } => "InputError",
            CliError::Alignment(err) if alignment_input_error(err) => "InputError",
            CliError::ConfigLoad { .. } | CliError::ConfigInvalid(_) => "ConfigError",
            CliError::OutputNotDirectory(_)
            | CliError::OutputCreate { .. }
            | CliError::OutputWrite { .. }
            | CliError::Export(_)
            | CliError::Serialize(_)
            | CliError::CloudSave { .. } => "OutputError",
            CliError::Pipeline(_) => "PipelineError",
            CliError::Alignment(_) => "AlignmentError",
        }
    }

    fn component(&self) -> &'static str {
        match self {
            CliError::InputNotProvided
            | CliError::InputMissing(_)
            | CliError::InputNotDirectory(_) => "cli",
            CliError::Dataset { .. } => "dataset",
            CliError::ConfigLoad { .. } | CliError::ConfigInvalid(_) => "config",
            CliError::OutputNotDirectory(_)
            | CliError::OutputCreate { .. }
            | CliError::OutputWrite { .. }
            | CliError::Export(_)
            | CliError::Serialize(_)
            | CliError::CloudLoad { .. }
            | CliError::CloudSave { .. } => "io",
            CliError::Pipeline(_) => "pipeline",
            CliError::Alignment(_) => "registration",
        }
    }

    fn suggestion(&self) -> &'static str {
        match self {
            CliError::InputNotProvided => "Pass --input <dataset-dir>.",
            CliError::InputMissing(_) => "Verify the input path and ensure the directory exists.",
            CliError::InputNotDirectory(_) => "Provide a dataset directory containing poses.csv and frames/.",
            CliError::ConfigLoad { .. } => "Check the config path, its extension (.toml/.yaml) and its syntax.",
            CliError::ConfigInvalid(_) => "Fix the reported field in the config or on the command line.",
            CliError::Dataset { .. } => "Check poses.csv for malformed rows and gaps in frame indices.",
            CliError::OutputNotDirectory(_) => "Choose an output path that is a directory.",
            CliError::OutputCreate { .. } => "Check write permissions or select a different output directory.",
            CliError::OutputWrite { .. } | CliError::Export(_) | CliError::Serialize(_) => {
                "Ensure the output directory is writable and has free space."
            }
            CliError::Pipeline(_) => "Run with --log-level debug for per-cycle diagnostics.",
            CliError::CloudLoad { .. } => "Check that the path points to a readable PLY file with x/y/z properties.",
            CliError::CloudSave { .. } => "Ensure the output directory is writable and has free space.",
            CliError::Alignment(AlignmentError::CardinalityMismatch { .. }) => {
                "Align clouds with the same point count and ordering, such as two exports of the same frames."
            }
            CliError::Alignment(_) => "Check both clouds for invalid or coincident points.",
        }
    }
}

fn alignment_input_error(err: &AlignmentError) -> bool {
    matches!(
        err,
        AlignmentError::CardinalityMismatch { .. } | AlignmentError::Empty | AlignmentError::NonFinite
    )
}

#[derive(Debug, Serialize)]
struct ErrorInfo {
    error_type: String,
    root_cause: String,
    component: String,
    suggestion: String,
}

#[derive(Debug, Default, Serialize)]
struct FusionStats {
    frames: usize,
    cycles: usize,
    degraded_frames: usize,
    accumulated_points: usize,
    downsampled_points: usize,
    viz_failures: usize,
}

impl From<&RunReport> for FusionStats {
    fn from(report: &RunReport) -> Self {
        Self {
            frames: report.frames,
            cycles: report.cycles.len(),
            degraded_frames: report.degraded_frames.len(),
            accumulated_points: report.accumulated_points,
            downsampled_points: report.downsampled_points,
            viz_failures: report.viz_failures,
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolStats {
    command: &'static str,
    input_points: usize,
    output_points: usize,
    output_file: PathBuf,
    /// Row-major 4x4 transform applied to the source cloud.
    #[serde(skip_serializing_if = "Option::is_none")]
    transform: Option<[[f64; 4]; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rms_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rms_after: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ResultsJson {
    status: String,
    version: String,
    input: Option<String>,
    output: Option<String>,
    config: Option<String>,
    processing_time_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    fusion: Option<FusionStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool: Option<ToolStats>,
    files: Option<ExportedFiles>,
    error: Option<ErrorInfo>,
}

pub fn run() -> ExitCode {
    run_with(CliArgs::parse())
}

fn run_with(cli: CliArgs) -> ExitCode {
    let start = Instant::now();
    let config_path = cli.config.clone();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_logger(&resolve_log_level(&cli, None), cli.log_format.unwrap_or_default());
            return handle_error(&err, start, None, &cli);
        }
    };

    let log_level = resolve_log_level(&cli, Some(&config));
    let log_format = cli.log_format.unwrap_or(config.logging.format);
    init_logger(&log_level, log_format);

    let mut merged = config;
    let overrides = apply_overrides(&mut merged, &cli);
    for override_entry in overrides {
        debug!("CLI override: {}", override_entry);
    }

    if let Some(tool) = &cli.tool {
        return run_tool(tool, merged, &cli, start);
    }

    let resolved = match finalize_config(merged, &cli) {
        Ok(resolved) => resolved,
        Err(err) => return handle_error(&err, start, None, &cli),
    };

    let output_dir = match ensure_output_dir(&resolved.output) {
        Ok(dir) => dir,
        Err(err) => return handle_error(&err, start, Some(&resolved), &cli),
    };

    info!("Starting rustfuse pipeline");
    info!("Input: {}", resolved.input.display());
    info!("Output: {}", output_dir.display());

    let (report, files) = match run_pipeline(&resolved, &output_dir) {
        Ok(result) => result,
        Err(err) => return handle_error(&err, start, Some(&resolved), &cli),
    };

    let results = ResultsJson {
        status: "success".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        input: Some(resolved.input.display().to_string()),
        output: Some(output_dir.display().to_string()),
        config: config_path.map(|path| path.display().to_string()),
        processing_time_ms: start.elapsed().as_millis(),
        fusion: Some(FusionStats::from(&report)),
        tool: None,
        files: Some(files),
        error: None,
    };

    if let Err(err) = emit_results(&results, &output_dir, resolved.output_format) {
        return handle_error(&err, start, Some(&resolved), &cli);
    }

    ExitCode::SUCCESS
}

fn load_config(cli: &CliArgs) -> Result<FusionConfig, CliError> {
    match &cli.config {
        Some(path) => ConfigLoader::load(path).map_err(|source| CliError::ConfigLoad {
            path: path.clone(),
            source,
        }),
        None => Ok(FusionConfig::default()),
    }
}

fn resolve_log_level(cli: &CliArgs, config: Option<&FusionConfig>) -> String {
    if let Some(level) = cli.log_level {
        return level.as_str().to_string();
    }

    if let Ok(level) = std::env::var("RUST_LOG") {
        if !level.trim().is_empty() {
            return level;
        }
    }

    if let Some(level) = config.and_then(|c| c.logging.level.as_ref()) {
        if !level.trim().is_empty() {
            return level.clone();
        }
    }

    "info".to_string()
}

fn init_logger(level: &str, format: LogFormat) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stderr);
    builder.filter_level(log::LevelFilter::Info);
    builder.parse_filters(level);
    builder.format(move |buf, record| {
        use std::io::Write;
        let module = record.module_path().unwrap_or(record.target());
        match format {
            LogFormat::Json => {
                let payload = json!({
                    "timestamp": buf.timestamp_millis().to_string(),
                    "level": record.level().to_string(),
                    "target": module,
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", payload)
            }
            LogFormat::Text => {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    buf.timestamp_millis(),
                    record.level(),
                    module,
                    record.args()
                )
            }
        }
    });

    if let Err(err) = builder.try_init() {
        eprintln!("Failed to initialize logger: {}", err);
    }
}

fn apply_overrides(config: &mut FusionConfig, cli: &CliArgs) -> Vec<String> {
    let mut overrides = Vec::new();

    if let Some(output) = cli.output.clone() {
        if config.output.dir != output {
            overrides.push(format!("output.dir = {}", output.display()));
        }
        config.output.dir = output;
    }

    if let Some(mode) = cli.mode {
        if config.pipeline.mode != mode {
            overrides.push(format!("pipeline.mode = {:?}", mode));
        }
        config.pipeline.mode = mode;
    }

    if let Some(window) = cli.window {
        if config.pipeline.window != window {
            overrides.push(format!("pipeline.window = {}", window));
        }
        config.pipeline.window = window;
    }

    if let Some(width) = cli.batch_width {
        if config.pipeline.batch_width != width {
            overrides.push(format!("pipeline.batch_width = {}", width));
        }
        config.pipeline.batch_width = width;
    }

    if cli.preview {
        if !config.viewer.enabled || config.viewer.sink != SinkKind::Ply {
            overrides.push("viewer = ply preview".to_string());
        }
        config.viewer.enabled = true;
        config.viewer.sink = SinkKind::Ply;
    }

    if let Some(level) = cli.log_level {
        let level = level.as_str().to_string();
        if config.logging.level.as_ref() != Some(&level) {
            overrides.push(format!("logging.level = {}", level));
        }
        config.logging.level = Some(level);
    }

    if let Some(format) = cli.log_format {
        if config.logging.format != format {
            overrides.push(format!("logging.format = {:?}", format));
        }
        config.logging.format = format;
    }

    overrides
}

fn finalize_config(config: FusionConfig, cli: &CliArgs) -> Result<ResolvedConfig, CliError> {
    let input = match &cli.input {
        Some(path) => path.clone(),
        None => return Err(CliError::InputNotProvided),
    };

    if !input.exists() {
        return Err(CliError::InputMissing(input));
    }
    if !input.is_dir() {
        return Err(CliError::InputNotDirectory(input));
    }

    config.validate().map_err(CliError::ConfigInvalid)?;

    Ok(ResolvedConfig {
        input,
        output: config.output.dir.clone(),
        output_format: cli.output_format.unwrap_or_default(),
        fusion: config,
    })
}

fn ensure_output_dir(output: &Path) -> Result<PathBuf, CliError> {
    if output.exists() {
        if output.is_dir() {
            return Ok(output.to_path_buf());
        }
        return Err(CliError::OutputNotDirectory(output.to_path_buf()));
    }

    fs::create_dir_all(output).map_err(|source| CliError::OutputCreate {
        path: output.to_path_buf(),
        source,
    })?;

    Ok(output.to_path_buf())
}

fn run_pipeline(config: &ResolvedConfig, output_dir: &Path) -> Result<(RunReport, ExportedFiles), CliError> {
    let source = DirectorySource::open(&config.input).map_err(|source| CliError::Dataset {
        path: config.input.join(POSES_FILE),
        source,
    })?;
    info!("Dataset: {} frames", source.len());

    let mut pipeline = FusionPipeline::new(config.fusion.clone())?;
    let output = pipeline.run(&source)?;

    if !output.report.degraded_frames.is_empty() {
        warn!(
            "{} frame(s) placed without a vision estimate: {:?}",
            output.report.degraded_frames.len(),
            output.report.degraded_frames
        );
    }

    let files = export_outputs(output_dir, &output, config.fusion.output.format)?;
    info!(
        "Fusion completed: frames={}, accumulated={}, downsampled={}",
        output.report.frames, output.report.accumulated_points, output.report.downsampled_points
    );

    Ok((output.report, files))
}

fn emit_results(results: &ResultsJson, output_dir: &Path, format: OutputFormat) -> Result<(), CliError> {
    let path = output_dir.join("results.json");
    let payload = serde_json::to_string_pretty(results)?;
    fs::write(&path, &payload).map_err(|source| CliError::OutputWrite {
        path: path.clone(),
        source,
    })?;
    info!("Results written to {}", path.display());

    match format {
        OutputFormat::Json => println!("{}", payload),
        OutputFormat::Text => print_text_summary(results),
    }
    Ok(())
}

fn print_text_summary(results: &ResultsJson) {
    println!("rustfuse results");
    println!("Status: {}", results.status);
    if let Some(input) = &results.input {
        println!("Input: {}", input);
    }
    if let Some(output) = &results.output {
        println!("Output: {}", output);
    }
    println!("Processing time (ms): {}", results.processing_time_ms);
    if let Some(fusion) = &results.fusion {
        println!("Frames: {}", fusion.frames);
        println!("Cycles: {}", fusion.cycles);
        println!("Degraded frames: {}", fusion.degraded_frames);
        println!("Accumulated points: {}", fusion.accumulated_points);
        println!("Downsampled points: {}", fusion.downsampled_points);
    }
    if let Some(tool) = &results.tool {
        println!("Tool: {}", tool.command);
        println!("Points: {} -> {}", tool.input_points, tool.output_points);
        if let (Some(before), Some(after)) = (tool.rms_before, tool.rms_after) {
            println!("Pair RMS: {:.6} -> {:.6}", before, after);
        }
        println!("Written: {}", tool.output_file.display());
    }
}

fn run_tool(tool: &Tool, config: FusionConfig, cli: &CliArgs, start: Instant) -> ExitCode {
    let (input, outcome) = match tool {
        Tool::Downsample(args) => (&args.cloud, run_downsample(args, config)),
        Tool::Align(args) => (&args.source, run_align(args, &config)),
    };
    let (output_dir, stats) = match outcome {
        Ok(outcome) => outcome,
        Err(err) => return handle_error(&err, start, None, cli),
    };

    let results = ResultsJson {
        status: "success".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        input: Some(input.display().to_string()),
        output: Some(output_dir.display().to_string()),
        config: cli.config.as_ref().map(|path| path.display().to_string()),
        processing_time_ms: start.elapsed().as_millis(),
        fusion: None,
        tool: Some(stats),
        files: None,
        error: None,
    };
    if let Err(err) = emit_results(&results, &output_dir, cli.output_format.unwrap_or_default()) {
        return handle_error(&err, start, None, cli);
    }
    ExitCode::SUCCESS
}

fn run_downsample(args: &DownsampleArgs, mut config: FusionConfig) -> Result<(PathBuf, ToolStats), CliError> {
    if let Some(size) = args.voxel_size {
        config.downsample.output_voxel_size = size;
    }
    if let Some(min_points) = args.min_points {
        config.downsample.min_points_per_voxel = min_points;
    }
    config.validate().map_err(CliError::ConfigInvalid)?;
    let voxel_size = config.downsample.output_voxel_size;

    let cloud = read_cloud(&args.cloud)?;
    let downsampled = VoxelGrid::new(config.downsample.min_points_per_voxel).downsample(&cloud, voxel_size);

    let output_dir = ensure_output_dir(&tool_output_dir(&args.cloud, args.output.as_deref()))?;
    let path = output_dir.join(prefixed_name("downsampled_", &args.cloud));
    save_cloud(&path, &downsampled, config.output.format).map_err(|source| CliError::CloudSave {
        path: path.clone(),
        source,
    })?;
    info!(
        "Downsampled {} from {} to {} points (voxel {}), written to {}",
        args.cloud.display(),
        cloud.len(),
        downsampled.len(),
        voxel_size,
        path.display()
    );

    Ok((
        output_dir,
        ToolStats {
            command: "downsample",
            input_points: cloud.len(),
            output_points: downsampled.len(),
            output_file: path,
            transform: None,
            rms_before: None,
            rms_after: None,
        },
    ))
}

fn run_align(args: &AlignArgs, config: &FusionConfig) -> Result<(PathBuf, ToolStats), CliError> {
    let source = read_cloud(&args.source)?;
    let target = read_cloud(&args.target)?;
    if source.len() != target.len() {
        return Err(AlignmentError::CardinalityMismatch {
            source_len: source.len(),
            target_len: target.len(),
        }
        .into());
    }

    // Pairs with an invalid point on either side carry no constraint.
    let (from, to): (Vec<DVec3>, Vec<DVec3>) = source
        .iter()
        .zip(target.iter())
        .filter(|(s, t)| s.is_valid() && t.is_valid())
        .map(|(s, t)| (s.position.as_dvec3(), t.position.as_dvec3()))
        .unzip();
    let transform = KabschAligner::new().align(&from, &to)?;
    let rms_before = rms_error(&SE3::identity(), &from, &to);
    let rms_after = rms_error(&transform, &from, &to);
    let aligned = source.transformed(&transform);

    let output_dir = ensure_output_dir(&tool_output_dir(&args.source, args.output.as_deref()))?;
    let path = output_dir.join(prefixed_name("aligned_", &args.source));
    save_cloud(&path, &aligned, config.output.format).map_err(|source| CliError::CloudSave {
        path: path.clone(),
        source,
    })?;
    info!(
        "Aligned {} onto {} over {} pairs: rms {:.6} -> {:.6}, written to {}",
        args.source.display(),
        args.target.display(),
        from.len(),
        rms_before,
        rms_after,
        path.display()
    );

    Ok((
        output_dir,
        ToolStats {
            command: "align",
            input_points: source.len(),
            output_points: aligned.len(),
            output_file: path,
            transform: Some(transform.to_matrix().transpose().to_cols_array_2d()),
            rms_before: Some(rms_before),
            rms_after: Some(rms_after),
        },
    ))
}

fn read_cloud(path: &Path) -> Result<PointCloud, CliError> {
    load_cloud(path).map_err(|source| CliError::CloudLoad {
        path: path.to_path_buf(),
        source,
    })
}

fn tool_output_dir(cloud: &Path, output: Option<&Path>) -> PathBuf {
    match (output, cloud.parent()) {
        (Some(dir), _) => dir.to_path_buf(),
        (None, Some(parent)) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn prefixed_name(prefix: &str, cloud: &Path) -> String {
    let name = cloud
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cloud.ply".to_string());
    format!("{prefix}{name}")
}

fn handle_error(err: &CliError, start: Instant, resolved: Option<&ResolvedConfig>, cli: &CliArgs) -> ExitCode {
    let input = resolved.map(|r| r.input.clone()).or_else(|| cli.input.clone());
    let output = resolved.map(|r| r.output.clone()).or_else(|| cli.output.clone());

    let error_info = ErrorInfo {
        error_type: err.error_type().to_string(),
        root_cause: err.to_string(),
        component: err.component().to_string(),
        suggestion: err.suggestion().to_string(),
    };

    error!(
        "{}: {} (component: {})",
        error_info.error_type, error_info.root_cause, error_info.component
    );

    eprintln!("Error: {}", error_info.error_type);
    eprintln!("Component: {}", error_info.component);
    eprintln!("Cause: {}", error_info.root_cause);
    eprintln!("Suggestion: {}", error_info.suggestion);

    let results = ResultsJson {
        status: "error".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        input: input.map(|path| path.display().to_string()),
        output: output.as_ref().map(|path| path.display().to_string()),
        config: cli.config.as_ref().map(|path| path.display().to_string()),
        processing_time_ms: start.elapsed().as_millis(),
        fusion: None,
        tool: None,
        files: None,
        error: Some(error_info),
    };

    let format = resolved.map(|r| r.output_format).or(cli.output_format).unwrap_or_default();
    match output {
        Some(dir) if dir.is_dir() => {
            if let Err(e) = emit_results(&results, &dir, format) {
                warn!("Failed to write error results to {}: {e}", dir.display());
            }
        }
        _ => {
            if let Ok(payload) = serde_json::to_string_pretty(&results) {
                println!("{}", payload);
            }
        }
    }

    err.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PlyFormat;
    use crate::core::ColoredPoint;
    use crate::test_utils::{create_sequence, TrajectoryType};
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("rustfuse").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_overrides_are_reported_only_when_changed() {
        let cli = parse(&["--window", "10", "--batch-width", "3", "--mode", "offline"]);
        let mut config = FusionConfig::default();
        let overrides = apply_overrides(&mut config, &cli);

        assert_eq!(config.pipeline.batch_width, 3);
        assert_eq!(config.pipeline.mode, FusionMode::Offline);
        assert_eq!(overrides.len(), 2);
        assert!(overrides.iter().any(|o| o.starts_with("pipeline.batch_width")));
        assert!(!overrides.iter().any(|o| o.starts_with("pipeline.window")));
    }

    #[test]
    fn test_preview_enables_ply_viewer() {
        let cli = parse(&["--preview"]);
        let mut config = FusionConfig::default();
        apply_overrides(&mut config, &cli);
        assert!(config.viewer.enabled);
        assert_eq!(config.viewer.sink, SinkKind::Ply);
    }

    #[test]
    fn test_log_level_precedence() {
        let cli = parse(&["--log-level", "warn"]);
        let mut config = FusionConfig::default();
        config.logging.level = Some("trace".to_string());
        assert_eq!(resolve_log_level(&cli, Some(&config)), "warn");
    }

    #[test]
    fn test_missing_input_is_rejected() {
        let cli = parse(&[]);
        let err = finalize_config(FusionConfig::default(), &cli).err().unwrap();
        assert!(matches!(err, CliError::InputNotProvided));
        assert_eq!(err.error_type(), "InputError");
    }

    #[test]
    fn test_input_must_be_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = parse(&["--input", &path]);
        let err = finalize_config(FusionConfig::default(), &cli).err().unwrap();
        assert!(matches!(err, CliError::InputNotDirectory(_)));
    }

    #[test]
    fn test_invalid_override_fails_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let cli = parse(&["--input", &path, "--window", "0"]);
        let mut config = FusionConfig::default();
        apply_overrides(&mut config, &cli);
        let err = finalize_config(config, &cli).err().unwrap();
        assert!(matches!(err, CliError::ConfigInvalid(_)));
        assert_eq!(err.component(), "config");
    }

    #[test]
    fn test_run_pipeline_exports_outputs() {
        let input = tempdir().unwrap();
        let output = tempdir().unwrap();
        let frames = create_sequence(4, 4, 3, TrajectoryType::Line);
        DirectorySource::write(input.path(), &frames, PlyFormat::Ascii).unwrap();

        let mut fusion = FusionConfig::default();
        fusion.pipeline.window = 2;
        fusion.output.dir = output.path().to_path_buf();
        let resolved = ResolvedConfig {
            input: input.path().to_path_buf(),
            output: output.path().to_path_buf(),
            output_format: OutputFormat::Json,
            fusion,
        };

        let (report, files) = run_pipeline(&resolved, output.path()).unwrap();
        assert_eq!(report.frames, 4);
        assert_eq!(report.cycles.len(), 2);
        assert!(files.accumulated.exists());
        assert!(files.report.exists());
    }

    fn lattice(steps: usize, spacing: f64) -> Vec<DVec3> {
        let mut positions = Vec::new();
        for x in 0..steps {
            for y in 0..steps {
                for z in 0..steps {
                    positions.push(DVec3::new(x as f64, y as f64, z as f64) * spacing);
                }
            }
        }
        positions
    }

    #[test]
    fn test_tool_subcommands_parse() {
        let cli = parse(&["downsample", "cloud.ply", "--voxel-size", "0.2", "--log-level", "debug"]);
        match cli.tool {
            Some(Tool::Downsample(args)) => {
                assert_eq!(args.cloud, PathBuf::from("cloud.ply"));
                assert_eq!(args.voxel_size, Some(0.2));
                assert!(args.min_points.is_none());
            }
            other => panic!("unexpected tool: {:?}", other),
        }
        assert!(matches!(cli.log_level, Some(LogLevel::Debug)));

        let cli = parse(&["align", "a.ply", "b.ply", "--output", "out"]);
        match cli.tool {
            Some(Tool::Align(args)) => {
                assert_eq!(args.target, PathBuf::from("b.ply"));
                assert_eq!(args.output, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected tool: {:?}", other),
        }
        assert!(parse(&[]).tool.is_none());
    }

    #[test]
    fn test_downsample_tool_writes_prefixed_cloud() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("scan.ply");
        let cloud = PointCloud::from_positions(&lattice(10, 0.1), [200, 100, 50]);
        save_cloud(&input, &cloud, PlyFormat::Ascii).unwrap();

        let args = DownsampleArgs {
            cloud: input.clone(),
            voxel_size: Some(0.25),
            min_points: None,
            output: None,
        };
        let (output_dir, stats) = run_downsample(&args, FusionConfig::default()).unwrap();

        let expected = VoxelGrid::new(1).downsample(&load_cloud(&input).unwrap(), 0.25);
        assert_eq!(output_dir, dir.path());
        assert_eq!(stats.output_file, dir.path().join("downsampled_scan.ply"));
        assert_eq!(stats.input_points, 1000);
        assert_eq!(stats.output_points, expected.len());
        assert!(stats.output_points < stats.input_points);
        assert_eq!(load_cloud(&stats.output_file).unwrap().len(), expected.len());
    }

    #[test]
    fn test_downsample_tool_rejects_bad_voxel() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("scan.ply");
        save_cloud(&input, &PointCloud::from_positions(&lattice(2, 0.1), [0, 0, 0]), PlyFormat::Ascii).unwrap();

        let args = DownsampleArgs {
            cloud: input,
            voxel_size: Some(-1.0),
            min_points: None,
            output: None,
        };
        let err = run_downsample(&args, FusionConfig::default()).err().unwrap();
        assert!(matches!(err, CliError::ConfigInvalid(_)));
        assert!(!dir.path().join("downsampled_scan.ply").exists());
    }

    #[test]
    fn test_align_tool_recovers_rigid_motion() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("aligned");
        let target_positions = lattice(3, 0.5);
        let motion = SE3::from_axis_angle(DVec3::new(1.0, 2.0, 0.5).normalize(), 0.4, DVec3::new(0.3, -0.2, 1.0));
        let source_positions: Vec<DVec3> = target_positions.iter().map(|p| motion.transform_point(*p)).collect();

        let source = dir.path().join("moved.ply");
        let target = dir.path().join("reference.ply");
        let mut source_cloud = PointCloud::from_positions(&source_positions, [10, 20, 30]);
        source_cloud.push(ColoredPoint::invalid());
        let mut target_cloud = PointCloud::from_positions(&target_positions, [10, 20, 30]);
        target_cloud.push(ColoredPoint::new(glam::Vec3::ONE, [0, 0, 0]));
        save_cloud(&source, &source_cloud, PlyFormat::BinaryLittleEndian).unwrap();
        save_cloud(&target, &target_cloud, PlyFormat::BinaryLittleEndian).unwrap();

        let args = AlignArgs {
            source,
            target,
            output: Some(out.clone()),
        };
        let (output_dir, stats) = run_align(&args, &FusionConfig::default()).unwrap();
        assert_eq!(output_dir, out);
        assert_eq!(stats.output_file, out.join("aligned_moved.ply"));
        assert_eq!(stats.output_points, 28);
        assert!(stats.rms_before.unwrap() > 0.1);
        assert!(stats.rms_after.unwrap() < 1e-4);

        let aligned = load_cloud(&stats.output_file).unwrap();
        for (point, expected) in aligned.iter().zip(&target_positions) {
            assert!(point.position.as_dvec3().distance(*expected) < 1e-3);
        }
        assert!(!aligned.points()[27].is_valid());
    }

    #[test]
    fn test_align_tool_rejects_mismatched_clouds() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.ply");
        let target = dir.path().join("b.ply");
        save_cloud(&source, &PointCloud::from_positions(&lattice(2, 1.0), [0, 0, 0]), PlyFormat::Ascii).unwrap();
        save_cloud(&target, &PointCloud::from_positions(&lattice(3, 1.0), [0, 0, 0]), PlyFormat::Ascii).unwrap();

        let args = AlignArgs {
            source,
            target,
            output: None,
        };
        let err = run_align(&args, &FusionConfig::default()).err().unwrap();
        assert!(matches!(
            err,
            CliError::Alignment(AlignmentError::CardinalityMismatch { source_len: 8, target_len: 27 })
        ));
        assert_eq!(err.error_type(), "InputError");
        assert_eq!(format!("{:?}", err.exit_code()), format!("{:?}", ExitCode::from(1)));
        assert!(!dir.path().join("aligned_a.ply").exists());
    }

    #[test]
    fn test_align_tool_reports_missing_cloud() {
        let dir = tempdir().unwrap();
        let args = AlignArgs {
            source: dir.path().join("absent.ply"),
            target: dir.path().join("absent.ply"),
            output: None,
        };
        let err = run_align(&args, &FusionConfig::default()).err().unwrap();
        assert!(matches!(err, CliError::CloudLoad { .. }));
        assert_eq!(err.component(), "io");
    }

    #[test]
    fn test_unwritable_error_results_still_exit_with_error_code() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("results.json")).unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let cli = parse(&["--output", &path, "--output-format", "text"]);

        let code = handle_error(&CliError::InputNotProvided, Instant::now(), None, &cli);
        assert_eq!(format!("{:?}", code), format!("{:?}", ExitCode::from(1)));
        assert!(dir.path().join("results.json").is_dir());
    }
}
