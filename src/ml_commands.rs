//! サブコマンドの実行
//!
//! 設定ファイルを読み込み、CLIの指定で上書きしてから、
//! 選択されたデバイスのバックエンドで各処理を呼び出す。

use anyhow::{Context, Result};
use burn::backend::{Autodiff, Wgpu};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use std::path::{Path, PathBuf};

use crate::cli::{
    BenchmarkArgs, Cli, Commands, EvaluateArgs, ExportArgs, InspectArgs, PredictArgs, SurveyArgs,
    TrainArgs,
};
use crate::data::weed_dataset::{partition_directory, SplitOptions, WeedDataset};
use crate::gps::{GpsLink, SerialTransport};
use crate::ml::evaluation::{choose_samples, validation_samples};
use crate::ml::export::size_reduction;
use crate::ml::training::find_latest_checkpoint;
use crate::ml::{benchmark, evaluate, export_model, train, InferenceEngine, TrainingOptions};
use crate::model::config::{AppConfig, DeviceType};
use crate::model::labels::{ClassNames, LabelFile, LabelProvider};
use crate::survey::{list_frames, SurveyContext};
use crate::types::Split;

impl Cli {
    pub fn run(self) -> Result<()> {
        let mut config = AppConfig::load_or_default(&self.config);
        if let Some(device) = self.device {
            config.device_type = device;
        }
        tracing::debug!("デバイス: {}", config.device_type);

        match self.command {
            Commands::Train(args) => run_train(config, &args),
            Commands::Predict(args) => run_predict(&config, &args),
            Commands::Evaluate(args) => run_evaluate(&config, &args),
            Commands::Export(args) => run_export(&config, &args),
            Commands::Benchmark(args) => run_benchmark(&config, &args),
            Commands::Inspect(args) => run_inspect(&config, &args),
            Commands::Survey(args) => run_survey(&config, &args),
        }
    }
}

/// `--model`、設定ファイル、出力先の最新 run の順に探す
fn model_path(config: &AppConfig, arg: &Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = arg.clone().or_else(|| config.model.model_path.clone()) {
        return Ok(path);
    }
    let path = find_latest_checkpoint(&config.training.output_dir)?;
    tracing::info!("最新の学習結果を使用します: {}", path.display());
    Ok(path)
}

fn run_train(mut config: AppConfig, args: &TrainArgs) -> Result<()> {
    args.apply(&mut config);
    config.display();

    let mut options = TrainingOptions::from_config(&config);
    options.resume = args.resume.clone();

    match config.device_type {
        DeviceType::Wgpu => train_on::<Autodiff<Wgpu>>(&options, WgpuDevice::default()),
        DeviceType::Cpu => train_on::<Autodiff<NdArray>>(&options, NdArrayDevice::Cpu),
    }
}

fn train_on<B: AutodiffBackend>(options: &TrainingOptions, device: B::Device) -> Result<()> {
    let summary = train::<B>(options, device)?;

    println!("\n=== 学習完了 ===");
    println!("出力先: {}", summary.run_dir.display());
    println!("最良の検証精度: {:.4}", summary.best_val_acc);
    match &summary.best_checkpoint {
        Some(path) => println!("最良モデル: {}", path.display()),
        None => println!("最良モデル: なし（検証精度が 0 を超えませんでした）"),
    }
    if let Some(path) = &summary.latest_checkpoint {
        println!("最新モデル: {}", path.display());
    }
    Ok(())
}

fn run_predict(config: &AppConfig, args: &PredictArgs) -> Result<()> {
    let path = model_path(config, &args.model)?;
    match config.device_type {
        DeviceType::Wgpu => predict_on::<Wgpu>(&path, &args.image, WgpuDevice::default()),
        DeviceType::Cpu => predict_on::<NdArray>(&path, &args.image, NdArrayDevice::Cpu),
    }
}

fn predict_on<B: Backend>(model: &Path, image: &Path, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model, device)?;
    let prediction = engine.classify_image(image)?;

    println!("画像: {}", image.display());
    println!("予測: {} ({:.2}%)", prediction.label, prediction.confidence * 100.0);
    for (name, p) in engine.labels().names().iter().zip(&prediction.probabilities) {
        println!("  {:<12} {:.4}", name, p);
    }
    println!("推論時間: {:.2} ms", prediction.elapsed_ms);
    Ok(())
}

fn run_evaluate(config: &AppConfig, args: &EvaluateArgs) -> Result<()> {
    let path = model_path(config, &args.model)?;
    match config.device_type {
        DeviceType::Wgpu => evaluate_on::<Wgpu>(config, args, &path, WgpuDevice::default()),
        DeviceType::Cpu => evaluate_on::<NdArray>(config, args, &path, NdArrayDevice::Cpu),
    }
}

fn evaluate_on<B: Backend>(
    config: &AppConfig,
    args: &EvaluateArgs,
    model: &Path,
    device: B::Device,
) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model, device)?;
    let data_dir = args.data_dir.clone().unwrap_or_else(|| config.data.data_dir.clone());
    let validation = validation_samples(&data_dir, engine.metadata())?;

    let count = if args.all { None } else { Some(args.num_samples) };
    let samples = choose_samples(&validation, count, args.sample_seed);
    let report = evaluate(&engine, &samples)?;
    report.print();
    Ok(())
}

fn run_export(config: &AppConfig, args: &ExportArgs) -> Result<()> {
    let path = model_path(config, &args.model)?;
    match config.device_type {
        DeviceType::Wgpu => export_on::<Wgpu>(&path, args, WgpuDevice::default()),
        DeviceType::Cpu => export_on::<NdArray>(&path, args, NdArrayDevice::Cpu),
    }
}

fn export_on<B: Backend>(source: &Path, args: &ExportArgs, device: B::Device) -> Result<()> {
    let report = export_model::<B>(source, &args.output_dir, &device)?;
    report.print();

    if args.runs > 0 {
        let engine = InferenceEngine::<B>::load(report.deployable(), device)?;
        let result = benchmark(&engine, args.runs);
        println!(
            "推論速度: {:.2} ms/枚 ({:.1} FPS, {} 回)",
            result.mean_ms,
            result.fps(),
            result.runs
        );
    }
    Ok(())
}

fn run_benchmark(config: &AppConfig, args: &BenchmarkArgs) -> Result<()> {
    match config.device_type {
        DeviceType::Wgpu => benchmark_on::<Wgpu>(args, WgpuDevice::default()),
        DeviceType::Cpu => benchmark_on::<NdArray>(args, NdArrayDevice::Cpu),
    }
}

fn benchmark_on<B: Backend>(args: &BenchmarkArgs, device: B::Device) -> Result<()> {
    let mut baseline: Option<(u64, f64)> = None;

    println!("\n=== ベンチマーク ({} 回) ===", args.runs);
    for path in &args.model {
        let engine = InferenceEngine::<B>::load(path, device.clone())?;
        let result = benchmark(&engine, args.runs);
        let bytes = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();

        println!(
            "{}: {:.2} MB, 平均 {:.2} ms (最小 {:.2} / 最大 {:.2}), {:.1} FPS",
            path.display(),
            bytes as f64 / 1024.0 / 1024.0,
            result.mean_ms,
            result.min_ms,
            result.max_ms,
            result.fps()
        );

        match baseline {
            None => baseline = Some((bytes, result.mean_ms)),
            Some((base_bytes, base_ms)) => {
                let speedup = if result.mean_ms > 0.0 { base_ms / result.mean_ms } else { 0.0 };
                println!(
                    "  基準比: サイズ削減 {:.1}%, 速度 {:.2}x",
                    size_reduction(base_bytes, bytes),
                    speedup
                );
            }
        }
    }
    Ok(())
}

fn run_inspect(config: &AppConfig, args: &InspectArgs) -> Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(|| config.data.data_dir.clone());
    let options = SplitOptions::new(config.data.class_names.clone())
        .with_val_split(config.data.val_split)
        .with_seed(config.data.seed);

    let partition = partition_directory(&data_dir, &options)?;
    let splits: Vec<Split> = match args.split {
        Some(split) => vec![split],
        None => vec![Split::Train, Split::Validation],
    };

    println!("\n=== データセット: {} ===", data_dir.display());
    println!("val_split: {}, seed: {}", options.val_split, options.seed);
    for split in splits {
        let samples = match split {
            Split::Train => partition.train.clone(),
            Split::Validation => partition.validation.clone(),
        };
        let dataset = WeedDataset::from_samples(samples, options.class_names.clone(), split);
        println!("\n[{}] {} 枚", split, dataset.num_samples());
        let distribution = dataset.class_distribution();
        for (index, name) in dataset.class_names().iter().enumerate() {
            println!("  {:<12} {}", name, distribution.get(&index).copied().unwrap_or(0));
        }
    }
    Ok(())
}

fn run_survey(config: &AppConfig, args: &SurveyArgs) -> Result<()> {
    let path = model_path(config, &args.model)?;
    match config.device_type {
        DeviceType::Wgpu => survey_on::<Wgpu>(&path, args, WgpuDevice::default()),
        DeviceType::Cpu => survey_on::<NdArray>(&path, args, NdArrayDevice::Cpu),
    }
}

fn survey_on<B: Backend>(model: &Path, args: &SurveyArgs, device: B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model, device)?;
    let frames = list_frames(&args.frames_dir)?;
    if frames.is_empty() {
        anyhow::bail!("No frames found in {}", args.frames_dir.display());
    }

    let gps = match &args.gps_device {
        Some(device_path) => Some(GpsLink::open(device_path, args.gps_baud)?),
        None => {
            tracing::info!("GPSデバイスが指定されていません。位置なしで記録します");
            None
        }
    };

    match &args.labels {
        Some(labels_path) => {
            let labels = LabelFile::load(labels_path, engine.metadata().model.num_classes)?;
            survey_with(engine, labels, gps, &frames, &args.output)
        }
        None => {
            let labels = engine.labels().clone();
            survey_with::<B, ClassNames>(engine, labels, gps, &frames, &args.output)
        }
    }
}

fn survey_with<B: Backend, L: LabelProvider>(
    engine: InferenceEngine<B>,
    labels: L,
    gps: Option<GpsLink<SerialTransport>>,
    frames: &[PathBuf],
    output: &Path,
) -> Result<()> {
    let mut survey = SurveyContext::new(engine, labels, gps, output)?;
    survey.run(frames)?;
    let written = survey.finish()?;
    println!("{} / {} フレームを記録しました: {}", written, frames.len(), output.display());
    Ok(())
}
