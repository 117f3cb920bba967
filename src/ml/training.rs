//! モデル学習
//!
//! エポックごとに 学習 -> 検証 -> スケジューラ更新 -> チェックポイント保存 -> 指標記録
//! を繰り返します。出力は `<output_dir>/run_<YYYYmmdd_HHMMSS>/` に置かれます。

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::data::{partition_directory, SplitOptions, Transform, WeedBatcher, WeedDataset};
use crate::metrics_log::{MetricsLogger, MetricsRow};
use crate::ml::ml_model::{TinyResVit, WeedClassifierConfig};
use crate::ml::persistence::{decode_optimizer, encode_model, encode_optimizer, load_model_bytes, Precision};
use crate::ml::scheduler::ReduceOnPlateau;
use crate::model::checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointMetadata};
use crate::model::config::AppConfig;
use crate::types::Split;

pub const BEST_CHECKPOINT: &str = "best_model";
pub const LATEST_CHECKPOINT: &str = "latest_model";
pub const METRICS_FILE: &str = "metrics.csv";
pub const CONFIG_FILE: &str = "config.json";

/// 学習設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOptions {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub class_names: Vec<String>,
    pub val_split: f64,
    pub seed: u64,
    pub model: WeedClassifierConfig,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    /// 再開する latest チェックポイント
    #[serde(default)]
    pub resume: Option<PathBuf>,
}

impl TrainingOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            data_dir: config.data.data_dir.clone(),
            output_dir: config.training.output_dir.clone(),
            class_names: config.data.class_names.clone(),
            val_split: config.data.val_split,
            seed: config.data.seed,
            model: config.classifier_config(),
            num_epochs: config.training.num_epochs,
            batch_size: config.training.batch_size,
            num_workers: config.training.num_workers,
            learning_rate: config.training.learning_rate,
            weight_decay: config.training.weight_decay,
            resume: None,
        }
    }

    fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.class_names.len() != self.model.num_classes {
            anyhow::bail!(
                "{} class names but the model has {} outputs",
                self.class_names.len(),
                self.model.num_classes
            );
        }
        if !(0.0..=1.0).contains(&self.val_split) {
            anyhow::bail!("val_split must be within [0, 1]: {}", self.val_split);
        }
        Ok(())
    }
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub run_dir: PathBuf,
    pub best_val_acc: f64,
    pub best_checkpoint: Option<PathBuf>,
    pub latest_checkpoint: Option<PathBuf>,
    /// 今回実行したエポックの指標
    pub history: Vec<MetricsRow>,
}

/// バッチサイズで重み付けした損失と正解数の累積
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningStats {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl RunningStats {
    pub fn update(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    /// サンプルがなければ NaN
    pub fn mean_loss(&self) -> f64 {
        if self.total == 0 {
            f64::NAN
        } else {
            self.loss_sum / self.total as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// 予測が正解と一致した数
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    // argmax(1) は [batch, 1] なので [batch] に潰してから比較
    let predictions = logits.argmax(1).flatten::<1>(0, 1);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

pub fn run_dir_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("run_{}", now.format("%Y%m%d_%H%M%S"))
}

/// 出力先で最も新しい run のチェックポイント（best、なければ latest）
pub fn find_latest_checkpoint(output_dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(output_dir)
        .with_context(|| format!("Failed to read output directory: {}", output_dir.display()))?;
    let mut runs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("run_"))
                    .unwrap_or(false)
        })
        .collect();
    // run_YYYYmmdd_HHMMSS は名前順 = 時刻順
    runs.sort();

    runs.iter()
        .rev()
        .flat_map(|run| {
            [BEST_CHECKPOINT, LATEST_CHECKPOINT].map(|name| run.join(format!("{}.tar.gz", name)))
        })
        .find(|path| path.is_file())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No checkpoint found under {}; pass --model explicitly",
                output_dir.display()
            )
        })
}

/// モデル学習を実行
pub fn train<B: AutodiffBackend>(options: &TrainingOptions, device: B::Device) -> Result<TrainingSummary> {
    options.validate()?;

    // 再開時は latest チェックポイントのあるディレクトリをそのまま使う
    let (run_dir, resume) = match &options.resume {
        Some(path) => {
            let checkpoint = load_checkpoint(path)
                .with_context(|| format!("Failed to load checkpoint for resume: {}", path.display()))?;
            let run_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (run_dir, Some(checkpoint))
        }
        None => (options.output_dir.join(run_dir_name(chrono::Local::now())), None),
    };
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;
    tracing::info!("出力先: {}", run_dir.display());

    let model_config = match &resume {
        Some(checkpoint) => {
            if checkpoint.metadata.class_names != options.class_names {
                anyhow::bail!(
                    "checkpoint classes [{}] differ from configured classes [{}]",
                    checkpoint.metadata.class_names.join(", "),
                    options.class_names.join(", ")
                );
            }
            // 分割が変わると検証データが学習に混ざる
            if checkpoint.metadata.seed != options.seed
                || checkpoint.metadata.val_split != options.val_split
            {
                anyhow::bail!(
                    "checkpoint was trained with seed {} / val_split {} but the run uses seed {} / val_split {}",
                    checkpoint.metadata.seed,
                    checkpoint.metadata.val_split,
                    options.seed,
                    options.val_split
                );
            }
            checkpoint.metadata.model.clone()
        }
        None => {
            let json = serde_json::to_string_pretty(options)?;
            std::fs::write(run_dir.join(CONFIG_FILE), json)
                .context("Failed to write run config")?;
            options.model.clone()
        }
    };

    // === データセット ===
    let split_options = SplitOptions::new(options.class_names.clone())
        .with_val_split(options.val_split)
        .with_seed(options.seed);
    let partition = partition_directory(&options.data_dir, &split_options)?;
    let dataset_train =
        WeedDataset::from_samples(partition.train, options.class_names.clone(), Split::Train);
    let dataset_val = WeedDataset::from_samples(
        partition.validation,
        options.class_names.clone(),
        Split::Validation,
    );

    if dataset_train.num_samples() == 0 {
        anyhow::bail!("No training images found under {}", options.data_dir.display());
    }
    tracing::info!("学習データ: {} 枚", dataset_train.num_samples());
    tracing::info!("検証データ: {} 枚", dataset_val.num_samples());
    dataset_train.log_distribution();
    dataset_val.log_distribution();
    if dataset_val.num_samples() == 0 {
        tracing::warn!("検証データが0枚です。検証損失は NaN、精度は 0 になります");
    }

    let image_size = model_config.image_size as u32;
    let batcher_train = WeedBatcher::<B>::new(device.clone(), Transform::train(image_size));
    let batcher_val = WeedBatcher::<B::InnerBackend>::new(device.clone(), Transform::eval(image_size));

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(options.batch_size)
        .shuffle(options.seed)
        .num_workers(options.num_workers)
        .build(dataset_train);
    let dataloader_val = DataLoaderBuilder::new(batcher_val)
        .batch_size(options.batch_size)
        .num_workers(options.num_workers)
        .build(dataset_val);

    // === モデル・オプティマイザ・スケジューラ ===
    let mut model: TinyResVit<B> = model_config.init(&device);
    let mut optim = AdamWConfig::new()
        .with_weight_decay(options.weight_decay)
        .init::<B, TinyResVit<B>>();
    let mut scheduler = ReduceOnPlateau::new(options.learning_rate);
    let mut best_val_acc = 0.0f64;
    let mut start_epoch = 1;

    if let Some(Checkpoint {
        metadata,
        model: model_bytes,
        optimizer,
    }) = resume
    {
        model = load_model_bytes(model, model_bytes, Precision::Full, &device)?;
        match optimizer {
            Some(bytes) => {
                optim = decode_optimizer::<B, TinyResVit<B>, _>(optim, bytes, &device)?;
            }
            None => tracing::warn!("オプティマイザ状態がないため初期状態から再開します"),
        }
        scheduler = metadata.scheduler;
        best_val_acc = metadata.best_val_acc;
        start_epoch = metadata.epoch + 1;
        tracing::info!(
            "エポック {} から再開します (best_val_acc={:.4}, lr={:.2e})",
            start_epoch,
            best_val_acc,
            scheduler.lr()
        );
    }

    let metrics = MetricsLogger::create(&run_dir.join(METRICS_FILE))?;
    let mut history = Vec::new();
    let mut latest_checkpoint = None;

    tracing::info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {:.2e}",
        options.num_epochs,
        options.batch_size,
        scheduler.lr()
    );

    for epoch in start_epoch..=options.num_epochs {
        let started = Instant::now();
        let lr = scheduler.lr();

        // --- 学習 ---
        let mut train_stats = RunningStats::default();
        for batch in dataloader_train.iter() {
            let batch_size = batch.targets.dims()[0];
            let output = model.forward_classification(batch.images, batch.targets);

            let loss_value = output.loss.clone().into_scalar().elem::<f64>();
            let correct = count_correct(output.output.clone(), output.targets.clone());
            train_stats.update(loss_value, correct, batch_size);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);
        }

        // --- 検証（勾配なし） ---
        let model_valid = model.valid();
        let mut val_stats = RunningStats::default();
        for batch in dataloader_val.iter() {
            let batch_size = batch.targets.dims()[0];
            let output = model_valid.forward_classification(batch.images, batch.targets);
            let loss_value = output.loss.into_scalar().elem::<f64>();
            let correct = count_correct(output.output, output.targets);
            val_stats.update(loss_value, correct, batch_size);
        }

        let val_acc = val_stats.accuracy();
        let val_loss = val_stats.mean_loss();
        scheduler.step(val_acc);

        // --- チェックポイント ---
        let improved = val_acc > best_val_acc;
        if improved {
            best_val_acc = val_acc;
        }

        let model_bytes = encode_model(&model_valid, Precision::Full)?;
        let optim_bytes = encode_optimizer::<B, TinyResVit<B>, _>(&optim)?;
        let metadata = CheckpointMetadata::new(
            epoch,
            val_acc,
            val_loss,
            best_val_acc,
            scheduler.clone(),
            model_config.clone(),
            options.class_names.clone(),
        )
        .with_split(options.seed, options.val_split);

        if improved {
            save_checkpoint(
                &run_dir.join(BEST_CHECKPOINT),
                &metadata,
                &model_bytes,
                Some(&optim_bytes),
            )?;
            tracing::info!("ベストモデルを更新しました: val_acc={:.4}", val_acc);
        }
        latest_checkpoint = Some(save_checkpoint(
            &run_dir.join(LATEST_CHECKPOINT),
            &metadata,
            &model_bytes,
            Some(&optim_bytes),
        )?);

        let row = MetricsRow {
            epoch,
            train_loss: train_stats.mean_loss(),
            train_acc: train_stats.accuracy(),
            val_loss,
            val_acc,
            lr,
            seconds: started.elapsed().as_secs_f64(),
        };
        metrics.append(&row)?;

        tracing::info!(
            "Epoch {:>3}/{} | train_loss={:.4} train_acc={:.4} | val_loss={:.4} val_acc={:.4} | lr={:.2e} | {:.1}s",
            epoch,
            options.num_epochs,
            row.train_loss,
            row.train_acc,
            row.val_loss,
            row.val_acc,
            row.lr,
            row.seconds
        );
        history.push(row);
    }

    if history.is_empty() {
        tracing::info!("すでに {} エポック学習済みです", options.num_epochs);
    }
    tracing::info!("学習完了: 最良検証精度 {:.4}", best_val_acc);

    let best_path = run_dir.join(format!("{}.tar.gz", BEST_CHECKPOINT));
    let latest_path = run_dir.join(format!("{}.tar.gz", LATEST_CHECKPOINT));
    Ok(TrainingSummary {
        best_checkpoint: best_path.exists().then_some(best_path),
        latest_checkpoint: latest_checkpoint.or_else(|| latest_path.exists().then_some(latest_path)),
        run_dir,
        best_val_acc,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_running_stats_weights_by_batch_size() {
        let mut stats = RunningStats::default();
        stats.update(1.0, 3, 4);
        stats.update(4.0, 0, 1);
        assert!((stats.mean_loss() - 8.0 / 5.0).abs() < 1e-12);
        assert!((stats.accuracy() - 0.6).abs() < 1e-12);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn test_empty_stats() {
        let stats = RunningStats::default();
        assert!(stats.mean_loss().is_nan());
        assert_eq!(stats.accuracy(), 0.0);
    }

    #[test]
    fn test_count_correct() {
        let device = NdArrayDevice::Cpu;
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.1, 0.9, 0.0], [2.0, 0.0, 1.0], [0.0, 0.0, 3.0]],
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([1, 2, 2], &device);
        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn test_run_dir_name_format() {
        use chrono::TimeZone;
        let now = chrono::Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(run_dir_name(now), "run_20240305_070809");
    }

    #[test]
    fn test_find_latest_checkpoint_prefers_newest_run() {
        let dir = tempfile::tempdir().unwrap();
        let old_run = dir.path().join("run_20240101_000000");
        let new_run = dir.path().join("run_20240301_120000");
        std::fs::create_dir_all(&old_run).unwrap();
        std::fs::create_dir_all(&new_run).unwrap();
        std::fs::write(old_run.join("best_model.tar.gz"), b"x").unwrap();
        std::fs::write(new_run.join("latest_model.tar.gz"), b"x").unwrap();

        // 新しい run に best がなければ latest を使う
        assert_eq!(
            find_latest_checkpoint(dir.path()).unwrap(),
            new_run.join("latest_model.tar.gz")
        );

        std::fs::write(new_run.join("best_model.tar.gz"), b"x").unwrap();
        assert_eq!(
            find_latest_checkpoint(dir.path()).unwrap(),
            new_run.join("best_model.tar.gz")
        );
    }

    #[test]
    fn test_find_latest_checkpoint_without_runs_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        assert!(find_latest_checkpoint(dir.path()).is_err());
        assert!(find_latest_checkpoint(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_options_reject_class_mismatch() {
        let mut options = TrainingOptions::from_config(&AppConfig::default());
        assert!(options.validate().is_ok());
        options.class_names.pop();
        assert!(options.validate().is_err());
    }
}
