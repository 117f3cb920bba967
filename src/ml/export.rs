//! 配布用の重みの書き出しと推論速度の計測

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};

use crate::ml::inference::InferenceEngine;
use crate::ml::persistence::{decode_model, encode_model, Precision};
use crate::model::checkpoint::{load_weights, save_weights};

pub const FULL_WEIGHTS_FILE: &str = "model_full.bin";
pub const HALF_WEIGHTS_FILE: &str = "model_half.bin";

/// ベンチマーク前のウォームアップ回数
pub const WARMUP_RUNS: usize = 10;

/// エクスポート結果
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub source: PathBuf,
    pub source_bytes: u64,
    pub full_path: PathBuf,
    pub full_bytes: u64,
    /// 半精度の書き出しに失敗した場合は None
    pub half: Option<(PathBuf, u64)>,
}

impl ExportReport {
    /// 配布に使うファイル（半精度があればそちら）
    pub fn deployable(&self) -> &Path {
        self.half
            .as_ref()
            .map(|(path, _)| path.as_path())
            .unwrap_or(self.full_path.as_path())
    }

    pub fn print(&self) {
        println!("\n=== モデルサイズ比較 ===");
        println!("元のチェックポイント: {:.2} MB ({})", mb(self.source_bytes), self.source.display());
        println!(
            "f32 重み: {:.2} MB (削減率: {:.1}%)",
            mb(self.full_bytes),
            size_reduction(self.source_bytes, self.full_bytes)
        );
        match &self.half {
            Some((path, bytes)) => println!(
                "f16 重み: {:.2} MB (f32 からの削減率: {:.1}%) {}",
                mb(*bytes),
                size_reduction(self.full_bytes, *bytes),
                path.display()
            ),
            None => println!("f16 重み: 書き出し失敗（f32 を使用）"),
        }
        println!("配布用: {}", self.deployable().display());
        println!("========================");
    }
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// 削減率（%）
pub fn size_reduction(original: u64, new: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        (1.0 - new as f64 / original as f64) * 100.0
    }
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len())
}

/// チェックポイントから f32 / f16 の重みを書き出す
///
/// f16 の書き出しに失敗しても f32 があれば成功とする。
pub fn export_model<B: Backend>(source: &Path, output_dir: &Path, device: &B::Device) -> Result<ExportReport> {
    let (metadata, bytes) = load_weights(source)?;
    let model = decode_model::<B>(&metadata.model, bytes, metadata.precision, device)?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let full_path = output_dir.join(FULL_WEIGHTS_FILE);
    let mut full_meta = metadata.clone();
    full_meta.precision = Precision::Full;
    save_weights(&full_path, &full_meta, &encode_model(&model, Precision::Full)?)?;
    tracing::info!("f32 重みを書き出しました: {}", full_path.display());

    let half_path = output_dir.join(HALF_WEIGHTS_FILE);
    let mut half_meta = metadata;
    half_meta.precision = Precision::Half;
    let half = match encode_model(&model, Precision::Half)
        .and_then(|bytes| save_weights(&half_path, &half_meta, &bytes))
        .and_then(|_| file_size(&half_path))
    {
        Ok(size) => {
            tracing::info!("f16 重みを書き出しました: {}", half_path.display());
            Some((half_path, size))
        }
        Err(e) => {
            tracing::warn!("f16 への変換に失敗しました。f32 の重みを使用します: {:#}", e);
            None
        }
    };

    Ok(ExportReport {
        source: source.to_path_buf(),
        source_bytes: file_size(source)?,
        full_bytes: file_size(&full_path)?,
        full_path,
        half,
    })
}

/// ベンチマーク結果
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkResult {
    pub runs: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl BenchmarkResult {
    pub fn from_timings(timings: &[f64]) -> Self {
        if timings.is_empty() {
            return Self {
                runs: 0,
                mean_ms: 0.0,
                min_ms: 0.0,
                max_ms: 0.0,
            };
        }
        Self {
            runs: timings.len(),
            mean_ms: timings.iter().sum::<f64>() / timings.len() as f64,
            min_ms: timings.iter().cloned().fold(f64::INFINITY, f64::min),
            max_ms: timings.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }

    pub fn fps(&self) -> f64 {
        if self.mean_ms > 0.0 {
            1000.0 / self.mean_ms
        } else {
            0.0
        }
    }
}

/// ウォームアップ後に `runs` 回の推論時間を計測
pub fn benchmark<B: Backend>(engine: &InferenceEngine<B>, runs: usize) -> BenchmarkResult {
    for _ in 0..WARMUP_RUNS {
        engine.time_random_forward();
    }
    let timings: Vec<f64> = (0..runs).map(|_| engine.time_random_forward()).collect();
    BenchmarkResult::from_timings(&timings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::WeedClassifierConfig;
    use crate::ml::scheduler::ReduceOnPlateau;
    use crate::model::checkpoint::{save_checkpoint, CheckpointMetadata};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_size_reduction() {
        assert_eq!(size_reduction(100, 50), 50.0);
        assert_eq!(size_reduction(0, 50), 0.0);
    }

    #[test]
    fn test_benchmark_result_from_timings() {
        let result = BenchmarkResult::from_timings(&[2.0, 4.0, 6.0]);
        assert_eq!(result.runs, 3);
        assert_eq!(result.mean_ms, 4.0);
        assert_eq!(result.min_ms, 2.0);
        assert_eq!(result.max_ms, 6.0);
        assert_eq!(result.fps(), 250.0);
        assert_eq!(BenchmarkResult::from_timings(&[]).fps(), 0.0);
    }

    #[test]
    fn test_export_writes_full_and_half() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::Cpu;
        let config = WeedClassifierConfig::new(3)
            .with_image_size(56)
            .with_stem_channels(8)
            .with_feature_channels(16)
            .with_embed_dim(32);
        let model = config.init::<TestBackend>(&device);
        let metadata = CheckpointMetadata::new(
            2,
            0.7,
            0.6,
            0.7,
            ReduceOnPlateau::new(1e-3),
            config,
            vec!["Broadleafs".into(), "Grasses".into(), "Soil".into()],
        );
        let source = save_checkpoint(
            &dir.path().join("best_model"),
            &metadata,
            &encode_model(&model, Precision::Full).unwrap(),
            None,
        )
        .unwrap();

        let out = dir.path().join("deploy");
        let report = export_model::<TestBackend>(&source, &out, &device).unwrap();

        assert!(report.full_path.exists());
        let (half_path, half_bytes) = report.half.clone().unwrap();
        assert!(half_bytes < report.full_bytes);
        assert_eq!(report.deployable(), half_path.as_path());

        let engine = InferenceEngine::<TestBackend>::load(&half_path, device).unwrap();
        assert_eq!(engine.metadata().precision, Precision::Half);
        assert_eq!(benchmark(&engine, 2).runs, 2);
    }
}
