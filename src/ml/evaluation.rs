//! 検証データでの評価（ランダムN枚または全件）

use anyhow::Result;
use burn::tensor::backend::Backend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::data::weed_dataset::{partition_directory, SplitOptions};
use crate::ml::inference::InferenceEngine;
use crate::model::checkpoint::CheckpointMetadata;
use crate::types::{Prediction, Sample};

/// 混同行列（行 = 正解、列 = 予測）
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn add(&mut self, actual: usize, predicted: usize) {
        if let Some(count) = self.counts.get_mut(actual).and_then(|row| row.get_mut(predicted)) {
            *count += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.counts.len()).map(|i| self.counts[i][i]).sum()
    }

    /// 表形式の文字列
    pub fn render(&self, class_names: &[String]) -> String {
        let name = |i: usize| {
            class_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", i))
        };
        let width = (0..self.num_classes())
            .map(|i| name(i).len())
            .max()
            .unwrap_or(0)
            .max(6);

        let mut out = format!("{:>width$}", "", width = width);
        for i in 0..self.num_classes() {
            out.push_str(&format!(" {:>width$}", name(i), width = width));
        }
        out.push('\n');
        for (i, row) in self.counts.iter().enumerate() {
            out.push_str(&format!("{:>width$}", name(i), width = width));
            for count in row {
                out.push_str(&format!(" {:>width$}", count, width = width));
            }
            out.push('\n');
        }
        out
    }
}

/// 1枚分の評価結果
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub path: PathBuf,
    pub true_label: usize,
    pub prediction: Prediction,
}

impl SampleResult {
    pub fn is_correct(&self) -> bool {
        self.prediction.class_index == self.true_label
    }
}

/// 評価結果
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub results: Vec<SampleResult>,
    pub confusion: ConfusionMatrix,
    pub class_names: Vec<String>,
    /// 読み込みに失敗してスキップした枚数
    pub skipped: usize,
}

impl EvaluationReport {
    pub fn accuracy(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.confusion.correct() as f64 / self.results.len() as f64
        }
    }

    pub fn mean_inference_ms(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.results.iter().map(|r| r.prediction.elapsed_ms).sum::<f64>() / self.results.len() as f64
        }
    }

    /// 推定FPS（平均推論時間から算出）
    pub fn estimated_fps(&self) -> f64 {
        let ms = self.mean_inference_ms();
        if ms > 0.0 {
            1000.0 / ms
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        println!("\n=== 評価結果 ===");
        for result in &self.results {
            let true_name = self
                .class_names
                .get(result.true_label)
                .map(String::as_str)
                .unwrap_or("?");
            println!(
                "{} {} | 正解: {} | 予測: {} ({:.2}%) | {:.2} ms",
                if result.is_correct() { "✓" } else { "✗" },
                result.path.display(),
                true_name,
                result.prediction.label,
                result.prediction.confidence * 100.0,
                result.prediction.elapsed_ms
            );
        }
        println!("\n精度: {:.2}% ({}/{})", self.accuracy() * 100.0, self.confusion.correct(), self.results.len());
        println!("平均推論時間: {:.2} ms", self.mean_inference_ms());
        println!("推定FPS: {:.1}", self.estimated_fps());
        if self.skipped > 0 {
            println!("スキップ: {} 枚", self.skipped);
        }
        println!("\n混同行列 (行: 正解, 列: 予測)");
        print!("{}", self.confusion.render(&self.class_names));
        println!("================");
    }
}

/// `count` 枚をシード付きで無作為に選ぶ。None なら全件
pub fn choose_samples(samples: &[Sample], count: Option<usize>, seed: u64) -> Vec<Sample> {
    match count {
        Some(n) if n < samples.len() => {
            let mut rng = StdRng::seed_from_u64(seed);
            samples.choose_multiple(&mut rng, n).cloned().collect()
        }
        _ => samples.to_vec(),
    }
}

/// チェックポイントの学習時と同じ分割で検証データを再現する
pub fn validation_samples(data_dir: &Path, metadata: &CheckpointMetadata) -> Result<Vec<Sample>> {
    let options = SplitOptions::new(metadata.class_names.clone())
        .with_val_split(metadata.val_split)
        .with_seed(metadata.seed);
    let validation = partition_directory(data_dir, &options)?.validation;
    if validation.is_empty() {
        anyhow::bail!("No validation images found under {}", data_dir.display());
    }
    Ok(validation)
}

/// サンプル列を分類して集計
pub fn evaluate<B: Backend>(engine: &InferenceEngine<B>, samples: &[Sample]) -> Result<EvaluationReport> {
    let class_names = engine.metadata().class_names.clone();
    let mut confusion = ConfusionMatrix::new(class_names.len());
    let mut results = Vec::with_capacity(samples.len());
    let mut skipped = 0;

    for sample in samples {
        match engine.classify_image(&sample.path) {
            Ok(prediction) => {
                confusion.add(sample.label, prediction.class_index);
                results.push(SampleResult {
                    path: sample.path.clone(),
                    true_label: sample.label,
                    prediction,
                });
            }
            Err(e) => {
                tracing::warn!("評価をスキップします {}: {:#}", sample.path.display(), e);
                skipped += 1;
            }
        }
    }

    tracing::info!("{} 枚を評価しました (スキップ {} 枚)", results.len(), skipped);

    Ok(EvaluationReport {
        results,
        confusion,
        class_names,
        skipped,
    })
}
