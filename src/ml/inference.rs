//! モデル推論機能

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, Distribution, Tensor};
use image::RgbImage;
use std::path::Path;
use std::time::Instant;

use crate::data::Transform;
use crate::ml::ml_model::TinyResVit;
use crate::ml::persistence::decode_model;
use crate::model::checkpoint::{load_weights, CheckpointMetadata};
use crate::model::labels::{ClassNames, LabelProvider};
use crate::types::Prediction;

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: TinyResVit<B>,
    metadata: CheckpointMetadata,
    labels: ClassNames,
    transform: Transform,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイント（tar.gz）またはエクスポート済みの重みを読み込む
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (metadata, bytes) = load_weights(model_path)
            .with_context(|| format!("Failed to load model: {}", model_path.display()))?;
        let model = decode_model::<B>(&metadata.model, bytes, metadata.precision, &device)?;

        tracing::info!(
            "モデルを読み込みました: {} (epoch {}, val_acc {:.4}, {})",
            model_path.display(),
            metadata.epoch,
            metadata.val_acc,
            metadata.precision
        );

        Ok(Self::from_model(model, metadata, device))
    }

    pub fn from_model(model: TinyResVit<B>, metadata: CheckpointMetadata, device: B::Device) -> Self {
        Self {
            labels: ClassNames::new(metadata.class_names.clone()),
            transform: Transform::eval(metadata.model.image_size as u32),
            model,
            metadata,
            device,
        }
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    pub fn labels(&self) -> &ClassNames {
        &self.labels
    }

    pub fn model(&self) -> &TinyResVit<B> {
        &self.model
    }

    pub fn image_size(&self) -> usize {
        self.metadata.model.image_size
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let mut rng = rand::thread_rng();
        let values = self.transform.load(image_path.as_ref(), &mut rng)?;
        Ok(self.classify_values(&values))
    }

    /// 読み込み済みの画像を分類
    pub fn classify_rgb(&self, image: RgbImage) -> Prediction {
        let mut rng = rand::thread_rng();
        let values = self.transform.apply(image, &mut rng);
        self.classify_values(&values)
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths
            .iter()
            .map(|path| self.classify_image(path))
            .collect()
    }

    fn classify_values(&self, values: &[f32]) -> Prediction {
        let size = self.image_size();
        let tensor = Tensor::<B, 1>::from_floats(values, &self.device).reshape([1, 3, size, size]);

        let started = Instant::now();
        let probabilities: Vec<f32> = self
            .model
            .probabilities(tensor)
            .into_data()
            .iter::<f32>()
            .collect();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        Prediction {
            class_index,
            label: self.labels.label_or_index(class_index),
            confidence,
            probabilities,
            elapsed_ms,
        }
    }

    /// ランダム入力で1回順伝播し、所要時間（ミリ秒）を返す
    pub fn time_random_forward(&self) -> f64 {
        let size = self.image_size();
        let input = Tensor::<B, 4>::random([1, 3, size, size], Distribution::Default, &self.device);
        let started = Instant::now();
        // 結果を取り出すまでを計測対象にする
        let _ = self.model.forward(input).into_data();
        started.elapsed().as_secs_f64() * 1000.0
    }
}
