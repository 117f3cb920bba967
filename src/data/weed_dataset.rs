//! クラス別フォルダからのデータセット構築と層化分割
//!
//! ルートディレクトリ配下に `Broadleafs/`, `Grasses/`, `Soil/` のような
//! クラスごとのサブディレクトリがある前提で、固定シードによる
//! 学習用/検証用の層化分割を行います。

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(feature = "ml")]
use burn_dataset::Dataset;

use crate::types::{Sample, Split};

/// 読み込み対象の拡張子
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// 検証用に確保する割合のデフォルト値
pub const DEFAULT_VAL_SPLIT: f64 = 0.2;

/// 分割用シードのデフォルト値
pub const DEFAULT_SEED: u64 = 42;

/// 分割設定
#[derive(Debug, Clone)]
pub struct SplitOptions {
    /// クラス名（= サブディレクトリ名）。並び順がそのままラベルになる
    pub class_names: Vec<String>,
    /// 検証用の割合
    pub val_split: f64,
    /// 乱数シード
    pub seed: u64,
}

impl SplitOptions {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            class_names,
            val_split: DEFAULT_VAL_SPLIT,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_val_split(mut self, val_split: f64) -> Self {
        self.val_split = val_split;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// 学習用と検証用の両方の分割結果
#[derive(Debug, Clone)]
pub struct Partition {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
}

impl Partition {
    pub fn into_split(self, split: Split) -> Vec<Sample> {
        match split {
            Split::Train => self.train,
            Split::Validation => self.validation,
        }
    }
}

/// クラスごとのファイル一覧を層化分割する
///
/// `class_files[i]` がラベル `i` のファイル一覧。各クラスを同じ乱数列で
/// シャッフルし、先頭 floor(N * val_split) 枚を検証用、残りを学習用にする。
/// 最後に結合したリストを同じ乱数列の続きでシャッフルする。
pub fn stratified_split(class_files: Vec<Vec<PathBuf>>, val_split: f64, seed: u64) -> Partition {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut validation = Vec::new();

    for (label, mut files) in class_files.into_iter().enumerate() {
        files.shuffle(&mut rng);
        let val_size = validation_count(files.len(), val_split);

        let mut files = files.into_iter().map(|path| Sample::new(path, label));
        validation.extend(files.by_ref().take(val_size));
        train.extend(files);
    }

    // 学習用/検証用それぞれが「同じ乱数列の続き」でシャッフルされるように分岐させる
    let mut val_rng = rng.clone();
    train.shuffle(&mut rng);
    validation.shuffle(&mut val_rng);

    Partition { train, validation }
}

/// 検証用に回す枚数（切り捨て）
pub fn validation_count(len: usize, val_split: f64) -> usize {
    let count = (len as f64 * val_split).floor();
    (count.max(0.0) as usize).min(len)
}

/// クラスディレクトリ内の画像ファイルを列挙する
///
/// ディレクトリが存在しない場合は空のリストを返す。
/// 読み込み順をファイルシステムに依存させないためパス順にソートする。
pub fn list_class_images(class_dir: &Path) -> Result<Vec<PathBuf>> {
    if !class_dir.is_dir() {
        tracing::debug!("クラスディレクトリが存在しません: {}", class_dir.display());
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(class_dir)
        .with_context(|| format!("Failed to read directory: {}", class_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// ルートディレクトリから両方の分割を作る
pub fn partition_directory(root: &Path, options: &SplitOptions) -> Result<Partition> {
    let class_files = options
        .class_names
        .iter()
        .map(|name| list_class_images(&root.join(name)))
        .collect::<Result<Vec<_>>>()?;

    Ok(stratified_split(class_files, options.val_split, options.seed))
}

/// 雑草分類データセット（パスとラベルのみ保持）
///
/// 画像の読み込みと変換はバッチャー側で行う。
#[derive(Debug, Clone)]
pub struct WeedDataset {
    samples: Vec<Sample>,
    class_names: Vec<String>,
    split: Split,
}

impl WeedDataset {
    /// ディレクトリから指定された分割を読み込む
    pub fn from_directory(root: &Path, split: Split, options: &SplitOptions) -> Result<Self> {
        let samples = partition_directory(root, options)?.into_split(split);

        tracing::info!(
            "{} データ: {} 枚 ({})",
            split,
            samples.len(),
            root.display()
        );

        Ok(Self {
            samples,
            class_names: options.class_names.clone(),
            split,
        })
    }

    pub fn from_samples(samples: Vec<Sample>, class_names: Vec<String>, split: Split) -> Self {
        Self {
            samples,
            class_names,
            split,
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// ラベル -> 枚数
    pub fn class_distribution(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.label).or_insert(0) += 1;
        }
        counts
    }

    /// クラス分布をログに出力
    pub fn log_distribution(&self) {
        let total = self.samples.len().max(1);
        for (label, count) in self.class_distribution() {
            let name = self
                .class_names
                .get(label)
                .map(String::as_str)
                .unwrap_or("?");
            tracing::info!(
                "  [{}] クラス {} ({}): {} 枚 ({:.1}%)",
                self.split,
                label,
                name,
                count,
                count as f64 * 100.0 / total as f64
            );
        }
    }
}

#[cfg(feature = "ml")]
impl Dataset<Sample> for WeedDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
