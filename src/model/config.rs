//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット、モデル、学習の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// クラスごとのサブディレクトリを持つルート
    pub data_dir: PathBuf,
    /// クラス名（並び順がラベル）
    pub class_names: Vec<String>,
    /// 検証用の割合
    pub val_split: f64,
    /// 分割用シード
    pub seed: u64,
    /// 入力画像サイズ
    pub image_size: usize,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            class_names: vec![
                "Broadleafs".to_string(),
                "Grasses".to_string(),
                "Soil".to_string(),
            ],
            val_split: 0.2,
            seed: 42,
            image_size: 224,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 推論に使うチェックポイント。未指定なら出力先の最新 run から選ぶ
    pub model_path: Option<PathBuf>,
    pub stem_channels: usize,
    pub feature_channels: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub patch_size: usize,
    pub mlp_ratio: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            stem_channels: 32,
            feature_channels: 64,
            embed_dim: 128,
            depth: 2,
            num_heads: 4,
            patch_size: 7,
            mlp_ratio: 2.0,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    /// 実行ごとの run_* ディレクトリを作る場所
    pub output_dir: PathBuf,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            batch_size: 32,
            num_workers: 4,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    pub data: DataSettings,
    pub model: ModelSettings,
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("weed_watcher.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む。存在しない、または壊れている場合はデフォルト設定を返す
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::debug!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("データ: {}", self.data.data_dir.display());
        println!("クラス: {}", self.data.class_names.join(", "));
        println!("検証割合: {} (seed {})", self.data.val_split, self.data.seed);
        println!("画像サイズ: {}x{}", self.data.image_size, self.data.image_size);
        println!("\n--- モデル設定 ---");
        match &self.model.model_path {
            Some(path) => println!("モデルパス: {}", path.display()),
            None => println!("モデルパス: {} 内の最新 run", self.training.output_dir.display()),
        }
        println!(
            "チャネル: [{}, {}], embed_dim: {}, depth: {}, heads: {}, patch: {}",
            self.model.stem_channels,
            self.model.feature_channels,
            self.model.embed_dim,
            self.model.depth,
            self.model.num_heads,
            self.model.patch_size
        );
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("weight decay: {}", self.training.weight_decay);
        println!("出力先: {}", self.training.output_dir.display());
        println!("========================\n");
    }
}

#[cfg(feature = "ml")]
impl AppConfig {
    /// モデル構成に変換
    pub fn classifier_config(&self) -> crate::ml::ml_model::WeedClassifierConfig {
        crate::ml::ml_model::WeedClassifierConfig::new(self.data.class_names.len())
            .with_image_size(self.data.image_size)
            .with_stem_channels(self.model.stem_channels)
            .with_feature_channels(self.model.feature_channels)
            .with_embed_dim(self.model.embed_dim)
            .with_depth(self.model.depth)
            .with_num_heads(self.model.num_heads)
            .with_patch_size(self.model.patch_size)
            .with_mlp_ratio(self.model.mlp_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.data.class_names.len(), 3);
        assert_eq!(config.training.num_epochs, 30);
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.data.seed = 7;
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.device_type, DeviceType::Cpu);
        assert_eq!(deserialized.data.seed, 7);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"training": {"num_epochs": 3}}"#).unwrap();
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.data.image_size, 224);
        assert!(config.model.model_path.is_none());

        let pinned: AppConfig =
            serde_json::from_str(r#"{"model": {"model_path": "deploy/model_half.bin"}}"#).unwrap();
        assert_eq!(pinned.model.model_path, Some(PathBuf::from("deploy/model_half.bin")));
    }

    #[test]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load_or_default(&path);
        assert_eq!(config.training.num_epochs, 30);

        let mut saved = AppConfig::default();
        saved.training.num_epochs = 5;
        saved.save(&path).unwrap();
        assert_eq!(AppConfig::load_or_default(&path).training.num_epochs, 5);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }

    #[cfg(feature = "ml")]
    #[test]
    fn test_classifier_config_is_valid() {
        let config = AppConfig::default().classifier_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_classes, 3);
    }
}
