//! チェックポイントの永続化
//!
//! Tar.gz形式でメタデータとモデル・オプティマイザの状態を1ファイルに統合して保存します。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - エポック、検証精度、スケジューラ状態、モデル設定、クラス名
//! - model.bin       - モデルの重み（NamedMpkBytesRecorder）
//! - optimizer.bin   - オプティマイザの状態（エクスポート時は省略）
//!
//! エクスポートされた重みは tar.gz ではなく、生のレコードと
//! 同名の `.json` サイドカーの組で保存されます。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::data::weed_dataset::{DEFAULT_SEED, DEFAULT_VAL_SPLIT};
use crate::ml::ml_model::WeedClassifierConfig;
use crate::ml::persistence::Precision;
use crate::ml::scheduler::ReduceOnPlateau;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

/// gzip のマジックナンバー
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// チェックポイントのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 保存時点のエポック（1始まり）
    pub epoch: usize,
    pub val_acc: f64,
    pub val_loss: f64,
    /// 保存時点までの最良検証精度
    pub best_val_acc: f64,
    /// 次エポックで使う学習率
    pub learning_rate: f64,
    pub scheduler: ReduceOnPlateau,
    pub model: WeedClassifierConfig,
    pub class_names: Vec<String>,
    /// 学習時のデータ分割シード
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// 学習時の検証データ割合
    #[serde(default = "default_val_split")]
    pub val_split: f64,
    #[serde(default)]
    pub precision: Precision,
    /// 保存時刻（RFC3339）
    pub saved_at: String,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        val_acc: f64,
        val_loss: f64,
        best_val_acc: f64,
        scheduler: ReduceOnPlateau,
        model: WeedClassifierConfig,
        class_names: Vec<String>,
    ) -> Self {
        Self {
            epoch,
            val_acc,
            val_loss,
            best_val_acc,
            learning_rate: scheduler.lr(),
            scheduler,
            model,
            class_names,
            seed: DEFAULT_SEED,
            val_split: DEFAULT_VAL_SPLIT,
            precision: Precision::Full,
            saved_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 学習に使ったデータ分割を記録
    pub fn with_split(mut self, seed: u64, val_split: f64) -> Self {
        self.seed = seed;
        self.val_split = val_split;
        self
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_val_split() -> f64 {
    DEFAULT_VAL_SPLIT
}

/// 読み込んだチェックポイント
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub model: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
}

/// `.gz` で終わらないパスには `.tar.gz` を付ける
pub fn bundle_path(path: &Path) -> PathBuf {
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        path.to_path_buf()
    } else {
        path.with_extension("tar.gz")
    }
}

/// 重みファイルに対応するサイドカーJSONのパス
pub fn sidecar_path(weights_path: &Path) -> PathBuf {
    weights_path.with_extension("json")
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// チェックポイントを保存し、実際に書き込んだパスを返す
pub fn save_checkpoint(
    output_path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
    if let Some(optimizer) = optimizer_binary {
        append_entry(&mut tar_builder, OPTIMIZER_ENTRY, optimizer)?;
    }

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(tar_gz_path)
}

/// チェックポイント全体を読み込む
pub fn load_checkpoint(tar_gz_path: &Path) -> Result<Checkpoint> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata = None;
    let mut model = None;
    let mut optimizer = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata = Some(CheckpointMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model = Some(buffer);
            }
            OPTIMIZER_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                optimizer = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata, model) {
        (Some(metadata), Some(model)) => Ok(Checkpoint {
            metadata,
            model,
            optimizer,
        }),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// Tar.gzからメタデータのみ読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<CheckpointMetadata> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return CheckpointMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// 先頭2バイトで tar.gz かどうかを判定
pub fn is_bundle(path: &Path) -> Result<bool> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open model file: {}", path.display()))?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// 重みのみを保存（サイドカーJSON付き）
pub fn save_weights(weights_path: &Path, metadata: &CheckpointMetadata, model_binary: &[u8]) -> Result<()> {
    if let Some(parent) = weights_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }
    std::fs::write(weights_path, model_binary)
        .with_context(|| format!("Failed to write weights: {}", weights_path.display()))?;

    let sidecar = sidecar_path(weights_path);
    std::fs::write(&sidecar, metadata.to_json_string()?)
        .with_context(|| format!("Failed to write sidecar: {}", sidecar.display()))?;
    Ok(())
}

/// チェックポイントまたはエクスポート済みの重みを読み込む
///
/// tar.gz であればバンドルとして、それ以外は生のレコード + サイドカーJSONとして扱う。
pub fn load_weights(path: &Path) -> Result<(CheckpointMetadata, Vec<u8>)> {
    if is_bundle(path)? {
        let checkpoint = load_checkpoint(path)?;
        return Ok((checkpoint.metadata, checkpoint.model));
    }

    let sidecar = sidecar_path(path);
    let json = std::fs::read_to_string(&sidecar).with_context(|| {
        format!(
            "Weights file {} needs a metadata sidecar at {}",
            path.display(),
            sidecar.display()
        )
    })?;
    let metadata = CheckpointMetadata::from_json_string(&json)?;
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read weights: {}", path.display()))?;
    Ok((metadata, bytes))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &CheckpointMetadata) {
    println!("\n=== チェックポイント情報 ===");
    println!("エポック: {}", metadata.epoch);
    println!("検証精度: {:.4}", metadata.val_acc);
    println!("検証損失: {:.4}", metadata.val_loss);
    println!("最良検証精度: {:.4}", metadata.best_val_acc);
    println!("学習率: {:.2e}", metadata.learning_rate);
    println!(
        "スケジューラ: best={:?}, 改善なし {} / {} エポック",
        metadata.scheduler.best, metadata.scheduler.num_bad_epochs, metadata.scheduler.patience
    );
    println!("クラス: {}", metadata.class_names.join(", "));
    println!("データ分割: seed {}, val_split {}", metadata.seed, metadata.val_split);
    println!(
        "モデル: 入力 {}x{}, channels [{}, {}], embed_dim {}, depth {}, heads {}, patch {}",
        metadata.model.image_size,
        metadata.model.image_size,
        metadata.model.stem_channels,
        metadata.model.feature_channels,
        metadata.model.embed_dim,
        metadata.model.depth,
        metadata.model.num_heads,
        metadata.model.patch_size
    );
    println!("精度: {}", metadata.precision);
    println!("保存日時: {}", metadata.saved_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> CheckpointMetadata {
        let mut scheduler = ReduceOnPlateau::new(1e-3);
        scheduler.step(0.8);
        CheckpointMetadata::new(
            4,
            0.8,
            0.45,
            0.8,
            scheduler,
            WeedClassifierConfig::new(3),
            vec!["Broadleafs".into(), "Grasses".into(), "Soil".into()],
        )
        .with_split(7, 0.25)
    }

    #[test]
    fn test_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let written = save_checkpoint(
            &dir.path().join("runs/best_model"),
            &metadata(),
            &[1, 2, 3, 4, 5],
            Some(&[9, 8, 7]),
        )
        .unwrap();

        assert_eq!(written, dir.path().join("runs/best_model.tar.gz"));
        let checkpoint = load_checkpoint(&written).unwrap();
        assert_eq!(checkpoint.model, vec![1, 2, 3, 4, 5]);
        assert_eq!(checkpoint.optimizer, Some(vec![9, 8, 7]));
        assert_eq!(checkpoint.metadata.epoch, 4);
        assert_eq!(checkpoint.metadata.scheduler.best, Some(0.8));
        assert_eq!(checkpoint.metadata.model.image_size, 224);

        let meta = load_metadata(&written).unwrap();
        assert_eq!(meta.class_names.len(), 3);
        assert_eq!(meta.seed, 7);
        assert_eq!(meta.val_split, 0.25);
    }

    #[test]
    fn test_metadata_without_split_uses_defaults() {
        let mut value = serde_json::to_value(metadata()).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("seed");
        object.remove("val_split");

        let meta = CheckpointMetadata::from_json_string(&value.to_string()).unwrap();
        assert_eq!(meta.seed, DEFAULT_SEED);
        assert_eq!(meta.val_split, DEFAULT_VAL_SPLIT);
    }

    #[test]
    fn test_bundle_path_keeps_gz() {
        assert_eq!(bundle_path(Path::new("a/b.tar.gz")), PathBuf::from("a/b.tar.gz"));
        assert_eq!(bundle_path(Path::new("a/latest")), PathBuf::from("a/latest.tar.gz"));
    }

    #[test]
    fn test_load_weights_accepts_bundle_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = save_checkpoint(&dir.path().join("ckpt"), &metadata(), &[5, 5], None).unwrap();
        let (meta, bytes) = load_weights(&bundle).unwrap();
        assert_eq!(bytes, vec![5, 5]);
        assert_eq!(meta.epoch, 4);

        let weights = dir.path().join("model_full.bin");
        save_weights(&weights, &metadata(), &[7, 7, 7]).unwrap();
        assert!(dir.path().join("model_full.json").exists());
        assert!(!is_bundle(&weights).unwrap());
        let (meta, bytes) = load_weights(&weights).unwrap();
        assert_eq!(bytes, vec![7, 7, 7]);
        assert_eq!(meta.val_acc, 0.8);
    }

    #[test]
    fn test_missing_sidecar_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("bare.bin");
        std::fs::write(&weights, [0u8; 16]).unwrap();
        assert!(load_weights(&weights).is_err());
    }
}
