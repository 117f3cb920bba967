//! 機械学習モデルの共通定義
//!
//! 雑草/土壌分類用の TinyResViT（CNNバックボーン + ViTヘッド）と
//! 関連する設定を提供します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::loss::CrossEntropyLossConfig,
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::ml::backbone::{TinyResNet, TinyResNetConfig, BACKBONE_STRIDE};
use crate::ml::vit_head::{TinyVit, TinyVitConfig};

/// デフォルトのクラス名（ディレクトリ名と一致）
pub const CLASS_NAMES: [&str; 3] = ["Broadleafs", "Grasses", "Soil"];

/// 画像サイズ
pub const IMAGE_SIZE: usize = 224;

pub fn default_class_names() -> Vec<String> {
    CLASS_NAMES.iter().map(|s| s.to_string()).collect()
}

/// モデル設定
#[derive(Config, Debug)]
pub struct WeedClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形、8の倍数）
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 32)]
    pub stem_channels: usize,
    #[config(default = 64)]
    pub feature_channels: usize,
    #[config(default = 128)]
    pub embed_dim: usize,
    #[config(default = 2)]
    pub depth: usize,
    #[config(default = 4)]
    pub num_heads: usize,
    #[config(default = 7)]
    pub patch_size: usize,
    #[config(default = 2.0)]
    pub mlp_ratio: f64,
}

impl WeedClassifierConfig {
    /// バックボーン出力の一辺
    pub fn feature_map_size(&self) -> usize {
        self.image_size / BACKBONE_STRIDE
    }

    pub fn num_patches(&self) -> usize {
        let grid = self.feature_map_size() / self.patch_size.max(1);
        grid * grid
    }

    /// 構成の整合性を確認
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be positive");
        }
        if self.image_size == 0 || self.image_size % BACKBONE_STRIDE != 0 {
            anyhow::bail!(
                "image_size must be a positive multiple of {}: {}",
                BACKBONE_STRIDE,
                self.image_size
            );
        }
        let feature = self.feature_map_size();
        if self.patch_size == 0 || feature % self.patch_size != 0 {
            anyhow::bail!(
                "feature map size {} (image_size {}) is not a multiple of patch_size {}",
                feature,
                self.image_size,
                self.patch_size
            );
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            anyhow::bail!(
                "embed_dim {} must be divisible by num_heads {}",
                self.embed_dim,
                self.num_heads
            );
        }
        Ok(())
    }

    /// モデルを初期化
    ///
    /// 不正な構成の場合はパニックする。事前に [`validate`](Self::validate) で確認すること。
    pub fn init<B: Backend>(&self, device: &B::Device) -> TinyResVit<B> {
        if let Err(e) = self.validate() {
            panic!("不正なモデル設定です: {}", e);
        }

        tracing::debug!(
            "[Model] 入力 {}x{} -> 特徴マップ {} x {}x{} -> パッチ {} 個 (embed_dim={}, depth={}, heads={})",
            self.image_size,
            self.image_size,
            self.feature_channels,
            self.feature_map_size(),
            self.feature_map_size(),
            self.num_patches(),
            self.embed_dim,
            self.depth,
            self.num_heads
        );

        let backbone = TinyResNetConfig::new()
            .with_stem_channels(self.stem_channels)
            .with_feature_channels(self.feature_channels)
            .init(device);

        let head = TinyVitConfig::new(self.feature_channels, self.num_classes, self.num_patches())
            .with_embed_dim(self.embed_dim)
            .with_depth(self.depth)
            .with_num_heads(self.num_heads)
            .with_patch_size(self.patch_size)
            .with_mlp_ratio(self.mlp_ratio)
            .init(device);

        TinyResVit { backbone, head }
    }
}

/// 雑草分類用モデル
///
/// # アーキテクチャ
/// - TinyResNet: [batch, 3, 224, 224] -> [batch, 64, 28, 28]
/// - TinyViT: 7x7パッチ16個 + 分類トークン -> Transformer x2 -> Linear
#[derive(Module, Debug)]
pub struct TinyResVit<B: Backend> {
    backbone: TinyResNet<B>,
    head: TinyVit<B>,
}

impl<B: Backend> TinyResVit<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// softmax 確率
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}
