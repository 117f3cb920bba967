//! 畳み込みバックボーン（TinyResNet）
//!
//! 224x224x3 の入力を 64x28x28 の特徴マップに変換します。
//!
//! # アーキテクチャ
//! - Stem: Conv 3x3 (3 -> c0) + BN + ReLU
//! - MaxPool 2x2 stride 2                      224 -> 112
//! - Stage1: ResBlock(c0) + ConvBlock(c0 -> c1, stride 2)  112 -> 56
//! - Stage2: ResBlock(c1) + ConvBlock(c1 -> c1, stride 2)   56 -> 28

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// 入力からバックボーン出力までの縮小率
pub const BACKBONE_STRIDE: usize = 8;

fn conv3x3(in_ch: usize, out_ch: usize, stride: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_ch, out_ch], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
}

/// Conv 3x3 + BatchNorm + ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_ch: usize, out_ch: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(in_ch, out_ch, stride).init(device),
            norm: BatchNormConfig::new(out_ch).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// 残差ブロック: ConvBlock -> Conv + BN -> ショートカット加算 -> ReLU
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    conv1: ConvBlock<B>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B>,
    activation: Relu,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: ConvBlock::new(channels, channels, 1, device),
            conv2: conv3x3(channels, channels, 1).init(device),
            norm2: BatchNormConfig::new(channels).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv1.forward(x.clone());
        let out = self.conv2.forward(out);
        let out = self.norm2.forward(out);
        self.activation.forward(out + x)
    }
}

/// バックボーン設定（チャネル幅のみ変更可能）
#[derive(Config, Debug)]
pub struct TinyResNetConfig {
    /// Stem と Stage1 のチャネル数
    #[config(default = 32)]
    pub stem_channels: usize,
    /// Stage1 以降の出力チャネル数
    #[config(default = 64)]
    pub feature_channels: usize,
}

impl TinyResNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TinyResNet<B> {
        let c0 = self.stem_channels;
        let c1 = self.feature_channels;

        TinyResNet {
            stem: ConvBlock::new(3, c0, 1, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            res1: ResBlock::new(c0, device),
            down1: ConvBlock::new(c0, c1, 2, device),
            res2: ResBlock::new(c1, device),
            down2: ConvBlock::new(c1, c1, 2, device),
        }
    }

    /// 入力サイズに対する出力特徴マップの一辺
    pub fn output_size(&self, image_size: usize) -> usize {
        image_size / BACKBONE_STRIDE
    }
}

/// 小型ResNetバックボーン
#[derive(Module, Debug)]
pub struct TinyResNet<B: Backend> {
    stem: ConvBlock<B>,
    pool: MaxPool2d,
    res1: ResBlock<B>,
    down1: ConvBlock<B>,
    res2: ResBlock<B>,
    down2: ConvBlock<B>,
}

impl<B: Backend> TinyResNet<B> {
    /// [batch, 3, H, W] -> [batch, feature_channels, H/8, W/8]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(images);
        let x = self.pool.forward(x);
        let x = self.res1.forward(x);
        let x = self.down1.forward(x);
        let x = self.res2.forward(x);
        self.down2.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_backbone_output_shape() {
        let device = NdArrayDevice::Cpu;
        let backbone = TinyResNetConfig::new().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 224, 224], &device);
        assert_eq!(backbone.forward(x).dims(), [1, 64, 28, 28]);
    }

    #[test]
    fn test_backbone_custom_widths() {
        let device = NdArrayDevice::Cpu;
        let config = TinyResNetConfig::new()
            .with_stem_channels(8)
            .with_feature_channels(16);
        let backbone = config.init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 56, 56], &device);
        assert_eq!(backbone.forward(x).dims(), [2, 16, 7, 7]);
        assert_eq!(config.output_size(56), 7);
    }
}
