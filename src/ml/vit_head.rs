//! 特徴マップに対する小型ViTヘッド
//!
//! 28x28 の特徴マップを 7x7 パッチ（4x4 = 16 個）に分割し、
//! 分類トークンを先頭に付けて Transformer に通します。

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        conv::{Conv2d, Conv2dConfig},
        Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{backend::Backend, Tensor},
};

/// パッチ埋め込み: kernel = stride = patch_size の畳み込み
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    proj: Conv2d<B>,
}

impl<B: Backend> PatchEmbed<B> {
    pub fn new(in_ch: usize, embed_dim: usize, patch_size: usize, device: &B::Device) -> Self {
        Self {
            proj: Conv2dConfig::new([in_ch, embed_dim], [patch_size, patch_size])
                .with_stride([patch_size, patch_size])
                .init(device),
        }
    }

    /// [batch, C, H, W] -> [batch, N, embed_dim]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.proj.forward(x);
        let [batch_size, dim, h, w] = x.dims();
        x.reshape([batch_size, dim, h * w]).swap_dims(1, 2)
    }
}

/// Pre-norm Transformer ブロック
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: MultiHeadAttention<B>,
    norm2: LayerNorm<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Gelu,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(dim: usize, num_heads: usize, mlp_ratio: f64, device: &B::Device) -> Self {
        let hidden = (dim as f64 * mlp_ratio) as usize;
        Self {
            norm1: LayerNormConfig::new(dim).init(device),
            attn: MultiHeadAttentionConfig::new(dim, num_heads)
                .with_dropout(0.0)
                .init(device),
            norm2: LayerNormConfig::new(dim).init(device),
            fc1: LinearConfig::new(dim, hidden).init(device),
            fc2: LinearConfig::new(hidden, dim).init(device),
            activation: Gelu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = self.norm1.forward(x.clone());
        let h = self.attn.forward(MhaInput::self_attn(h)).context;
        let x = x + h;

        let h = self.norm2.forward(x.clone());
        let h = self.fc1.forward(h);
        let h = self.activation.forward(h);
        let h = self.fc2.forward(h);
        x + h
    }
}

/// ViTヘッド設定
#[derive(Config, Debug)]
pub struct TinyVitConfig {
    /// 入力特徴マップのチャネル数
    pub in_channels: usize,
    pub num_classes: usize,
    /// パッチ数（特徴マップ一辺 / patch_size の2乗）
    pub num_patches: usize,
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

impl TinyVitConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TinyVit<B> {
        let dim = self.embed_dim;
        TinyVit {
            patch_embed: PatchEmbed::new(self.in_channels, dim, self.patch_size, device),
            // 分類トークンと位置埋め込みはゼロで初期化
            cls_token: Param::from_tensor(Tensor::zeros([1, 1, dim], device)),
            pos_embed: Param::from_tensor(Tensor::zeros([1, self.num_patches + 1, dim], device)),
            blocks: (0..self.depth)
                .map(|_| TransformerBlock::new(dim, self.num_heads, self.mlp_ratio, device))
                .collect(),
            norm: LayerNormConfig::new(dim).init(device),
            head: LinearConfig::new(dim, self.num_classes).init(device),
        }
    }
}

/// 小型ViTヘッド
#[derive(Module, Debug)]
pub struct TinyVit<B: Backend> {
    patch_embed: PatchEmbed<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embed: Param<Tensor<B, 3>>,
    blocks: Vec<TransformerBlock<B>>,
    norm: LayerNorm<B>,
    head: Linear<B>,
}

impl<B: Backend> TinyVit<B> {
    /// [batch, C, H, W] -> [batch, num_classes]
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.patch_embed.forward(features);
        let [batch_size, _, dim] = x.dims();

        let cls = self.cls_token.val().repeat_dim(0, batch_size);
        let x = Tensor::cat(vec![cls, x], 1);
        let x = x + self.pos_embed.val().repeat_dim(0, batch_size);

        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.norm.forward(x);

        let cls_out = x.slice([0..batch_size, 0..1, 0..dim]).reshape([batch_size, dim]);
        self.head.forward(cls_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_patch_embed_sequence_length() {
        let device = NdArrayDevice::Cpu;
        let embed = PatchEmbed::<TestBackend>::new(64, 128, 7, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 64, 28, 28], &device);
        assert_eq!(embed.forward(x).dims(), [2, 16, 128]);
    }

    #[test]
    fn test_vit_head_output_shape() {
        let device = NdArrayDevice::Cpu;
        let head = TinyVitConfig::new(64, 3, 16).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random(
            [1, 64, 28, 28],
            burn::tensor::Distribution::Default,
            &device,
        );
        assert_eq!(head.forward(x).dims(), [1, 3]);
    }

    #[test]
    fn test_transformer_block_keeps_shape() {
        let device = NdArrayDevice::Cpu;
        let block = TransformerBlock::<TestBackend>::new(32, 4, 2.0, &device);
        let x = Tensor::<TestBackend, 3>::ones([3, 5, 32], &device);
        assert_eq!(block.forward(x).dims(), [3, 5, 32]);
    }
}
