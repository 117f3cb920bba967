//! サンプル列をテンソルのバッチにまとめるバッチャー

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};

use crate::data::augment::Transform;
use crate::types::Sample;

/// バッチャー
///
/// 画像の読み込みと前処理はここで行う。読み込みに失敗した画像は
/// ゼロ埋めの画像に置き換え、ラベルはそのまま使う。
#[derive(Clone, Debug)]
pub struct WeedBatcher<B: Backend> {
    device: B::Device,
    transform: Transform,
}

impl<B: Backend> WeedBatcher<B> {
    pub fn new(device: B::Device, transform: Transform) -> Self {
        Self { device, transform }
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct WeedBatch<B: Backend> {
    /// [batch_size, 3, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// 1枚読み込む。失敗した場合はゼロ画像を返す
pub fn load_or_zeros(sample: &Sample, transform: &Transform) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    match transform.load(&sample.path, &mut rng) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(
                "画像読み込み失敗のためゼロ画像で代替します {}: {:#}",
                sample.path.display(),
                e
            );
            vec![0.0f32; transform.num_values()]
        }
    }
}

impl<B: Backend> Batcher<B, Sample, WeedBatch<B>> for WeedBatcher<B> {
    fn batch(&self, items: Vec<Sample>, _device: &B::Device) -> WeedBatch<B> {
        let batch_size = items.len();
        let size = self.transform.image_size() as usize;
        let mut all_pixels = Vec::with_capacity(batch_size * self.transform.num_values());
        let mut targets = Vec::with_capacity(batch_size);

        for item in &items {
            all_pixels.extend(load_or_zeros(item, &self.transform));
            targets.push(item.label as i64);
        }

        // バッチ全体を1回でデバイスへ転送
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        WeedBatch { images, targets }
    }
}
