//! モデル・オプティマイザのレコードとバイト列の相互変換
//!
//! MessagePack 形式。壊れたバイト列はパニックせずエラーとして返る。

use anyhow::Result;
use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, HalfPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};

use crate::ml::ml_model::{TinyResVit, WeedClassifierConfig};

type FullRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;
type HalfRecorder = NamedMpkBytesRecorder<HalfPrecisionSettings>;

/// 重みの保存精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Full => write!(f, "f32"),
            Precision::Half => write!(f, "f16"),
        }
    }
}

/// モデルの重みをバイト列に変換
pub fn encode_model<B: Backend>(model: &TinyResVit<B>, precision: Precision) -> Result<Vec<u8>> {
    let record = model.clone().into_record();
    let bytes = match precision {
        Precision::Full => Recorder::<B>::record(
            &FullRecorder::default(),
            record,
            (),
        ),
        Precision::Half => Recorder::<B>::record(
            &HalfRecorder::default(),
            record,
            (),
        ),
    }
    .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;
    Ok(bytes)
}

/// 設定からモデルを組み立て、重みを復元
pub fn decode_model<B: Backend>(
    config: &WeedClassifierConfig,
    bytes: Vec<u8>,
    precision: Precision,
    device: &B::Device,
) -> Result<TinyResVit<B>> {
    config.validate()?;
    let model = config.init::<B>(device);
    load_model_bytes(model, bytes, precision, device)
}

/// 既存のモデルに重みを読み込む
pub fn load_model_bytes<B: Backend>(
    model: TinyResVit<B>,
    bytes: Vec<u8>,
    precision: Precision,
    device: &B::Device,
) -> Result<TinyResVit<B>> {
    let record = match precision {
        Precision::Full => Recorder::<B>::load(
            &FullRecorder::default(),
            bytes,
            device,
        ),
        Precision::Half => Recorder::<B>::load(
            &HalfRecorder::default(),
            bytes,
            device,
        ),
    }
    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok(model.load_record(record))
}

/// オプティマイザの状態をバイト列に変換
pub fn encode_optimizer<B, M, O>(optim: &O) -> Result<Vec<u8>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    Recorder::<B>::record(
        &FullRecorder::default(),
        optim.to_record(),
        (),
    )
    .map_err(|e| anyhow::anyhow!("オプティマイザ状態のシリアライズエラー: {:?}", e))
}

/// オプティマイザの状態を復元
pub fn decode_optimizer<B, M, O>(optim: O, bytes: Vec<u8>, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record: O::Record = Recorder::<B>::load(
        &FullRecorder::default(),
        bytes,
        device,
    )
    .map_err(|e| anyhow::anyhow!("オプティマイザ状態の読み込みエラー: {:?}", e))?;

    Ok(optim.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn small_config() -> WeedClassifierConfig {
        WeedClassifierConfig::new(3)
            .with_image_size(56)
            .with_stem_channels(8)
            .with_feature_channels(16)
            .with_embed_dim(32)
    }

    #[test]
    fn test_full_precision_roundtrip_is_bit_identical() {
        let device = NdArrayDevice::Cpu;
        let config = small_config();
        let model = config.init::<TestBackend>(&device);

        let bytes = encode_model(&model, Precision::Full).unwrap();
        // 別の乱数で初期化されたモデルに読み込む
        let restored =
            decode_model::<TestBackend>(&config, bytes.clone(), Precision::Full, &device).unwrap();

        assert_eq!(encode_model(&restored, Precision::Full).unwrap(), bytes);

        let x = Tensor::<TestBackend, 4>::ones([1, 3, 56, 56], &device);
        let a: Vec<f32> = model.forward(x.clone()).into_data().iter::<f32>().collect();
        let b: Vec<f32> = restored.forward(x).into_data().iter::<f32>().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_half_precision_is_smaller_and_loadable() {
        let device = NdArrayDevice::Cpu;
        let config = small_config();
        let model = config.init::<TestBackend>(&device);

        let full = encode_model(&model, Precision::Full).unwrap();
        let half = encode_model(&model, Precision::Half).unwrap();
        assert!(half.len() < full.len());

        let restored = decode_model::<TestBackend>(&config, half, Precision::Half, &device).unwrap();
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 56, 56], &device);
        let logits: Vec<f32> = restored.forward(x).into_data().iter::<f32>().collect();
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_garbage_bytes_are_rejected() {
        let device = NdArrayDevice::Cpu;
        let result = decode_model::<TestBackend>(
            &small_config(),
            vec![1, 2, 3, 4],
            Precision::Full,
            &device,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_truncated_weights_are_an_error() {
        let device = NdArrayDevice::Cpu;
        let config = small_config();
        let bytes = encode_model(&config.init::<TestBackend>(&device), Precision::Full).unwrap();

        let truncated = bytes[..bytes.len() / 2].to_vec();
        assert!(decode_model::<TestBackend>(&config, truncated, Precision::Full, &device).is_err());
        // 半精度でも同様
        let half = encode_model(&config.init::<TestBackend>(&device), Precision::Half).unwrap();
        assert!(decode_model::<TestBackend>(&config, half[..16].to_vec(), Precision::Half, &device).is_err());
    }
}
