//! コマンドライン引数の定義

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::gps::DEFAULT_BAUD_RATE;
use crate::model::config::{AppConfig, DeviceType};
use crate::types::Split;

#[derive(Parser, Debug)]
#[command(
    name = "weed_watcher",
    version,
    about = "TinyResViT weed / soil classifier: train, evaluate, export and survey"
)]
pub struct Cli {
    /// 設定ファイル（JSON）
    #[arg(long, global = true, default_value = "weed_watcher.json")]
    pub config: PathBuf,

    /// 計算デバイス（設定ファイルの値を上書き）
    #[arg(long, global = true, value_enum)]
    pub device: Option<DeviceType>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// モデルを学習する
    Train(TrainArgs),
    /// 画像1枚を分類する
    Predict(PredictArgs),
    /// 検証データで評価する
    Evaluate(EvaluateArgs),
    /// 配布用の重みを書き出す
    Export(ExportArgs),
    /// 推論速度を計測する
    Benchmark(BenchmarkArgs),
    /// データセットの分割内容を表示する
    Inspect(InspectArgs),
    /// フレームを分類してGPS位置と一緒に記録する
    Survey(SurveyArgs),
}

#[derive(Args, Debug, Default)]
pub struct TrainArgs {
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long)]
    pub weight_decay: Option<f32>,
    #[arg(long)]
    pub image_size: Option<usize>,
    #[arg(long)]
    pub num_workers: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// latest_model.tar.gz から再開
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

impl TrainArgs {
    /// 指定された値で設定を上書き
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.data_dir {
            config.data.data_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.training.output_dir = dir.clone();
        }
        if let Some(v) = self.epochs {
            config.training.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.training.batch_size = v;
        }
        if let Some(v) = self.lr {
            config.training.learning_rate = v;
        }
        if let Some(v) = self.weight_decay {
            config.training.weight_decay = v;
        }
        if let Some(v) = self.image_size {
            config.data.image_size = v;
        }
        if let Some(v) = self.num_workers {
            config.training.num_workers = v;
        }
        if let Some(v) = self.seed {
            config.data.seed = v;
        }
    }
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// チェックポイントまたは書き出した重み
    #[arg(long)]
    pub model: Option<PathBuf>,
    #[arg(long)]
    pub image: PathBuf,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[arg(long)]
    pub model: Option<PathBuf>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// 無作為に選ぶ枚数
    #[arg(long, default_value_t = 5)]
    pub num_samples: usize,
    /// 検証データ全件を評価
    #[arg(long)]
    pub all: bool,
    /// サンプル選択用シード
    #[arg(long, default_value_t = 0)]
    pub sample_seed: u64,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[arg(long)]
    pub model: Option<PathBuf>,
    #[arg(long, default_value = "optimized_models")]
    pub output_dir: PathBuf,
    /// 書き出し後のベンチマーク回数（0で省略）
    #[arg(long, default_value_t = 100)]
    pub runs: usize,
}

#[derive(Args, Debug)]
pub struct BenchmarkArgs {
    /// 比較するモデル（先頭が基準）
    #[arg(long, required = true, num_args = 1..)]
    pub model: Vec<PathBuf>,
    #[arg(long, default_value_t = 100)]
    pub runs: usize,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// train / val（省略時は両方）
    #[arg(long)]
    pub split: Option<Split>,
}

#[derive(Args, Debug)]
pub struct SurveyArgs {
    #[arg(long)]
    pub model: Option<PathBuf>,
    #[arg(long)]
    pub frames_dir: PathBuf,
    #[arg(long, default_value = "survey.csv")]
    pub output: PathBuf,
    /// GPSデバイス（例: /dev/ttyUSB0）
    #[arg(long)]
    pub gps_device: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub gps_baud: u32,
    /// 1行1ラベルのラベルファイル
    #[arg(long)]
    pub labels: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_train_overrides() {
        let cli = Cli::parse_from([
            "weed_watcher",
            "--device",
            "cpu",
            "train",
            "--epochs",
            "3",
            "--lr",
            "0.01",
            "--data-dir",
            "fields",
        ]);
        assert_eq!(cli.device, Some(DeviceType::Cpu));

        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let mut config = AppConfig::default();
        args.apply(&mut config);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.data.data_dir, PathBuf::from("fields"));
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn test_parse_inspect_split() {
        let cli = Cli::parse_from(["weed_watcher", "inspect", "--split", "val"]);
        let Commands::Inspect(args) = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(args.split, Some(Split::Validation));
    }

    #[test]
    fn test_benchmark_requires_model() {
        assert!(Cli::try_parse_from(["weed_watcher", "benchmark"]).is_err());
        let cli = Cli::try_parse_from([
            "weed_watcher",
            "benchmark",
            "--model",
            "a.bin",
            "b.bin",
        ])
        .unwrap();
        let Commands::Benchmark(args) = cli.command else {
            panic!("expected benchmark");
        };
        assert_eq!(args.model.len(), 2);
    }

    #[test]
    fn test_survey_defaults() {
        let cli = Cli::parse_from(["weed_watcher", "survey", "--frames-dir", "frames"]);
        let Commands::Survey(args) = cli.command else {
            panic!("expected survey");
        };
        assert_eq!(args.output, PathBuf::from("survey.csv"));
        assert!(args.gps_device.is_none());
        assert_eq!(args.gps_baud, 115_200);
        assert_eq!(cli.config, PathBuf::from("weed_watcher.json"));
    }
}
