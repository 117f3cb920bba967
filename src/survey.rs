//! 圃場調査: フレームを分類し、GPS位置と一緒にCSVへ記録する

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::data::weed_dataset::list_class_images;
use crate::gps::{GpsFix, GpsLink, GpsTracker, SerialTransport};
use crate::ml::inference::InferenceEngine;
use crate::model::labels::LabelProvider;

/// survey.csv のヘッダー（`SurveyRecord` のフィールド順）
pub const SURVEY_HEADER: [&str; 6] = ["frame", "label", "confidence", "latitude", "longitude", "fix_time"];

/// survey.csv の1行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyRecord {
    pub frame: String,
    pub label: String,
    pub confidence: f32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fix_time: Option<String>,
}

/// 直近の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_index: usize,
    pub label: String,
    pub confidence: f32,
}

/// 調査1回分の状態
///
/// 推論エンジン、ラベル、GPS接続、直近の分類結果、出力CSVを所有する。
/// GPS接続は調査の終了（ドロップ）時に閉じられる。
pub struct SurveyContext<B: Backend, L: LabelProvider, T: Read + Write = SerialTransport> {
    engine: InferenceEngine<B>,
    labels: L,
    gps: Option<(GpsLink<T>, GpsTracker)>,
    last_detection: Option<Detection>,
    writer: Writer<File>,
    written: usize,
}

impl<B: Backend, L: LabelProvider, T: Read + Write> SurveyContext<B, L, T> {
    pub fn new(
        engine: InferenceEngine<B>,
        labels: L,
        gps: Option<GpsLink<T>>,
        output_csv: &Path,
    ) -> Result<Self> {
        let num_outputs = engine.metadata().model.num_classes;
        if labels.len() != num_outputs {
            anyhow::bail!(
                "label provider has {} labels but the model has {} outputs",
                labels.len(),
                num_outputs
            );
        }

        if let Some(parent) = output_csv.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        // 記録が1行もなくてもヘッダーは残す
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_path(output_csv)
            .with_context(|| format!("Failed to create survey file: {}", output_csv.display()))?;
        writer.write_record(SURVEY_HEADER)?;
        writer.flush()?;

        Ok(Self {
            engine,
            labels,
            gps: gps.map(|link| (link, GpsTracker::default())),
            last_detection: None,
            writer,
            written: 0,
        })
    }

    pub fn last_detection(&self) -> Option<&Detection> {
        self.last_detection.as_ref()
    }

    pub fn last_fix(&self) -> Option<GpsFix> {
        self.gps.as_ref().and_then(|(_, tracker)| tracker.last_fix())
    }

    pub fn records_written(&self) -> usize {
        self.written
    }

    /// 1フレームを処理して記録する
    ///
    /// 分類に失敗した場合は直前の分類結果を使う。まだ分類結果がなければ記録しない。
    pub fn process_frame(&mut self, frame: &Path) -> Result<Option<SurveyRecord>> {
        match self.engine.classify_image(frame) {
            Ok(prediction) => {
                self.last_detection = Some(Detection {
                    class_index: prediction.class_index,
                    label: self.labels.label_or_index(prediction.class_index),
                    confidence: prediction.confidence,
                });
            }
            Err(e) => {
                tracing::warn!("フレームを分類できません（直前の結果を使用）{}: {:#}", frame.display(), e);
            }
        }

        let fix = match self.gps.as_mut() {
            Some((link, tracker)) => tracker.poll(link, Instant::now()),
            None => None,
        };

        let Some(detection) = &self.last_detection else {
            return Ok(None);
        };

        let record = SurveyRecord {
            frame: frame.display().to_string(),
            label: detection.label.clone(),
            confidence: detection.confidence,
            latitude: fix.map(|f| f.latitude),
            longitude: fix.map(|f| f.longitude),
            fix_time: fix.map(|f| f.time_string()),
        };

        self.writer.serialize(&record)?;
        self.writer.flush()?;
        self.written += 1;

        tracing::info!(
            "{}: {} ({:.3}) lat={} lon={}",
            record.frame,
            record.label,
            record.confidence,
            record.latitude.map(|v| format!("{:.6}", v)).unwrap_or_else(|| "-".into()),
            record.longitude.map(|v| format!("{:.6}", v)).unwrap_or_else(|| "-".into())
        );

        Ok(Some(record))
    }

    /// 全フレームを順に処理し、記録した行数を返す
    pub fn run(&mut self, frames: &[PathBuf]) -> Result<usize> {
        for frame in frames {
            self.process_frame(frame)?;
        }
        Ok(self.written)
    }

    /// CSVを書き切ってGPS接続を閉じる
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.written)
    }
}

/// ディレクトリ内のフレーム画像をパス順に列挙
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("Frames directory not found: {}", dir.display());
    }
    list_class_images(dir)
}
