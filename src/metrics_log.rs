//! エポックごとの学習指標をCSVに追記する

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// metrics.csv の1行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    /// そのエポックで使った学習率
    pub lr: f64,
    /// 経過秒数
    pub seconds: f64,
}

pub struct MetricsLogger {
    path: PathBuf,
}

impl MetricsLogger {
    /// ファイルが存在しない、または空の場合はヘッダーを書き込む
    pub fn create(path: &Path) -> Result<Self> {
        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if needs_header {
            let mut writer = WriterBuilder::new()
                .has_headers(false)
                .from_path(path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            writer.write_record([
                "epoch",
                "train_loss",
                "train_acc",
                "val_loss",
                "val_acc",
                "lr",
                "seconds",
            ])?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &MetricsRow) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open metrics file: {}", self.path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }
}

pub fn load_metrics(path: &Path) -> Result<Vec<MetricsRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open metrics file: {}", path.display()))?;

    let mut rows = Vec::new();
    for result in reader.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}
