//! クラスインデックスからラベル文字列への変換

use anyhow::{Context, Result};
use std::path::Path;

/// クラスインデックス -> ラベル
pub trait LabelProvider {
    fn label(&self, index: usize) -> Option<&str>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 範囲外なら `class_<index>` を返す
    fn label_or_index(&self, index: usize) -> String {
        self.label(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", index))
    }
}

/// チェックポイントに記録されたクラス名
#[derive(Debug, Clone, PartialEq)]
pub struct ClassNames(Vec<String>);

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl LabelProvider for ClassNames {
    fn label(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// 1行1ラベルのラベルファイル
///
/// 行数がモデル出力数より1つ多い場合は先頭を背景ラベルとみなして取り除く。
#[derive(Debug, Clone, PartialEq)]
pub struct LabelFile {
    labels: Vec<String>,
    dropped_background: bool,
}

impl LabelFile {
    pub fn load(path: &Path, num_outputs: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read labels file: {}", path.display()))?;
        Self::parse(&content, num_outputs)
            .with_context(|| format!("Invalid labels file: {}", path.display()))
    }

    pub fn parse(content: &str, num_outputs: usize) -> Result<Self> {
        let mut labels: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let dropped_background = if labels.len() == num_outputs + 1 {
            let background = labels.remove(0);
            tracing::debug!("背景ラベルを除外しました: {}", background);
            true
        } else if labels.len() == num_outputs {
            false
        } else {
            anyhow::bail!(
                "labels count {} does not match model outputs {}",
                labels.len(),
                num_outputs
            );
        };

        Ok(Self {
            labels,
            dropped_background,
        })
    }

    pub fn dropped_background(&self) -> bool {
        self.dropped_background
    }
}

impl LabelProvider for LabelFile {
    fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_leading_background() {
        let file = LabelFile::parse("background\ncat\ndog\n", 2).unwrap();
        assert!(file.dropped_background());
        assert_eq!(file.label(0), Some("cat"));
        assert_eq!(file.label(1), Some("dog"));
        assert_eq!(file.len(), 2);
    }

    #[test]
    fn test_exact_count_is_kept() {
        let file = LabelFile::parse("Broadleafs\nGrasses\n\nSoil", 3).unwrap();
        assert!(!file.dropped_background());
        assert_eq!(file.label(2), Some("Soil"));
    }

    #[test]
    fn test_other_mismatch_is_error() {
        assert!(LabelFile::parse("a\nb\nc\nd\n", 2).is_err());
        assert!(LabelFile::parse("a\n", 2).is_err());
    }

    #[test]
    fn test_class_names_provider() {
        let names = ClassNames::new(vec!["Broadleafs".into(), "Soil".into()]);
        assert_eq!(names.label(1), Some("Soil"));
        assert_eq!(names.label(5), None);
        assert_eq!(names.label_or_index(5), "class_5");
        assert!(!names.is_empty());
    }
}
