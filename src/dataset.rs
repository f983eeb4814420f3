//! 参照データセット（`x_value`, `y_value` の2列）とその CSV 保存・読み込み。

use csv::{Reader, Writer};
use rand::Rng;
use rand::seq::SliceRandom;
use std::fs::File;
use std::path::{Path, PathBuf};

const X_COLUMN: &str = "x_value";
const Y_COLUMN: &str = "y_value";

/// データセットの読み書き・検証のエラー。
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("'{}' を開けません: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{}' の CSV を処理できません: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("'{}' に列 '{column}' がありません", .path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("'{}' の {row} 行目の値 '{value}' を数値として読めません", .path.display())]
    Parse {
        path: PathBuf,
        row: usize,
        value: String,
    },
    #[error("x と y の長さが一致しません（x: {x}, y: {y}）")]
    LengthMismatch { x: usize, y: usize },
    #[error("x が {index} 番目で狭義単調増加になっていません")]
    NotIncreasing { index: usize },
    #[error("データセットが空です")]
    Empty,
}

/// 学習に使う1バッチ分の `(x, y_numerical)`。
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// `x` の昇順に並んだ数値解のサンプル列。
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDataset {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl ReferenceDataset {
    /// 列を検証してデータセットを作ります。
    ///
    /// 空でなく、長さが揃い、`x` が狭義単調増加である必要があります。
    pub fn from_columns(x: Vec<f64>, y: Vec<f64>) -> Result<Self, DatasetError> {
        if x.len() != y.len() {
            return Err(DatasetError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }
        if x.is_empty() {
            return Err(DatasetError::Empty);
        }
        if let Some(index) = x.windows(2).position(|pair| !(pair[0] < pair[1])) {
            return Err(DatasetError::NotIncreasing { index: index + 1 });
        }
        Ok(Self { x, y })
    }

    /// 数値解法が返した、既に整列済みの列から作ります。
    pub(crate) fn from_sorted(x: Vec<f64>, y: Vec<f64>) -> Self {
        debug_assert!(x.windows(2).all(|pair| pair[0] < pair[1]));
        debug_assert_eq!(x.len(), y.len());
        Self { x, y }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// `(最小の x, 最大の x)`
    pub fn domain(&self) -> Option<(f64, f64)> {
        Some((*self.x.first()?, *self.x.last()?))
    }

    /// CSV に保存します。値は往復で元に戻る最短表記で書き出します。
    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let path = path.as_ref();
        let csv_error = |source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = Writer::from_path(path).map_err(csv_error)?;
        writer.write_record([X_COLUMN, Y_COLUMN]).map_err(csv_error)?;
        for (x, y) in self.x.iter().zip(&self.y) {
            writer
                .write_record([x.to_string(), y.to_string()])
                .map_err(csv_error)?;
        }
        writer.flush().map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// CSV から読み込み、[`ReferenceDataset::from_columns`] と同じ検証を行います。
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let csv_error = |source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = Reader::from_reader(file);
        let headers = reader.headers().map_err(csv_error)?.clone();
        let column = |name: &'static str| {
            headers
                .iter()
                .position(|header| header.trim() == name)
                .ok_or_else(|| DatasetError::MissingColumn {
                    path: path.to_path_buf(),
                    column: name,
                })
        };
        let x_index = column(X_COLUMN)?;
        let y_index = column(Y_COLUMN)?;

        let mut x = Vec::new();
        let mut y = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            let parse = |index: usize| {
                let raw = record.get(index).unwrap_or("");
                raw.trim().parse::<f64>().map_err(|_| DatasetError::Parse {
                    path: path.to_path_buf(),
                    row: row + 1,
                    value: raw.to_string(),
                })
            };
            x.push(parse(x_index)?);
            y.push(parse(y_index)?);
        }

        Self::from_columns(x, y)
    }

    /// データセットを `batch_size` ごとのバッチに分けます。
    ///
    /// `rng` を渡すと順序をシャッフルします。最後のバッチは端数になり得ます。
    pub fn batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: Option<&mut R>) -> Vec<Batch> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            indices.shuffle(rng);
        }
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| Batch {
                x: chunk.iter().map(|&i| self.x[i] as f32).collect(),
                y: chunk.iter().map(|&i| self.y[i] as f32).collect(),
            })
            .collect()
    }
}
