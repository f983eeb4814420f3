//! # Airy 方程式の数値解と物理情報ニューラルネットワーク (PINN)
//!
//! 2階の常微分方程式 `y'' = x·y`（Airy 方程式）を、原点 `x = 0` での初期条件
//! `y(0) = Ai(0)`, `y'(0) = Ai'(0)` のもとで2通りに解きます。
//!
//! 1. 適応刻み幅の RK45 で定義域 `[a, b]` 全体の参照解を求め、CSV に保存します。
//! 2. `burn` で作った PINN を、方程式の残差と初期条件の残差を損失として学習します。
//!
//! ## 使い方
//!
//! ### 参照解の計算
//! ```bash
//! cargo run --release -- solve -n 1000
//! ```
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --epochs 50
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer
//! ```

pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod device;
pub mod equation;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod pinn;
pub mod plot;
pub mod solver;
pub mod training;

/// 参照データの CSV の既定の保存先
pub const DATASET_PATH: &str = "data/numerical_airy/numerical_dataframe.csv";
/// チェックポイントの既定の保存先ディレクトリ
pub const CHECKPOINT_DIR: &str = "data/checkpoints/new_checkpoint";
/// 推論結果の CSV の既定の保存先
pub const PREDICTIONS_PATH: &str = "data/predictions/pinn_predictions.csv";
/// グラフの保存先ディレクトリ
pub const IMAGES_DIR: &str = "data/images";
