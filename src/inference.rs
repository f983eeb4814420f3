use crate::checkpoint;
use crate::cli::InferArgs;
use crate::dataset::ReferenceDataset;
use crate::metrics;
use crate::model::{InputDerivatives, Model};
use crate::plot;
use anyhow::Context;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use csv::Writer;
use std::fs;
use std::time::Instant;
use tracing::{info, warn};

/// テンソルの中身を `Vec<f32>` として取り出せなかったときのエラー。
#[derive(Debug, thiserror::Error)]
#[error("テンソルの値を取り出せません: {0}")]
pub struct TensorDataError(String);

pub(crate) fn tensor_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, TensorDataError> {
    tensor
        .into_data()
        .to_vec::<f32>()
        .map_err(|err| TensorDataError(format!("{err:?}")))
}

/// 各 `x` での予測値 `y_pred` を求めます。
pub fn predict<B: Backend>(
    model: &Model<B>,
    x: &[f64],
    device: &B::Device,
) -> Result<Vec<f32>, TensorDataError> {
    let values: Vec<f32> = x.iter().map(|&x| x as f32).collect();
    let input = Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([values.len(), 1]);
    tensor_values(model.forward(input))
}

/// 原点での `(y(0), y'(0))`。
pub fn origin_values<B: Backend>(model: &Model<B>, device: &B::Device) -> (f32, f32) {
    let jet = model.forward_jet(Tensor::zeros([1, 1], device));
    (
        jet.value.into_scalar().elem::<f32>(),
        jet.first.into_scalar().elem::<f32>(),
    )
}

/// `infer`サブコマンドを実行します。
pub fn run<B: Backend>(args: &InferArgs, device: B::Device) -> anyhow::Result<()> {
    let meta = checkpoint::load_meta(&args.checkpoint)?;
    let dataset = ReferenceDataset::load_csv(&args.data)?;

    info!("推論を実行します");
    let inference_start = Instant::now();

    info!(
        "保存済みモデルを '{}' からロード中...（学習済み {} エポック）",
        args.checkpoint.display(),
        meta.epochs_completed
    );
    let model = checkpoint::load_model::<B>(&args.checkpoint, &meta.training.model, &device)?;
    let prediction = predict(&model, dataset.x(), &device)?;
    let (y0, dy0) = origin_values(&model, &device);
    let inference_duration = inference_start.elapsed();

    let truth: Vec<f32> = dataset.y().iter().map(|&y| y as f32).collect();
    let accuracy = metrics::accuracy(&truth, &prediction);
    let problem = &meta.training.problem;
    info!(
        "推論が完了しました。点数: {}, 精度 (1 - MAPE): {:.4}",
        prediction.len(),
        accuracy
    );
    info!(
        "原点での値: y(0) = {:.6} (目標 {:.6}), y'(0) = {:.6} (目標 {:.6})",
        y0, problem.initial_value, dy0, problem.initial_slope
    );
    info!("=> 推論時間: {:.2?}", inference_duration);

    if let Some(parent) = args.output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("'{}' を作成できません", parent.display()))?;
    }
    let mut writer = Writer::from_path(&args.output)
        .with_context(|| format!("'{}' を作成できません", args.output.display()))?;
    writer.write_record(["x_value", "y_value", "y_pred"])?;
    for ((x, y), pred) in dataset.x().iter().zip(dataset.y()).zip(&prediction) {
        writer.write_record([x.to_string(), y.to_string(), pred.to_string()])?;
    }
    writer.flush()?;
    info!("=> 予測値を '{}' に保存しました。", args.output.display());

    if !args.no_plot {
        let path = plot::images_dir()?.join("inference.png");
        match plot::plot_comparison(&path, &dataset, &prediction) {
            Ok(()) => info!("=> 比較グラフを '{}' に保存しました。", path.display()),
            Err(e) => warn!("グラフの描画に失敗しました: {}", e),
        }
    }

    Ok(())
}
