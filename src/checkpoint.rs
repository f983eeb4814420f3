//! 学習済みモデル・オプティマイザ状態・設定の保存と読み込み。
//!
//! チェックポイントは1つのディレクトリで、次のファイルを含みます。
//!
//! - `model.mpk`: モデルのパラメータ
//! - `optimizer.mpk`: Adam のモーメント
//! - `checkpoint.json`: 学習設定と完了済みエポック数

use crate::model::{Model, ModelConfig, ModelError};
use crate::training::TrainingConfig;
use burn::config::Config;
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder, RecorderError};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 拡張子はレコーダが付けます
const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const RECORD_EXTENSION: &str = "mpk";
const META_FILE: &str = "checkpoint.json";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// チェックポイントに添える学習の状態。
#[derive(Config)]
pub struct CheckpointMeta {
    pub training: TrainingConfig,
    pub epochs_completed: usize,
}

/// チェックポイントの読み書きのエラー。
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error(
        "'{}' が見つかりません。最初に 'train' コマンドでモデルを学習・保存してください。",
        .path.display()
    )]
    Missing { path: PathBuf },
    #[error("'{}' の読み書きに失敗しました: {source}", .path.display())]
    Recorder {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
    #[error("'{}' の設定を読み込めません: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
    #[error("'{}' に書き込めません: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
}

fn record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name).with_extension(RECORD_EXTENSION)
}

fn recorder_error(path: PathBuf) -> impl FnOnce(RecorderError) -> CheckpointError {
    move |source| CheckpointError::Recorder { path, source }
}

/// モデル・オプティマイザ・メタ情報を `dir` に保存します。
pub fn save<B, O>(
    dir: &Path,
    model: &Model<B>,
    optim: &O,
    meta: &CheckpointMeta,
) -> Result<(), CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    fs::create_dir_all(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let recorder = CheckpointRecorder::new();

    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &recorder)
        .map_err(recorder_error(record_path(dir, MODEL_FILE)))?;
    Recorder::<B>::record(&recorder, optim.to_record(), dir.join(OPTIMIZER_FILE))
        .map_err(recorder_error(record_path(dir, OPTIMIZER_FILE)))?;

    let meta_path = dir.join(META_FILE);
    meta.save(&meta_path).map_err(|source| CheckpointError::Io {
        path: meta_path,
        source,
    })?;
    debug!("チェックポイントを '{}' に書き出しました", dir.display());
    Ok(())
}

/// `checkpoint.json` を読み込みます。
pub fn load_meta(dir: &Path) -> Result<CheckpointMeta, CheckpointError> {
    let path = dir.join(META_FILE);
    if !path.exists() {
        return Err(CheckpointError::Missing { path });
    }
    CheckpointMeta::load(&path).map_err(|err| CheckpointError::Config {
        reason: err.to_string(),
        path,
    })
}

/// `config` の構成でモデルを作り、保存済みのパラメータを読み込みます。
pub fn load_model<B: Backend>(
    dir: &Path,
    config: &ModelConfig,
    device: &B::Device,
) -> Result<Model<B>, CheckpointError> {
    let path = record_path(dir, MODEL_FILE);
    if !path.exists() {
        return Err(CheckpointError::Missing { path });
    }
    config
        .init::<B>(device)?
        .load_file(dir.join(MODEL_FILE), &CheckpointRecorder::new(), device)
        .map_err(recorder_error(path))
}

/// 保存済みのオプティマイザ状態を `optim` に読み込みます。
///
/// 状態ファイルがなければ警告を出し、`optim` をそのまま返します。
pub fn load_optimizer<B, O>(dir: &Path, optim: O, device: &B::Device) -> Result<O, CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
{
    let path = record_path(dir, OPTIMIZER_FILE);
    if !path.exists() {
        warn!(
            "'{}' がないため、オプティマイザの状態は初期化して再開します",
            path.display()
        );
        return Ok(optim);
    }
    let record = Recorder::<B>::load(&CheckpointRecorder::new(), dir.join(OPTIMIZER_FILE), device)
        .map_err(recorder_error(path))?;
    Ok(optim.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::{Airy, ProblemConfig};
    use crate::inference::predict;
    use crate::pinn::PhysicsInformedLoss;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::optim::{AdamConfig, GradientsParams};
    use burn::tensor::Tensor;
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn config() -> TrainingConfig {
        TrainingConfig::new(
            ModelConfig::new().with_hidden_sizes(vec![8, 8]),
            ProblemConfig::airy(),
        )
    }

    #[test]
    fn round_trip_reproduces_predictions() {
        let device = Default::default();
        let config = config();
        let mut model = config.model.init::<TestBackend>(&device).unwrap();
        let mut optim = AdamConfig::new().init();

        // Adam のモーメントが空でない状態にしておく
        let loss = PhysicsInformedLoss::new(Airy, config.problem.clone(), 1.0);
        let x = Tensor::<TestBackend, 1>::from_floats([-2.0, -0.5, 0.5, 1.5], &device)
            .reshape([4, 1])
            .require_grad();
        let parts = loss.forward(&model, x).unwrap();
        let grads = GradientsParams::from_grads(parts.total.backward(), &model);
        model = optim.step(1e-3, model, grads);

        let dir = tempdir().unwrap();
        let meta = CheckpointMeta::new(config.clone(), 3);
        save(dir.path(), &model, &optim, &meta).unwrap();
        assert!(dir.path().join("model.mpk").exists());
        assert!(dir.path().join("optimizer.mpk").exists());
        assert!(dir.path().join("checkpoint.json").exists());

        let loaded_meta = load_meta(dir.path()).unwrap();
        assert_eq!(loaded_meta.epochs_completed, 3);
        assert_eq!(loaded_meta.training.model.hidden_sizes, vec![8, 8]);

        let xs = [-3.0, -1.0, 0.0, 2.5];
        let expected = predict(&model.valid(), &xs, &device).unwrap();
        let restored =
            load_model::<NdArray<f32>>(dir.path(), &loaded_meta.training.model, &device).unwrap();
        let actual = predict(&restored, &xs, &device).unwrap();
        assert_eq!(actual, expected);
    }

    fn adam_step<O: Optimizer<Model<TestBackend>, TestBackend>>(
        model: Model<TestBackend>,
        optim: &mut O,
        device: &<TestBackend as Backend>::Device,
    ) -> Model<TestBackend> {
        let loss = PhysicsInformedLoss::new(Airy, ProblemConfig::airy(), 1.0);
        let x = Tensor::<TestBackend, 1>::from_floats([-4.0, -2.0, -0.5, 0.5, 1.5], device)
            .reshape([5, 1])
            .require_grad();
        let parts = loss.forward(&model, x).unwrap();
        let grads = GradientsParams::from_grads(parts.total.backward(), &model);
        optim.step(1e-2, model, grads)
    }

    #[test]
    fn restored_optimizer_continues_like_the_original() {
        let device = Default::default();
        let config = config();
        let mut model = config.model.init::<TestBackend>(&device).unwrap();
        let mut optim = AdamConfig::new().init::<TestBackend, Model<TestBackend>>();
        for _ in 0..4 {
            model = adam_step(model, &mut optim, &device);
        }

        let dir = tempdir().unwrap();
        save(dir.path(), &model, &optim, &CheckpointMeta::new(config.clone(), 4)).unwrap();

        let restored = load_model::<TestBackend>(dir.path(), &config.model, &device).unwrap();
        let mut restored_optim = load_optimizer::<TestBackend, _>(
            dir.path(),
            AdamConfig::new().init::<TestBackend, Model<TestBackend>>(),
            &device,
        )
        .unwrap();
        let restarted = load_model::<TestBackend>(dir.path(), &config.model, &device).unwrap();
        let mut fresh_optim = AdamConfig::new().init::<TestBackend, Model<TestBackend>>();

        let continued = adam_step(model, &mut optim, &device);
        let resumed = adam_step(restored, &mut restored_optim, &device);
        let restarted = adam_step(restarted, &mut fresh_optim, &device);

        let xs = [-8.0, -3.0, -1.0, 0.0, 1.0, 2.5];
        let expected = predict(&continued.valid(), &xs, &device).unwrap();
        assert_eq!(predict(&resumed.valid(), &xs, &device).unwrap(), expected);
        // モーメントを捨てて再開すると更新量が変わる
        assert_ne!(predict(&restarted.valid(), &xs, &device).unwrap(), expected);
    }

    #[test]
    fn missing_optimizer_state_starts_fresh() {
        let device = Default::default();
        let config = config();
        let model = config.model.init::<TestBackend>(&device).unwrap();
        let optim = AdamConfig::new().init::<TestBackend, Model<TestBackend>>();
        let dir = tempdir().unwrap();
        save(dir.path(), &model, &optim, &CheckpointMeta::new(config, 0)).unwrap();
        fs::remove_file(dir.path().join("optimizer.mpk")).unwrap();

        let resumed = load_optimizer::<TestBackend, _>(
            dir.path(),
            AdamConfig::new().init::<TestBackend, Model<TestBackend>>(),
            &device,
        );
        assert!(resumed.is_ok());
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        assert!(matches!(
            load_meta(dir.path()),
            Err(CheckpointError::Missing { .. })
        ));
        assert!(matches!(
            load_model::<NdArray<f32>>(dir.path(), &ModelConfig::new(), &device),
            Err(CheckpointError::Missing { .. })
        ));
    }
}
