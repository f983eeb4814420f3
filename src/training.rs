use crate::checkpoint::{self, CheckpointMeta};
use crate::cli::TrainArgs;
use crate::dataset::{Batch, ReferenceDataset};
use crate::equation::{Airy, Equation, ProblemConfig};
use crate::inference::{TensorDataError, predict, tensor_values};
use crate::metrics;
use crate::model::{Model, ModelConfig};
use crate::pinn::{LossError, PhysicsInformedLoss, PhysicsLoss};
use crate::plot;
use anyhow::anyhow;
use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Instant;
use tracing::{debug, info, warn};

/// 損失が NaN/Inf になったときの扱い。
#[derive(Config, Debug, PartialEq)]
pub enum NonFiniteLossPolicy {
    /// 警告を出して学習を続けます
    Warn,
    /// [`TrainingError::NonFiniteLoss`] で学習を打ち切ります
    Abort,
}

/// 学習の設定。
#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub problem: ProblemConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// `lr_step_epochs` エポックごとに学習率に掛ける係数
    #[config(default = 0.95)]
    pub lr_decay: f64,
    #[config(default = 5)]
    pub lr_step_epochs: usize,
    /// 境界条件の項の重み λ
    #[config(default = 1.0)]
    pub boundary_weight: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = true)]
    pub shuffle: bool,
    /// 何バッチごとに進捗を更新するか
    #[config(default = 5)]
    pub log_interval: usize,
    #[config(default = "NonFiniteLossPolicy::Warn")]
    pub non_finite: NonFiniteLossPolicy,
    #[config(default = true)]
    pub progress: bool,
}

/// 学習中のエラー。
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error(transparent)]
    Loss(#[from] LossError),
    #[error("エポック {epoch} のバッチ {batch} で損失が有限値ではなくなりました（{value}）")]
    NonFiniteLoss { epoch: usize, batch: usize, value: f32 },
    #[error("学習データが空です")]
    EmptyDataset,
    #[error(transparent)]
    TensorData(#[from] TensorDataError),
}

/// 一定エポックごとに学習率を `gamma` 倍するスケジューラ。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLr {
    initial: f64,
    gamma: f64,
    step_size: usize,
    epoch: usize,
}

impl StepLr {
    pub fn new(initial: f64, gamma: f64, step_size: usize) -> Self {
        Self {
            initial,
            gamma,
            step_size,
            epoch: 0,
        }
    }

    /// `epoch` エポック終了済みの状態から始めます。
    pub fn starting_at(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    /// 現在のエポックで使う学習率。
    pub fn learning_rate(&self) -> f64 {
        if self.step_size == 0 {
            return self.initial;
        }
        self.initial * self.gamma.powi((self.epoch / self.step_size) as i32)
    }

    /// 1エポック分進め、次のエポックの学習率を返します。
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.learning_rate()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchMetrics {
    loss: f32,
    equation: f32,
    boundary: f32,
    accuracy: f64,
}

/// サンプル数で重み付けした平均を取るための累積器。
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    loss: f64,
    equation: f64,
    boundary: f64,
    accuracy: f64,
    samples: usize,
}

impl Accumulator {
    fn add(&mut self, metrics: &BatchMetrics, samples: usize) {
        let weight = samples as f64;
        self.loss += metrics.loss as f64 * weight;
        self.equation += metrics.equation as f64 * weight;
        self.boundary += metrics.boundary as f64 * weight;
        self.accuracy += metrics.accuracy * weight;
        self.samples += samples;
    }

    fn summary(&self) -> Evaluation {
        let n = self.samples.max(1) as f64;
        Evaluation {
            loss: self.loss / n,
            equation: self.equation / n,
            boundary: self.boundary / n,
            accuracy: self.accuracy / n,
        }
    }
}

/// データセット全体での損失と精度。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub equation: f64,
    pub boundary: f64,
    /// `1 - MAPE(y_numerical, y_pred)`
    pub accuracy: f64,
}

/// 1エポック分の結果。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// 1始まりの通算エポック番号
    pub epoch: usize,
    pub learning_rate: f64,
    pub metrics: Evaluation,
    pub non_finite_batches: usize,
}

/// 学習全体の記録。
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
}

impl TrainingReport {
    pub fn losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|epoch| epoch.metrics.loss).collect()
    }

    pub fn non_finite_batches(&self) -> usize {
        self.epochs.iter().map(|epoch| epoch.non_finite_batches).sum()
    }

    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }
}

/// エポック × ミニバッチで PINN を学習します。
///
/// パラメータを書き換えるのはこの構造体だけで、バッチは1つずつ順番に処理します。
pub struct Trainer<B: AutodiffBackend, O, E = Airy> {
    model: Model<B>,
    optim: O,
    loss: PhysicsInformedLoss<E>,
    scheduler: StepLr,
    config: TrainingConfig,
    rng: StdRng,
    device: B::Device,
}

impl<B, O, E> Trainer<B, O, E>
where
    B: AutodiffBackend,
    O: Optimizer<Model<B>, B>,
    E: Equation,
{
    pub fn new(model: Model<B>, optim: O, equation: E, config: TrainingConfig, device: B::Device) -> Self {
        let loss = PhysicsInformedLoss::new(equation, config.problem.clone(), config.boundary_weight);
        let scheduler = StepLr::new(config.learning_rate, config.lr_decay, config.lr_step_epochs);
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            model,
            optim,
            loss,
            scheduler,
            config,
            rng,
            device,
        }
    }

    /// チェックポイントから再開するとき、完了済みのエポック数を引き継ぎます。
    pub fn resume_from(mut self, epochs_completed: usize) -> Self {
        self.scheduler = self.scheduler.starting_at(epochs_completed);
        self.rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epochs_completed as u64));
        self
    }

    pub fn model(&self) -> &Model<B> {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optim
    }

    pub fn into_parts(self) -> (Model<B>, O) {
        (self.model, self.optim)
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.learning_rate()
    }

    pub fn epochs_completed(&self) -> usize {
        self.scheduler.epoch()
    }

    /// 設定されたエポック数だけ学習します。
    ///
    /// エポック数やバッチサイズが 0 の場合は何もせず空の記録を返します。
    pub fn fit(&mut self, dataset: &ReferenceDataset) -> Result<TrainingReport, TrainingError> {
        let mut report = TrainingReport::default();
        if self.config.num_epochs == 0 || self.config.batch_size == 0 {
            warn!(
                "エポック数 {} / バッチサイズ {} のため学習を行いません",
                self.config.num_epochs, self.config.batch_size
            );
            return Ok(report);
        }
        if dataset.is_empty() {
            return Err(TrainingError::EmptyDataset);
        }

        info!(
            "学習を開始します: {} エポック, {} 点, バッチサイズ {}, パラメータ数 {}",
            self.config.num_epochs,
            dataset.len(),
            self.config.batch_size,
            self.model.num_params()
        );
        for _ in 0..self.config.num_epochs {
            report.epochs.push(self.train_epoch(dataset)?);
        }
        Ok(report)
    }

    /// 1エポック分学習し、最後に学習率スケジューラを1つ進めます。
    pub fn train_epoch(&mut self, dataset: &ReferenceDataset) -> Result<EpochSummary, TrainingError> {
        let epoch = self.scheduler.epoch() + 1;
        let learning_rate = self.scheduler.learning_rate();
        let batch_size = self.config.batch_size.max(1);
        let batches = if self.config.shuffle {
            dataset.batches(batch_size, Some(&mut self.rng))
        } else {
            dataset.batches::<StdRng>(batch_size, None)
        };

        let progress = self.progress_bar(batches.len(), epoch);
        let mut totals = Accumulator::default();
        let mut non_finite_batches = 0;
        for (index, batch) in batches.iter().enumerate() {
            let metrics = self.train_batch(batch, learning_rate, epoch, index)?;
            if !metrics.loss.is_finite() {
                non_finite_batches += 1;
            }
            totals.add(&metrics, batch.len());

            if index % self.config.log_interval.max(1) == 0 {
                progress.set_message(format!(
                    "loss={:.4e} acc={:.4} lr={:.3e}",
                    metrics.loss, metrics.accuracy, learning_rate
                ));
                debug!(
                    "[Epoch {} Batch {}] loss: {:.6e}, equation: {:.6e}, boundary: {:.6e}, acc: {:.4}",
                    epoch, index, metrics.loss, metrics.equation, metrics.boundary, metrics.accuracy
                );
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        self.scheduler.step();

        let summary = EpochSummary {
            epoch,
            learning_rate,
            metrics: totals.summary(),
            non_finite_batches,
        };
        info!(
            "[Epoch {}] Loss: {:.6e} (equation {:.6e}, boundary {:.6e}), Accuracy: {:.4}, LR: {:.3e}",
            epoch,
            summary.metrics.loss,
            summary.metrics.equation,
            summary.metrics.boundary,
            summary.metrics.accuracy,
            learning_rate
        );
        Ok(summary)
    }

    /// 1バッチ分の順伝播・逆伝播・最適化を行います。
    ///
    /// 勾配は `backward()` ごとに新しく作られるので、前のステップの勾配を
    /// 明示的に消す必要はありません。
    fn train_batch(
        &mut self,
        batch: &Batch,
        learning_rate: f64,
        epoch: usize,
        index: usize,
    ) -> Result<BatchMetrics, TrainingError> {
        let x = self.input(&batch.x);
        let PhysicsLoss {
            total,
            equation,
            boundary,
            prediction,
        } = self.loss.forward(&self.model, x)?;

        let metrics = BatchMetrics {
            loss: scalar(total.clone()),
            equation: scalar(equation),
            boundary: scalar(boundary),
            accuracy: metrics::accuracy(&batch.y, &tensor_values(prediction)?),
        };
        if !metrics.loss.is_finite() {
            match self.config.non_finite {
                NonFiniteLossPolicy::Abort => {
                    return Err(TrainingError::NonFiniteLoss {
                        epoch,
                        batch: index,
                        value: metrics.loss,
                    });
                }
                NonFiniteLossPolicy::Warn => {
                    warn!(
                        "エポック {} のバッチ {} で損失が有限値ではありません: {}",
                        epoch, index, metrics.loss
                    );
                }
            }
        }

        let grads = GradientsParams::from_grads(total.backward(), &self.model);
        self.model = self.optim.step(learning_rate, self.model.clone(), grads);
        Ok(metrics)
    }

    /// パラメータを変えずにデータセット全体の損失と精度を計算します。
    pub fn evaluate(&self, dataset: &ReferenceDataset) -> Result<Evaluation, TrainingError> {
        if dataset.is_empty() {
            return Err(TrainingError::EmptyDataset);
        }
        let mut totals = Accumulator::default();
        for batch in dataset.batches::<StdRng>(self.config.batch_size.max(1), None) {
            let parts = self.loss.forward(&self.model, self.input(&batch.x))?;
            let metrics = BatchMetrics {
                loss: scalar(parts.total),
                equation: scalar(parts.equation),
                boundary: scalar(parts.boundary),
                accuracy: metrics::accuracy(&batch.y, &tensor_values(parts.prediction)?),
            };
            totals.add(&metrics, batch.len());
        }
        Ok(totals.summary())
    }

    fn input(&self, values: &[f32]) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(values, &self.device)
            .reshape([values.len(), 1])
            .require_grad()
    }

    fn progress_bar(&self, batches: usize, epoch: usize) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(batches as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("Epoch [{prefix}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(format!("{epoch}"));
        bar
    }
}

fn scalar<B: burn::prelude::Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

/// `train`サブコマンドを実行します。
pub fn run<B: AutodiffBackend>(args: &TrainArgs, device: B::Device) -> anyhow::Result<()> {
    let dataset = ReferenceDataset::load_csv(&args.data)?;
    info!(
        "参照データを '{}' から読み込みました（{} 点）",
        args.data.display(),
        dataset.len()
    );

    let (config, epochs_completed) = match &args.resume {
        Some(dir) => {
            let meta = checkpoint::load_meta(dir)?;
            info!(
                "チェックポイント '{}' から再開します（完了済み {} エポック）",
                dir.display(),
                meta.epochs_completed
            );
            (args.apply(meta.training, true), meta.epochs_completed)
        }
        None => {
            let base = match &args.config {
                Some(path) => TrainingConfig::load(path).map_err(|err| {
                    anyhow!("設定ファイル '{}' を読み込めません: {err:?}", path.display())
                })?,
                None => TrainingConfig::new(ModelConfig::new(), ProblemConfig::airy()),
            };
            (args.apply(base, false), 0)
        }
    };

    B::seed(config.seed);
    let model = match &args.resume {
        Some(dir) => checkpoint::load_model::<B>(dir, &config.model, &device)?,
        None => config.model.init::<B>(&device)?,
    };
    let optim = config.optimizer.init::<B, Model<B>>();
    let optim = match &args.resume {
        Some(dir) => checkpoint::load_optimizer::<B, _>(dir, optim, &device)?,
        None => optim,
    };

    let mut trainer =
        Trainer::new(model, optim, Airy, config.clone(), device.clone()).resume_from(epochs_completed);

    let before = trainer.evaluate(&dataset)?;
    let training_start = Instant::now();
    let report = trainer.fit(&dataset)?;
    let training_duration = training_start.elapsed();
    let after = trainer.evaluate(&dataset)?;
    info!("学習が完了しました。=> 学習時間: {:.2?}", training_duration);
    info!(
        "損失: {:.6e} -> {:.6e}, 精度: {:.4} -> {:.4}",
        before.loss, after.loss, before.accuracy, after.accuracy
    );
    if report.non_finite_batches() > 0 {
        warn!("有限値でない損失が {} バッチで発生しました", report.non_finite_batches());
    }

    let meta = CheckpointMeta::new(config, trainer.epochs_completed());
    checkpoint::save(&args.checkpoint, trainer.model(), trainer.optimizer(), &meta)?;
    info!("=> チェックポイントを '{}' に保存しました。", args.checkpoint.display());

    if !args.no_plot {
        let images = plot::images_dir()?;
        let loss_path = images.join("loss_history.png");
        match plot::plot_loss_history(&loss_path, &report) {
            Ok(()) => info!("=> 損失グラフを '{}' に保存しました。", loss_path.display()),
            Err(e) => warn!("損失グラフの描画に失敗しました: {}", e),
        }

        let model = trainer.model().valid();
        let prediction = predict(&model, dataset.x(), &device)?;
        let comparison_path = images.join("pinn_vs_numerical.png");
        match plot::plot_comparison(&comparison_path, &dataset, &prediction) {
            Ok(()) => info!("=> 比較グラフを '{}' に保存しました。", comparison_path.display()),
            Err(e) => warn!("比較グラフの描画に失敗しました: {}", e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::prelude::Backend;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn dataset(points: usize) -> ReferenceDataset {
        let (start, end) = (-6.0, 2.0);
        let x: Vec<f64> = (0..points)
            .map(|i| start + (end - start) * i as f64 / (points - 1) as f64)
            .collect();
        let y = x.iter().map(|&x| Airy::series(x).0).collect();
        ReferenceDataset::from_columns(x, y).unwrap()
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new(
            ModelConfig::new().with_hidden_sizes(vec![16, 16]),
            ProblemConfig::airy(),
        )
        .with_batch_size(32)
        .with_learning_rate(5e-3)
        .with_progress(false)
    }

    fn trainer(
        config: TrainingConfig,
    ) -> Trainer<TestBackend, impl Optimizer<Model<TestBackend>, TestBackend>> {
        let device = Default::default();
        TestBackend::seed(config.seed);
        let model = config.model.init::<TestBackend>(&device).unwrap();
        let optim = config.optimizer.init::<TestBackend, Model<TestBackend>>();
        Trainer::new(model, optim, Airy, config, device)
    }

    #[test]
    fn step_schedule_decays_every_five_epochs() {
        let mut scheduler = StepLr::new(1e-3, 0.95, 5);
        for k in 0..4 {
            let expected = 1e-3 * 0.95f64.powi(k);
            for _ in 0..5 {
                assert!((scheduler.learning_rate() - expected).abs() < 1e-15);
                scheduler.step();
            }
        }
        assert_eq!(scheduler.epoch(), 20);
        assert!((scheduler.learning_rate() - 1e-3 * 0.95f64.powi(4)).abs() < 1e-15);
    }

    #[test]
    fn resumed_schedule_continues_the_decay() {
        let scheduler = StepLr::new(0.1, 0.5, 5).starting_at(10);
        assert!((scheduler.learning_rate() - 0.025).abs() < 1e-15);
    }

    #[test]
    fn loss_decreases_after_training() {
        let data = dataset(64);
        let mut trainer = trainer(config().with_num_epochs(25));
        let before = trainer.evaluate(&data).unwrap();
        let report = trainer.fit(&data).unwrap();
        let after = trainer.evaluate(&data).unwrap();

        assert_eq!(report.epochs.len(), 25);
        assert_eq!(trainer.epochs_completed(), 25);
        assert!(after.loss.is_finite());
        assert!(
            after.loss < before.loss,
            "loss did not decrease: {} -> {}",
            before.loss,
            after.loss
        );
    }

    #[test]
    fn learning_rate_follows_the_schedule_during_fit() {
        let data = dataset(16);
        let mut trainer = trainer(config().with_num_epochs(10).with_batch_size(16));
        let report = trainer.fit(&data).unwrap();
        assert!((report.epochs[4].learning_rate - 5e-3).abs() < 1e-15);
        assert!((report.epochs[5].learning_rate - 5e-3 * 0.95).abs() < 1e-15);
        assert!((trainer.learning_rate() - 5e-3 * 0.95 * 0.95).abs() < 1e-15);
    }

    #[test]
    fn zero_epochs_is_a_no_op() {
        let data = dataset(16);
        let mut trainer = trainer(config().with_num_epochs(0));
        let before = trainer.evaluate(&data).unwrap();
        let report = trainer.fit(&data).unwrap();
        let after = trainer.evaluate(&data).unwrap();
        assert!(report.epochs.is_empty());
        assert_eq!(trainer.epochs_completed(), 0);
        assert_eq!(before, after);
    }

    #[test]
    fn non_finite_loss_aborts_when_requested() {
        let data = dataset(32);
        let mut trainer = trainer(
            config()
                .with_num_epochs(2)
                .with_batch_size(8)
                .with_learning_rate(f64::NAN)
                .with_non_finite(NonFiniteLossPolicy::Abort),
        );
        let error = trainer.fit(&data).unwrap_err();
        assert!(matches!(
            error,
            TrainingError::NonFiniteLoss {
                epoch: 1,
                batch: 1,
                ..
            }
        ));
    }

    #[test]
    fn non_finite_loss_is_counted_when_warning() {
        let data = dataset(32);
        let mut trainer = trainer(
            config()
                .with_num_epochs(1)
                .with_batch_size(8)
                .with_learning_rate(f64::NAN),
        );
        let report = trainer.fit(&data).unwrap();
        assert_eq!(report.non_finite_batches(), 3);
    }
}
