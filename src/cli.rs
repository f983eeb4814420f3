use crate::device::BackendChoice;
use crate::model::Activation;
use crate::training::{NonFiniteLossPolicy, TrainingConfig};
use crate::{CHECKPOINT_DIR, DATASET_PATH, PREDICTIONS_PATH};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{Level, warn};

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Airy equation y'' = x·y: RK45 reference solution and a PINN trained with Burn", long_about = None)]
pub struct Cli {
    /// ログの詳細度（error, warn, info, debug, trace）
    #[arg(long, global = true, default_value = "info")]
    pub log_level: Level,
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（solve, train, infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 数値解法で参照データを作り、CSV とグラフに保存します
    Solve(SolveArgs),
    /// PINNモデルを学習し、結果をファイルに保存します
    Train(TrainArgs),
    /// 保存されたPINNモデルを使い、推論を実行します
    Infer(InferArgs),
}

#[derive(Args, Debug)]
pub struct SolveArgs {
    /// サンプル数の目安 N（最大刻み幅は |b - a| / N）
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub samples: usize,
    #[arg(short, long, default_value = DATASET_PATH)]
    pub output: PathBuf,
    /// 定義域の左端 a
    #[arg(long, default_value_t = -10.0, allow_negative_numbers = true)]
    pub domain_start: f64,
    /// 定義域の右端 b
    #[arg(long, default_value_t = 3.0, allow_negative_numbers = true)]
    pub domain_end: f64,
    #[arg(long, default_value_t = 1e-3)]
    pub rtol: f64,
    #[arg(long, default_value_t = 1e-6)]
    pub atol: f64,
    /// グラフを描画しない
    #[arg(long)]
    pub no_plot: bool,
}

/// 隠れ層（2層目以降）の活性化関数。
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationArg {
    Tanh,
    Sin,
}

impl From<ActivationArg> for Activation {
    fn from(arg: ActivationArg) -> Self {
        match arg {
            ActivationArg::Tanh => Activation::Tanh,
            ActivationArg::Sin => Activation::Sine,
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// 参照データの CSV
    #[arg(short, long, default_value = DATASET_PATH)]
    pub data: PathBuf,
    /// チェックポイントの保存先ディレクトリ
    #[arg(short, long, default_value = CHECKPOINT_DIR)]
    pub checkpoint: PathBuf,
    /// 学習設定の JSON（省略時は既定値）
    #[arg(long, conflicts_with = "resume")]
    pub config: Option<PathBuf>,
    /// このチェックポイントから学習を再開する
    #[arg(long)]
    pub resume: Option<PathBuf>,
    #[arg(short, long)]
    pub epochs: Option<usize>,
    #[arg(short, long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub lr_decay: Option<f64>,
    #[arg(long)]
    pub lr_step_epochs: Option<usize>,
    /// 境界条件の項の重み λ
    #[arg(long)]
    pub boundary_weight: Option<f64>,
    /// 隠れ層の幅（例: 32,32,32）
    #[arg(long, value_delimiter = ',')]
    pub hidden: Option<Vec<usize>>,
    #[arg(long, value_enum)]
    pub activation: Option<ActivationArg>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// 損失が NaN/Inf になったら学習を打ち切る
    #[arg(long)]
    pub abort_on_non_finite: bool,
    /// 進捗バーを表示しない
    #[arg(long)]
    pub no_progress: bool,
    /// グラフを描画しない
    #[arg(long)]
    pub no_plot: bool,
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto)]
    pub backend: BackendChoice,
}

impl TrainArgs {
    /// コマンドラインで指定された値で設定を上書きします。
    ///
    /// 再開時はネットワーク構成を変えられないので、`--hidden` と
    /// `--activation` は無視します。
    pub fn apply(&self, mut config: TrainingConfig, resuming: bool) -> TrainingConfig {
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(lr_decay) = self.lr_decay {
            config.lr_decay = lr_decay;
        }
        if let Some(lr_step_epochs) = self.lr_step_epochs {
            config.lr_step_epochs = lr_step_epochs;
        }
        if let Some(boundary_weight) = self.boundary_weight {
            config.boundary_weight = boundary_weight;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        if resuming {
            if self.hidden.is_some() || self.activation.is_some() {
                warn!("学習の再開時はネットワーク構成を変更できないため --hidden / --activation を無視します");
            }
        } else {
            if let Some(hidden) = &self.hidden {
                config.model.hidden_sizes = hidden.clone();
            }
            if let Some(activation) = self.activation {
                config.model.activation = activation.into();
            }
        }

        if self.abort_on_non_finite {
            config.non_finite = NonFiniteLossPolicy::Abort;
        }
        if self.no_progress {
            config.progress = false;
        }
        config
    }
}

#[derive(Args, Debug)]
pub struct InferArgs {
    /// 予測する x を含む参照データの CSV
    #[arg(short, long, default_value = DATASET_PATH)]
    pub data: PathBuf,
    #[arg(short, long, default_value = CHECKPOINT_DIR)]
    pub checkpoint: PathBuf,
    /// 予測値の CSV の保存先
    #[arg(short, long, default_value = PREDICTIONS_PATH)]
    pub output: PathBuf,
    /// グラフを描画しない
    #[arg(long)]
    pub no_plot: bool,
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto)]
    pub backend: BackendChoice,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::ProblemConfig;
    use crate::model::ModelConfig;
    use clap::CommandFactory;

    fn train_args(args: &[&str]) -> TrainArgs {
        let cli = Cli::try_parse_from(std::iter::once("airy-pinn").chain(args.iter().copied())).unwrap();
        match cli.command {
            Commands::Train(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn defaults() -> TrainingConfig {
        TrainingConfig::new(ModelConfig::new(), ProblemConfig::airy())
    }

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_are_applied() {
        let args = train_args(&[
            "train",
            "--epochs",
            "3",
            "--hidden",
            "8,4",
            "--activation",
            "sin",
            "--abort-on-non-finite",
            "--no-progress",
        ]);
        let config = args.apply(defaults(), false);
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.model.hidden_sizes, vec![8, 4]);
        assert_eq!(config.model.activation, Activation::Sine);
        assert_eq!(config.non_finite, NonFiniteLossPolicy::Abort);
        assert!(!config.progress);
        assert_eq!(config.batch_size, 64);
    }

    #[test]
    fn architecture_is_kept_when_resuming() {
        let args = train_args(&["train", "--resume", "ckpt", "--hidden", "8"]);
        let config = args.apply(defaults(), true);
        assert_eq!(config.model.hidden_sizes, vec![32, 32, 32]);
    }

    #[test]
    fn negative_domain_bounds_parse() {
        let cli = Cli::try_parse_from(["airy-pinn", "solve", "--domain-start", "-4", "-n", "10"]).unwrap();
        match cli.command {
            Commands::Solve(args) => {
                assert_eq!(args.domain_start, -4.0);
                assert_eq!(args.samples, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
