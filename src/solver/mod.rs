//! 参照解となる数値解。
//!
//! 原点 `x = 0` の初期条件から、右側 `[0, b]` はそのまま、左側 `[a, 0]` は
//! `u = -x` と置き換えた系を `[0, -a]` で積分し、2本をつなぎ合わせて
//! `x` が単調増加する1本の軌道にします。

pub use ode_solvers::dop_shared::IntegrationError;

use crate::cli::SolveArgs;
use crate::dataset::ReferenceDataset;
use crate::equation::{Airy, Equation, ProblemConfig, State};
use crate::plot;
use anyhow::Context;
use burn::config::Config;
use ode_solvers::dop_shared::OutputType;
use ode_solvers::{Dopri5, SVector, System};
use std::fmt;
use std::fs;
use std::time::Instant;
use tracing::{debug, info, warn};

type Vector2 = SVector<f64, 2>;

// Dormand–Prince の標準的な刻み幅制御パラメータ
const SAFETY_FACTOR: f64 = 0.9;
const BETA: f64 = 0.04;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const MAX_STEPS: u32 = 100_000;
const STIFFNESS_CHECKS: u32 = 1000;

/// 適応刻み幅の許容誤差。
#[derive(Config, Debug)]
pub struct SolverConfig {
    #[config(default = 1e-3)]
    pub rtol: f64,
    #[config(default = 1e-6)]
    pub atol: f64,
}

/// 原点から積分する向き。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// `[0, b]`
    Forward,
    /// `u = -x` で `[0, -a]`
    Mirrored,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Forward => write!(f, "正方向"),
            Branch::Mirrored => write!(f, "反転方向"),
        }
    }
}

/// 数値解の計算に失敗したときのエラー。
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("サンプル数は 1 以上である必要があります（指定値: {0}）")]
    InvalidSampleCount(usize),
    #[error("定義域の長さが 0 です")]
    EmptyDomain,
    #[error("原点 x = 0 が定義域 [{start}, {end}] に含まれていません")]
    OriginOutsideDomain { start: f64, end: f64 },
    #[error("{branch}の積分に失敗しました: {source}")]
    Integration {
        branch: Branch,
        #[source]
        source: IntegrationError,
    },
    #[error("{branch}の積分中に状態が有限でなくなりました（x = {x}）")]
    NonFiniteState { branch: Branch, x: f64 },
}

/// 数値解の軌道。`x` は狭義単調増加です。
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// 各点での `y'`（CSV には保存しません）
    pub dy: Vec<f64>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// `x = 0` のサンプルの `(y, y')`。
    pub fn at_origin(&self) -> Option<(f64, f64)> {
        self.x
            .iter()
            .position(|&x| x == 0.0)
            .map(|i| (self.y[i], self.dy[i]))
    }

    pub fn into_dataset(self) -> ReferenceDataset {
        ReferenceDataset::from_sorted(self.x, self.y)
    }
}

/// 定義域全体の数値解を求めます。
///
/// 最大刻み幅は `|b - a| / samples` で、滑らかな領域ではおよそ `samples` 点になります。
pub fn solve_reference<E: Equation>(
    equation: &E,
    problem: &ProblemConfig,
    samples: usize,
    config: &SolverConfig,
) -> Result<Trajectory, SolverError> {
    if samples == 0 {
        return Err(SolverError::InvalidSampleCount(samples));
    }
    let length = problem.length();
    if length == 0.0 {
        return Err(SolverError::EmptyDomain);
    }
    let start = problem.domain_start.min(problem.domain_end);
    let end = problem.domain_start.max(problem.domain_end);
    if start > 0.0 || end < 0.0 {
        return Err(SolverError::OriginOutsideDomain { start, end });
    }

    let max_step = length / samples as f64;
    let initial = problem.initial_state();
    let forward = integrate_branch(equation, Branch::Forward, initial, end, max_step, config)?;
    let mirrored = integrate_branch(equation, Branch::Mirrored, initial, -start, max_step, config)?;

    // 反転側の原点は正方向側と重複するので捨てる
    let total = forward.t.len() + mirrored.t.len() - 1;
    let mut trajectory = Trajectory {
        x: Vec::with_capacity(total),
        y: Vec::with_capacity(total),
        dy: Vec::with_capacity(total),
    };
    for (u, [y, dy]) in mirrored.t.iter().zip(&mirrored.y).skip(1).rev() {
        trajectory.x.push(-u);
        trajectory.y.push(*y);
        trajectory.dy.push(*dy);
    }
    for (x, [y, dy]) in forward.t.iter().zip(&forward.y) {
        trajectory.x.push(*x);
        trajectory.y.push(*y);
        trajectory.dy.push(*dy);
    }

    Ok(trajectory)
}

/// 1本の枝を `ode_solvers` に渡すための系。
struct BranchSystem<'a, E> {
    equation: &'a E,
    branch: Branch,
}

impl<E: Equation> System<f64, Vector2> for BranchSystem<'_, E> {
    fn system(&self, t: f64, y: &Vector2, dy: &mut Vector2) {
        let state = [y[0], y[1]];
        let [first, second] = match self.branch {
            Branch::Forward => self.equation.derivatives(t, state),
            Branch::Mirrored => self.equation.mirrored(t, state),
        };
        dy[0] = first;
        dy[1] = second;
    }
}

/// 原点から `t_end` までの1本の枝。`t` は 0 から始まり狭義単調増加です。
struct BranchSolution {
    t: Vec<f64>,
    y: Vec<State>,
}

/// `[0, t_end]` を Dopri5 で積分し、受理されたステップをすべて返します。
fn integrate_branch<E: Equation>(
    equation: &E,
    branch: Branch,
    initial: State,
    t_end: f64,
    max_step: f64,
    config: &SolverConfig,
) -> Result<BranchSolution, SolverError> {
    let mut solution = BranchSolution {
        t: vec![0.0],
        y: vec![initial],
    };
    if t_end == 0.0 {
        return Ok(solution);
    }

    let system = BranchSystem { equation, branch };
    let mut stepper = Dopri5::from_param(
        system,
        0.0,
        t_end,
        max_step,
        Vector2::new(initial[0], initial[1]),
        config.rtol,
        config.atol,
        SAFETY_FACTOR,
        BETA,
        MIN_FACTOR,
        MAX_FACTOR,
        max_step,
        0.0,
        MAX_STEPS,
        STIFFNESS_CHECKS,
        OutputType::Sparse,
    );
    let stats = stepper
        .integrate()
        .map_err(|source| SolverError::Integration { branch, source })?;
    debug!(
        "{}: 受理 {} / 棄却 {} ステップ, 関数評価 {} 回, 最大刻み幅 {:.3e}",
        branch, stats.accepted_steps, stats.rejected_steps, stats.num_eval, max_step
    );

    for (&t, y) in stepper.x_out().iter().zip(stepper.y_out()) {
        // 出力に初期点が含まれる場合の重複を除く
        if t <= solution.t[solution.t.len() - 1] {
            continue;
        }
        if !(y[0].is_finite() && y[1].is_finite()) {
            let x = match branch {
                Branch::Forward => t,
                Branch::Mirrored => -t,
            };
            return Err(SolverError::NonFiniteState { branch, x });
        }
        solution.t.push(t);
        solution.y.push([y[0], y[1]]);
    }
    // 最終ステップは `t_end - t` で決まるので丸め誤差を落として端点に揃える
    if let Some(last) = solution.t.last_mut() {
        *last = t_end;
    }
    Ok(solution)
}

/// `solve`サブコマンドを実行します。
pub fn run(args: &SolveArgs) -> anyhow::Result<()> {
    let problem = ProblemConfig::new(
        args.domain_start,
        args.domain_end,
        Airy::origin_value(),
        Airy::origin_slope(),
    );
    let config = SolverConfig::new().with_rtol(args.rtol).with_atol(args.atol);

    info!(
        "数値解を計算します: 定義域 [{}, {}], N = {}",
        problem.domain_start, problem.domain_end, args.samples
    );
    let start = Instant::now();
    let trajectory = solve_reference(&Airy, &problem, args.samples, &config)?;
    info!(
        "計算が完了しました。点数: {}, 計算時間: {:.2?}",
        trajectory.len(),
        start.elapsed()
    );

    let dataset = trajectory.into_dataset();
    if let Some(parent) = args.output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("'{}' を作成できません", parent.display()))?;
    }
    dataset.save_csv(&args.output)?;
    info!("=> 参照データを '{}' に保存しました。", args.output.display());

    if !args.no_plot {
        let path = plot::images_dir()?.join("numerical_solution.png");
        match plot::plot_trajectory(&path, &dataset) {
            Ok(()) => info!("=> グラフを '{}' に保存しました。", path.display()),
            Err(e) => warn!("グラフの描画に失敗しました: {}", e),
        }
    }
    Ok(())
}
