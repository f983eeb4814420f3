//! Airy 方程式 `y'' = x·y` の定義。
//!
//! 数値解法（[`crate::solver`]）と物理損失（[`crate::pinn`]）の両方が
//! この定義を共有します。

use crate::model::Jet;
use burn::config::Config;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use statrs::function::gamma::gamma;

/// 状態ベクトル `[y, y']`。
pub type State = [f64; 2];

/// 2階常微分方程式を1階の連立系として表したもの。
pub trait Equation {
    /// 点 `x` における状態 `[y, y']` の導関数 `[y', y'']` を返します。
    fn derivatives(&self, x: f64, state: State) -> State;

    /// `u = -x` と置き換えた系の導関数を返します。
    ///
    /// 状態は元の変数 `x` に関する `[y, dy/dx]` のまま保持され、
    /// `d/du = -d/dx` なので両成分の符号が反転します。
    fn mirrored(&self, u: f64, state: State) -> State {
        let [dy, d2y] = self.derivatives(-u, state);
        [-dy, -d2y]
    }

    /// ネットワークの出力とその導関数から方程式の残差を計算します。
    fn residual<B: Backend>(&self, x: Tensor<B, 2>, jet: &Jet<B>) -> Tensor<B, 2>;
}

/// Airy 方程式 `y'' = x·y`。
#[derive(Debug, Clone, Copy, Default)]
pub struct Airy;

impl Equation for Airy {
    fn derivatives(&self, x: f64, [y, dy]: State) -> State {
        [dy, x * y]
    }

    fn residual<B: Backend>(&self, x: Tensor<B, 2>, jet: &Jet<B>) -> Tensor<B, 2> {
        jet.second.clone() - x * jet.value.clone()
    }
}

impl Airy {
    /// `Ai(0) = 1 / (3^(2/3)·Γ(2/3))`
    pub fn origin_value() -> f64 {
        1.0 / (3f64.powf(2.0 / 3.0) * gamma(2.0 / 3.0))
    }

    /// `Ai'(0) = -1 / (3^(1/3)·Γ(1/3))`
    pub fn origin_slope() -> f64 {
        -1.0 / (3f64.powf(1.0 / 3.0) * gamma(1.0 / 3.0))
    }

    /// マクローリン級数で `(Ai(x), Ai'(x))` を評価します。
    ///
    /// 係数は `a_n = a_(n-3) / (n·(n-1))` の漸化式で求まり、級数は全実数で収束します。
    /// `|x| <= 10` 程度までは倍精度で十分な精度が得られます。
    pub fn series(x: f64) -> (f64, f64) {
        const TERMS: usize = 150;
        let mut coeffs = [0.0f64; TERMS];
        coeffs[0] = Self::origin_value();
        coeffs[1] = Self::origin_slope();
        for n in 3..TERMS {
            coeffs[n] = coeffs[n - 3] / (n * (n - 1)) as f64;
        }

        let mut value = 0.0;
        let mut slope = 0.0;
        let mut power = 1.0;
        for (n, &a) in coeffs.iter().enumerate() {
            if n > 0 {
                slope += n as f64 * a * power;
                power *= x;
            }
            value += a * power;
        }
        (value, slope)
    }
}

/// 解く問題の定義域と原点での初期条件。
#[derive(Config, Debug)]
pub struct ProblemConfig {
    /// 定義域の左端 `a`（`a <= 0`）
    pub domain_start: f64,
    /// 定義域の右端 `b`（`b >= 0`）
    pub domain_end: f64,
    /// `y(0)`
    pub initial_value: f64,
    /// `y'(0)`
    pub initial_slope: f64,
}

impl ProblemConfig {
    /// 定義域 `[-10, 3]` の Airy 関数 Ai の問題。
    pub fn airy() -> Self {
        Self::new(-10.0, 3.0, Airy::origin_value(), Airy::origin_slope())
    }

    /// 定義域の長さ `|b - a|`。
    pub fn length(&self) -> f64 {
        (self.domain_end - self.domain_start).abs()
    }

    pub fn initial_state(&self) -> State {
        [self.initial_value, self.initial_slope]
    }
}
