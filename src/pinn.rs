use crate::equation::{Equation, ProblemConfig};
use crate::model::InputDerivatives;
use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 物理損失の計算に失敗したときのエラー。
#[derive(Debug, thiserror::Error)]
pub enum LossError {
    #[error("入力 x に関する勾配が得られません（x に require_grad() を付け忘れていませんか？）")]
    GradientUnavailable,
}

/// 1ステップ分の損失とその内訳。
#[derive(Debug, Clone)]
pub struct PhysicsLoss<B: Backend> {
    /// `equation + λ·boundary`
    pub total: Tensor<B, 1>,
    pub equation: Tensor<B, 1>,
    pub boundary: Tensor<B, 1>,
    /// バッチに対するモデルの予測値 `[batch, 1]`
    pub prediction: Tensor<B, 2>,
}

/// 方程式の残差と原点での境界条件の誤差からなる損失。
#[derive(Debug, Clone)]
pub struct PhysicsInformedLoss<E> {
    equation: E,
    problem: ProblemConfig,
    boundary_weight: f64,
}

impl<E: Equation> PhysicsInformedLoss<E> {
    pub fn new(equation: E, problem: ProblemConfig, boundary_weight: f64) -> Self {
        Self {
            equation,
            problem,
            boundary_weight,
        }
    }

    pub fn boundary_weight(&self) -> f64 {
        self.boundary_weight
    }

    /// 物理損失を計算します。
    ///
    /// `x` は `[batch, 1]` で、微分可能としてマークされている必要があります。
    /// 方程式の残差 `y'' - x·y` の二乗平均に、境界条件の誤差を `λ` 倍して加えます。
    pub fn forward<B, M>(&self, model: &M, x: Tensor<B, 2>) -> Result<PhysicsLoss<B>, LossError>
    where
        B: Backend,
        M: InputDerivatives<B>,
    {
        if !x.is_require_grad() {
            return Err(LossError::GradientUnavailable);
        }
        let device = x.device();

        let jet = model.forward_jet(x.clone());
        let residual = self.equation.residual(x, &jet);
        let equation =
            MseLoss::new().forward(residual.clone(), Tensor::zeros_like(&residual), Reduction::Mean);
        let boundary = self.boundary_residual(model, &device);
        let total = equation.clone() + boundary.clone().mul_scalar(self.boundary_weight);

        Ok(PhysicsLoss {
            total,
            equation,
            boundary,
            prediction: jet.value,
        })
    }

    /// `(y(0) - y0)² + (y'(0) - y0')²` を原点だけの別パスで評価します。
    pub fn boundary_residual<B, M>(&self, model: &M, device: &B::Device) -> Tensor<B, 1>
    where
        B: Backend,
        M: InputDerivatives<B>,
    {
        let origin = Tensor::<B, 2>::zeros([1, 1], device).require_grad();
        let jet = model.forward_jet(origin);
        let value_error = jet.value.sub_scalar(self.problem.initial_value);
        let slope_error = jet.first.sub_scalar(self.problem.initial_slope);
        (value_error.clone() * value_error + slope_error.clone() * slope_error).reshape([1])
    }
}
