use crate::pinn::LossError;
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::backend::AutodiffBackend;

/// 隠れ層の活性化関数。
#[derive(Config, Debug, PartialEq)]
pub enum Activation {
    Sine,
    Tanh,
}

impl Activation {
    fn forward<B: Backend>(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Activation::Sine => z.sin(),
            Activation::Tanh => z.tanh(),
        }
    }

    /// 連鎖律で値と1階・2階導関数を同時に伝播します。
    ///
    /// `a = σ(z)` に対して `a' = σ'(z)·z'`、`a'' = σ'(z)·z'' + σ''(z)·z'²`。
    fn forward_jet<B: Backend>(&self, jet: Jet<B>) -> Jet<B> {
        let Jet {
            value,
            first,
            second,
        } = jet;
        let first_sq = first.clone() * first.clone();
        match self {
            Activation::Sine => {
                let s = value.clone().sin();
                let c = value.cos();
                Jet {
                    first: c.clone() * first,
                    second: c * second - s.clone() * first_sq,
                    value: s,
                }
            }
            Activation::Tanh => {
                let t = value.tanh();
                // tanh' = 1 - tanh², tanh'' = -2·tanh·tanh'
                let dt = (t.clone() * t.clone()).neg().add_scalar(1.0);
                let d2t = (t.clone() * dt.clone()).mul_scalar(-2.0);
                Jet {
                    first: dt.clone() * first,
                    second: dt * second + d2t * first_sq,
                    value: t,
                }
            }
        }
    }
}

/// ネットワーク出力の値と、入力 `x` に関する1階・2階導関数。
///
/// すべて `[batch, 1]` 形状で、計算グラフ上に残るのでパラメータの勾配が
/// 導関数を通して流れます。
#[derive(Debug, Clone)]
pub struct Jet<B: Backend> {
    pub value: Tensor<B, 2>,
    pub first: Tensor<B, 2>,
    pub second: Tensor<B, 2>,
}

impl<B: Backend> Jet<B> {
    /// 独立変数 `x` 自身（`dx/dx = 1`、`d²x/dx² = 0`）。
    pub fn variable(x: Tensor<B, 2>) -> Self {
        Self {
            first: Tensor::ones_like(&x),
            second: Tensor::zeros_like(&x),
            value: x,
        }
    }
}

/// 入力に関して少なくとも2階まで微分できるモデル。
pub trait InputDerivatives<B: Backend> {
    fn forward_jet(&self, x: Tensor<B, 2>) -> Jet<B>;
}

/// ネットワーク構成の誤り。
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("隠れ層が1つもありません（少なくとも1層の sin 層が必要です）")]
    NoHiddenLayers,
    #[error("隠れ層 {layer} の幅が 0 です")]
    ZeroWidth { layer: usize },
}

/// ネットワーク構成。
///
/// 最初の隠れ層は常に `sin` を使い、2層目以降は `activation` を使います。
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "vec![32, 32, 32]")]
    pub hidden_sizes: Vec<usize>,
    #[config(default = "Activation::Tanh")]
    pub activation: Activation,
}

impl ModelConfig {
    /// 新しいモデルを初期化します。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Model<B>, ModelError> {
        if self.hidden_sizes.is_empty() {
            return Err(ModelError::NoHiddenLayers);
        }
        if let Some(layer) = self.hidden_sizes.iter().position(|&width| width == 0) {
            return Err(ModelError::ZeroWidth { layer });
        }

        let mut linears = Vec::with_capacity(self.hidden_sizes.len() + 1);
        let mut activations = Vec::with_capacity(self.hidden_sizes.len());
        let mut d_input = 1;
        for (i, &width) in self.hidden_sizes.iter().enumerate() {
            linears.push(LinearConfig::new(d_input, width).init(device));
            activations.push(if i == 0 {
                Activation::Sine
            } else {
                self.activation.clone()
            });
            d_input = width;
        }
        linears.push(LinearConfig::new(d_input, 1).init(device));

        Ok(Model {
            linears,
            activations: Ignored(activations),
        })
    }
}

/// PINNの本体となるニューラルネットワークモデル。
///
/// 座標 `x` を入力とし、その点における `y` を予測する多層パーセプトロン（MLP）です。
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    linears: Vec<Linear<B>>,
    activations: Ignored<Vec<Activation>>,
}

impl<B: Backend> Model<B> {
    /// モデルの順伝播を実行します。入力・出力とも `[batch, 1]` です。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let (output, hidden) = self.linears.split_last().unwrap();
        let mut x = input;
        for (linear, activation) in hidden.iter().zip(self.activations.0.iter()) {
            x = activation.forward(linear.forward(x));
        }
        output.forward(x)
    }

    pub fn num_layers(&self) -> usize {
        self.linears.len()
    }

    fn linear_jet(linear: &Linear<B>, jet: Jet<B>) -> Jet<B> {
        let weight = linear.weight.val();
        Jet {
            value: linear.forward(jet.value),
            first: jet.first.matmul(weight.clone()),
            second: jet.second.matmul(weight),
        }
    }
}

impl<B: Backend> InputDerivatives<B> for Model<B> {
    fn forward_jet(&self, x: Tensor<B, 2>) -> Jet<B> {
        let (output, hidden) = self.linears.split_last().unwrap();
        let mut jet = Jet::variable(x);
        for (linear, activation) in hidden.iter().zip(self.activations.0.iter()) {
            jet = activation.forward_jet(Self::linear_jet(linear, jet));
        }
        Self::linear_jet(output, jet)
    }
}

impl<B: AutodiffBackend> Model<B> {
    /// 逆伝播で `dy/dx` を求めます。
    ///
    /// `x` は呼び出し側で `require_grad()` 済みである必要があります。
    /// 入力が計算グラフから切り離されている場合は [`LossError::GradientUnavailable`] を返します。
    pub fn input_gradient(&self, x: Tensor<B, 2>) -> Result<Tensor<B::InnerBackend, 2>, LossError> {
        let y = self.forward(x.clone());
        let grads = y.sum().backward();
        x.grad(&grads).ok_or(LossError::GradientUnavailable)
    }
}
