//! 計算バックエンドの選択。

use burn::backend::ndarray::NdArrayDevice;
use clap::ValueEnum;
use std::fmt;
use tracing::info;

/// コマンドラインで指定するバックエンド。
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    /// GPU アダプタが見つかれば wgpu、そうでなければ CPU
    Auto,
    Cpu,
    Wgpu,
}

/// 実際に使うバックエンド。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeBackend {
    Cpu,
    #[cfg(feature = "wgpu")]
    Wgpu,
}

impl ComputeBackend {
    /// 既定デバイスの名前。
    pub fn device_name(&self) -> String {
        match self {
            ComputeBackend::Cpu => format!("{:?}", NdArrayDevice::default()),
            #[cfg(feature = "wgpu")]
            ComputeBackend::Wgpu => format!("{:?}", burn::backend::wgpu::WgpuDevice::default()),
        }
    }
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeBackend::Cpu => write!(f, "NdArray (CPU)"),
            #[cfg(feature = "wgpu")]
            ComputeBackend::Wgpu => write!(f, "Wgpu (GPU)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("wgpu バックエンドは無効です（`--features wgpu` を付けてビルドしてください）")]
    WgpuUnavailable,
    #[error("wgpu を使えるアダプタが見つかりません（'--backend cpu' を指定してください）")]
    NoAdapter,
}

/// 既定の wgpu デバイスに小さなテンソルを作り、アダプタが使えるか確かめます。
///
/// burn はアダプタがないと初期化時に panic するので、その panic を捕まえます。
#[cfg(feature = "wgpu")]
fn wgpu_adapter_available() -> bool {
    use burn::backend::Wgpu;
    use burn::backend::wgpu::WgpuDevice;
    use burn::tensor::Tensor;

    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let available = std::panic::catch_unwind(|| {
        let device = WgpuDevice::default();
        let _ = Tensor::<Wgpu, 1>::zeros([1], &device).into_data();
    })
    .is_ok();
    std::panic::set_hook(hook);
    available
}

#[cfg(not(feature = "wgpu"))]
fn wgpu_adapter_available() -> bool {
    false
}

/// モデルを作る前に一度だけ呼び、使うバックエンドを決めます。
pub fn select(choice: BackendChoice) -> Result<ComputeBackend, DeviceError> {
    let backend = resolve(choice, wgpu_adapter_available)?;
    info!("バックエンド: {}, デバイス: {}", backend, backend.device_name());
    Ok(backend)
}

/// `adapter_available` は wgpu が候補になるときだけ呼ばれます。
fn resolve(
    choice: BackendChoice,
    adapter_available: impl FnOnce() -> bool,
) -> Result<ComputeBackend, DeviceError> {
    match choice {
        BackendChoice::Cpu => Ok(ComputeBackend::Cpu),
        #[cfg(feature = "wgpu")]
        BackendChoice::Wgpu => {
            if adapter_available() {
                Ok(ComputeBackend::Wgpu)
            } else {
                Err(DeviceError::NoAdapter)
            }
        }
        #[cfg(feature = "wgpu")]
        BackendChoice::Auto => {
            if adapter_available() {
                Ok(ComputeBackend::Wgpu)
            } else {
                tracing::warn!("wgpu アダプタが見つからないため CPU で実行します");
                Ok(ComputeBackend::Cpu)
            }
        }
        #[cfg(not(feature = "wgpu"))]
        BackendChoice::Auto => {
            let _ = adapter_available;
            Ok(ComputeBackend::Cpu)
        }
        #[cfg(not(feature = "wgpu"))]
        BackendChoice::Wgpu => Err(DeviceError::WgpuUnavailable),
    }
}
