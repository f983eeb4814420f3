use airy_pinn::cli::{Cli, Commands};
use airy_pinn::device::{self, ComputeBackend};
use airy_pinn::{inference, solver, training};
use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use tracing_subscriber::FmtSubscriber;

type CpuBackend = NdArray<f32>;
#[cfg(feature = "wgpu")]
type GpuBackend = burn::backend::Wgpu;

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、`solve`・`train`・`infer` の処理に振り分けます。
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(cli.log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Solve(args) => solver::run(args),
        Commands::Train(args) => match device::select(args.backend)? {
            ComputeBackend::Cpu => training::run::<Autodiff<CpuBackend>>(args, Default::default()),
            #[cfg(feature = "wgpu")]
            ComputeBackend::Wgpu => training::run::<Autodiff<GpuBackend>>(args, Default::default()),
        },
        Commands::Infer(args) => match device::select(args.backend)? {
            ComputeBackend::Cpu => inference::run::<CpuBackend>(args, Default::default()),
            #[cfg(feature = "wgpu")]
            ComputeBackend::Wgpu => inference::run::<GpuBackend>(args, Default::default()),
        },
    }
}
