use airy_pinn::checkpoint::{self, CheckpointMeta};
use airy_pinn::dataset::ReferenceDataset;
use airy_pinn::equation::{Airy, ProblemConfig};
use airy_pinn::inference::{origin_values, predict};
use airy_pinn::model::{Activation, Model, ModelConfig};
use airy_pinn::solver::{SolverConfig, solve_reference};
use airy_pinn::training::{Trainer, TrainingConfig};
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::tensor::backend::Backend;
use tempfile::tempdir;

type TrainBackend = Autodiff<NdArray<f32>>;
type InferBackend = NdArray<f32>;

#[test]
fn solve_train_checkpoint_and_infer() {
    let dir = tempdir().unwrap();
    let csv_path = dir.path().join("numerical.csv");
    let checkpoint_dir = dir.path().join("checkpoint");
    let device = Default::default();

    let problem = ProblemConfig::new(-4.0, 2.0, Airy::origin_value(), Airy::origin_slope());
    let trajectory = solve_reference(&Airy, &problem, 60, &SolverConfig::new()).unwrap();
    let dataset = trajectory.into_dataset();
    dataset.save_csv(&csv_path).unwrap();
    let loaded = ReferenceDataset::load_csv(&csv_path).unwrap();
    assert_eq!(loaded, dataset);
    assert_eq!(loaded.domain(), Some((-4.0, 2.0)));

    let config = TrainingConfig::new(
        ModelConfig::new()
            .with_hidden_sizes(vec![16, 16])
            .with_activation(Activation::Tanh),
        problem,
    )
    .with_num_epochs(6)
    .with_batch_size(16)
    .with_learning_rate(5e-3)
    .with_progress(false);

    TrainBackend::seed(config.seed);
    let model = config.model.init::<TrainBackend>(&device).unwrap();
    let optim = AdamConfig::new().init::<TrainBackend, Model<TrainBackend>>();
    let mut trainer = Trainer::new(model, optim, Airy, config.clone(), device.clone());

    let before = trainer.evaluate(&loaded).unwrap();
    let report = trainer.fit(&loaded).unwrap();
    let after = trainer.evaluate(&loaded).unwrap();
    assert_eq!(report.epochs.len(), 6);
    assert_eq!(report.non_finite_batches(), 0);
    assert!(after.loss < before.loss);

    let meta = CheckpointMeta::new(config, trainer.epochs_completed());
    checkpoint::save(&checkpoint_dir, trainer.model(), trainer.optimizer(), &meta).unwrap();

    let meta = checkpoint::load_meta(&checkpoint_dir).unwrap();
    assert_eq!(meta.epochs_completed, 6);
    let restored =
        checkpoint::load_model::<InferBackend>(&checkpoint_dir, &meta.training.model, &device).unwrap();

    let expected = predict(&trainer.model().valid(), loaded.x(), &device).unwrap();
    let actual = predict(&restored, loaded.x(), &device).unwrap();
    assert_eq!(actual.len(), loaded.len());
    assert_eq!(actual, expected);

    let (y0, dy0) = origin_values(&restored, &device);
    assert!(y0.is_finite() && dy0.is_finite());
}

#[test]
fn resumed_training_continues_the_schedule() {
    let dir = tempdir().unwrap();
    let device = Default::default();
    let dataset = solve_reference(&Airy, &ProblemConfig::airy(), 40, &SolverConfig::new())
        .unwrap()
        .into_dataset();

    let config = TrainingConfig::new(
        ModelConfig::new().with_hidden_sizes(vec![8]),
        ProblemConfig::airy(),
    )
    .with_num_epochs(5)
    .with_batch_size(32)
    .with_progress(false);

    let model = config.model.init::<TrainBackend>(&device).unwrap();
    let optim = AdamConfig::new().init::<TrainBackend, Model<TrainBackend>>();
    let mut trainer = Trainer::new(model, optim, Airy, config.clone(), device.clone());
    trainer.fit(&dataset).unwrap();
    let meta = CheckpointMeta::new(config.clone(), trainer.epochs_completed());
    checkpoint::save(dir.path(), trainer.model(), trainer.optimizer(), &meta).unwrap();

    let meta = checkpoint::load_meta(dir.path()).unwrap();
    let model =
        checkpoint::load_model::<TrainBackend>(dir.path(), &meta.training.model, &device).unwrap();
    let optim = checkpoint::load_optimizer::<TrainBackend, _>(
        dir.path(),
        AdamConfig::new().init::<TrainBackend, Model<TrainBackend>>(),
        &device,
    )
    .unwrap();
    let mut resumed = Trainer::new(model, optim, Airy, meta.training.clone(), device.clone())
        .resume_from(meta.epochs_completed);

    assert_eq!(resumed.epochs_completed(), 5);
    assert!((resumed.learning_rate() - 1e-3 * 0.95).abs() < 1e-15);

    let report = resumed.fit(&dataset).unwrap();
    assert_eq!(report.epochs.first().map(|epoch| epoch.epoch), Some(6));
    assert_eq!(resumed.epochs_completed(), 10);
}
