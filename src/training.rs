use burn::{
    config::Config,
    data::dataloader::DataLoaderBuilder,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        cast::ToElement,
        Tensor,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{marker::PhantomData, path::Path};

use crate::{
    color::norm_imgs,
    data::{ColorBatch, ColorizationBatcher, ColorizationDataset},
    error::{self, Error},
    model::{discriminator::Discriminator, generator::Generator, Model, ModelConfig},
    utils::{DiagnosticExporter, ExampleWriter},
};

// ////////////////////////////////////////////////////////////////////////////
// Configuration
#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "AdamConfig::new().with_beta_1(0.5)")]
    pub generator_optimizer: AdamConfig,
    #[config(default = "AdamConfig::new().with_beta_1(0.5)")]
    pub discriminator_optimizer: AdamConfig,

    #[config(default = 2e-4)]
    pub learning_rate: f64,
    /// Weight of the L1 term in the generator loss.
    #[config(default = 100.0)]
    pub l1_weight: f64,
    /// Export a generator sample every `sample_interval` batches.
    #[config(default = 25)]
    pub sample_interval: usize,
    #[config(default = 10)]
    pub epochs: usize,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 256)]
    pub image_size: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        let generator = &self.model.generator_config;
        if generator.depth < 2 {
            return Err(Error::InvalidConfig {
                name: "depth",
                reason: format!("must be at least 2, got {}", generator.depth),
            });
        }
        let min_size = self.model.min_image_size();
        if self.image_size < min_size || self.image_size % min_size != 0 {
            return Err(Error::InvalidConfig {
                name: "image_size",
                reason: format!("{} is not a multiple of {min_size}", self.image_size),
            });
        }
        let expected = 1 + generator.out_channels;
        if self.model.discriminator_config.in_channels != expected {
            return Err(Error::InvalidConfig {
                name: "in_channels",
                reason: format!("discriminator must take {expected} channels"),
            });
        }
        if self.batch_size == 0 || self.sample_interval == 0 {
            return Err(Error::InvalidConfig {
                name: "batch_size/sample_interval",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Helpers

/// Loss values reported for one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub reconstruction: f32,
    pub adversarial: f32,
    pub discriminator: f32,
}

impl StepMetrics {
    pub fn named(&self) -> [(&'static str, f32); 3] {
        [
            ("gen_mae_loss", self.reconstruction),
            ("gen_d_loss", self.adversarial),
            ("disc_loss", self.discriminator),
        ]
    }

    fn check_finite(&self, batch: usize) -> error::Result<()> {
        for (name, value) in self.named() {
            if !value.is_finite() {
                return Err(Error::NonFiniteLoss { name, batch, value });
            }
        }
        Ok(())
    }
}

/// Mean losses over one epoch.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EpochSummary {
    pub batches: usize,
    pub metrics: StepMetrics,
}

impl EpochSummary {
    fn record(&mut self, step: &StepMetrics) {
        let n = self.batches as f32;
        let mean = |old: f32, new: f32| (old * n + new) / (n + 1.0);

        self.metrics = StepMetrics {
            reconstruction: mean(self.metrics.reconstruction, step.reconstruction),
            adversarial: mean(self.metrics.adversarial, step.adversarial),
            discriminator: mean(self.metrics.discriminator, step.discriminator),
        };
        self.batches += 1;
    }
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f32 {
    loss.clone().into_scalar().to_f32()
}

/// Renders per-batch losses.
pub trait ProgressReporter {
    fn update(&mut self, batch: usize, metrics: &[(&str, f32)]);

    fn finish(&mut self) {}
}

pub struct ProgressBarReporter {
    bar: ProgressBar,
}

impl ProgressBarReporter {
    pub fn new(epoch: usize, total_batches: u64) -> Self {
        let bar = ProgressBar::new(total_batches);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(format!("epoch {epoch}"));

        Self { bar }
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn update(&mut self, batch: usize, metrics: &[(&str, f32)]) {
        let message = metrics
            .iter()
            .map(|(name, value)| format!("{name}: {value:.4}"))
            .collect::<Vec<_>>()
            .join(" - ");
        self.bar.set_position(batch as u64 + 1);
        self.bar.set_message(message);
    }

    fn finish(&mut self) {
        self.bar.finish();
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Networks

/// A module together with the optimizer that owns its updates.
pub struct Network<B, M, O> {
    pub model: M,
    optimizer: O,
    learning_rate: f64,
    _backend: PhantomData<B>,
}

impl<B, M, O> Network<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    pub fn new(model: M, optimizer: O, learning_rate: f64) -> Self {
        Self {
            model,
            optimizer,
            learning_rate,
            _backend: PhantomData,
        }
    }

    /// Differentiate `loss` and keep only the gradients of this network's parameters.
    pub fn gradients(&self, loss: Tensor<B, 1>) -> GradientsParams {
        GradientsParams::from_grads(loss.backward(), &self.model)
    }

    pub fn step(&mut self, grads: GradientsParams) {
        self.model = self
            .optimizer
            .step(self.learning_rate, self.model.clone(), grads);
    }

    /// Write `{name}.mpk` and the optimizer state as `{name}_optim.mpk` into `dir`.
    pub fn save(&self, dir: &Path, name: &str, recorder: &CheckpointRecorder) -> error::Result<()> {
        self.model.clone().save_file(dir.join(name), recorder)?;
        Recorder::<B>::record(
            recorder,
            self.optimizer.to_record(),
            dir.join(format!("{name}{OPTIMIZER_SUFFIX}")),
        )?;
        Ok(())
    }

    /// Restore what [`Network::save`] wrote. A missing optimizer record keeps the fresh optimizer.
    pub fn load(
        self,
        dir: &Path,
        name: &str,
        recorder: &CheckpointRecorder,
        device: &B::Device,
    ) -> error::Result<Self> {
        let model = self.model.load_file(dir.join(name), recorder, device)?;

        let optim_path = dir.join(format!("{name}{OPTIMIZER_SUFFIX}"));
        let optimizer = if optim_path.with_extension("mpk").exists() {
            let record = Recorder::<B>::load(recorder, optim_path, device)?;
            self.optimizer.load_record(record)
        } else {
            tracing::warn!("no optimizer state for {name}, starting it fresh");
            self.optimizer
        };

        Ok(Self {
            model,
            optimizer,
            learning_rate: self.learning_rate,
            _backend: PhantomData,
        })
    }
}

/// Generator and discriminator, each with its own optimizer.
pub struct ColorizationGan<B: AutodiffBackend, OG, OD> {
    pub generator: Network<B, Generator<B>, OG>,
    pub discriminator: Network<B, Discriminator<B>, OD>,
    l1_weight: f64,
    sample_interval: usize,
}

/// Pair `model` with the Adam optimizers described by `config`.
pub fn init_gan<B: AutodiffBackend>(
    config: &TrainingConfig,
    model: Model<B>,
) -> ColorizationGan<B, impl Optimizer<Generator<B>, B>, impl Optimizer<Discriminator<B>, B>> {
    ColorizationGan::new(
        config,
        model,
        config.generator_optimizer.init::<B, Generator<B>>(),
        config.discriminator_optimizer.init::<B, Discriminator<B>>(),
    )
}

impl<B, OG, OD> ColorizationGan<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    pub fn new(config: &TrainingConfig, model: Model<B>, gen_optimizer: OG, disc_optimizer: OD) -> Self {
        Self {
            generator: Network::new(model.generator, gen_optimizer, config.learning_rate),
            discriminator: Network::new(model.discriminator, disc_optimizer, config.learning_rate),
            l1_weight: config.l1_weight,
            sample_interval: config.sample_interval,
        }
    }

    /// One pass over `batches`.
    pub fn train_epoch<I, E, R>(
        &mut self,
        epoch: usize,
        batches: I,
        exporter: &E,
        reporter: &mut R,
    ) -> error::Result<EpochSummary>
    where
        I: IntoIterator<Item = ColorBatch<B>>,
        E: DiagnosticExporter,
        R: ProgressReporter,
    {
        let mut summary = EpochSummary::default();

        for (index, batch) in batches.into_iter().enumerate() {
            let metrics = self.train_step(epoch, index, batch, exporter)?;
            reporter.update(index, &metrics.named());
            summary.record(&metrics);
        }
        reporter.finish();

        tracing::info!(
            "epoch {epoch}: {} batches, gen_mae_loss {:.5}, gen_d_loss {:.5}, disc_loss {:.5}",
            summary.batches,
            summary.metrics.reconstruction,
            summary.metrics.adversarial,
            summary.metrics.discriminator,
        );
        Ok(summary)
    }

    /// Update both networks from one batch of display-range RGB images.
    pub fn train_step<E: DiagnosticExporter>(
        &mut self,
        epoch: usize,
        index: usize,
        batch: ColorBatch<B>,
        exporter: &E,
    ) -> error::Result<StepMetrics> {
        let images = norm_imgs(batch.images);

        if self.sample_interval > 0 && index % self.sample_interval == 0 {
            self.export_sample(epoch, index, images.clone(), exporter);
        }

        let luminance = images.clone().narrow(1, 0, 1);
        let real_chroma = images.clone().narrow(1, 1, 2);

        let generator = &self.generator.model;
        let discriminator = &self.discriminator.model;

        // generator objective: gradients flow back through the discriminator
        let fake_chroma = generator.forward(images);
        let d_fake = discriminator.forward(luminance.clone(), fake_chroma.clone());
        let gen_loss = generator.loss(
            fake_chroma.clone(),
            d_fake,
            real_chroma.clone(),
            self.l1_weight,
        );

        // discriminator objective: same fake value, cut from the generator graph
        let d_fake = discriminator.forward(luminance.clone(), fake_chroma.detach());
        let d_real = discriminator.forward(luminance, real_chroma);
        let disc_loss = discriminator.loss(d_real, d_fake);

        let metrics = StepMetrics {
            reconstruction: scalar(&gen_loss.reconstruction),
            adversarial: scalar(&gen_loss.adversarial),
            discriminator: scalar(&disc_loss),
        };
        metrics.check_finite(index)?;
        tracing::debug!(
            "epoch {epoch} batch {index}: gen_mae_loss {:.5}, gen_d_loss {:.5}, disc_loss {:.5}",
            metrics.reconstruction,
            metrics.adversarial,
            metrics.discriminator,
        );

        let gen_grads = self.generator.gradients(gen_loss.total);
        let disc_grads = self.discriminator.gradients(disc_loss);

        self.generator.step(gen_grads);
        self.discriminator.step(disc_grads);

        Ok(metrics)
    }

    /// Save both networks with their optimizer state.
    pub fn save(&self, dir: &Path, recorder: &CheckpointRecorder) -> error::Result<()> {
        self.generator.save(dir, GENERATOR_FILE, recorder)?;
        self.discriminator.save(dir, DISCRIMINATOR_FILE, recorder)
    }

    pub fn load(
        self,
        dir: &Path,
        recorder: &CheckpointRecorder,
        device: &B::Device,
    ) -> error::Result<Self> {
        Ok(Self {
            generator: self.generator.load(dir, GENERATOR_FILE, recorder, device)?,
            discriminator: self
                .discriminator
                .load(dir, DISCRIMINATOR_FILE, recorder, device)?,
            ..self
        })
    }

    fn export_sample<E: DiagnosticExporter>(
        &self,
        epoch: usize,
        index: usize,
        images: Tensor<B, 4>,
        exporter: &E,
    ) {
        let generator = self.generator.model.valid();
        let images = images.inner();
        let generated = generator.forward(images.clone());

        if let Err(err) = exporter.export(epoch, index, images, generated) {
            tracing::warn!("failed to export sample for epoch {epoch} batch {index}: {err}");
        }
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Training

/// Progress persisted beside the model records.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Number of completed epochs.
    pub epoch: usize,
    pub last_summary: Option<EpochSummary>,
}

pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const GENERATOR_FILE: &str = "gen";
pub const DISCRIMINATOR_FILE: &str = "disc";
const OPTIMIZER_SUFFIX: &str = "_optim";
const STATE_FILE: &str = "state.json";
const SAMPLE_DIR: &str = "gen_imgs";

pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    data_dir: &Path,
    artifact_dir: &Path,
    should_continue: bool,
    device: &B::Device,
) -> error::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join("config.json"))?;
    B::seed(config.seed);

    let recorder = CheckpointRecorder::new();
    let mut gan = init_gan(&config, config.model.init::<B>(device));
    let mut state = TrainingState::default();

    // Continue where you left off?
    if should_continue {
        let gen_path = artifact_dir.join(GENERATOR_FILE).with_extension("mpk");
        let disc_path = artifact_dir.join(DISCRIMINATOR_FILE).with_extension("mpk");
        if gen_path.exists() && disc_path.exists() {
            tracing::info!("continuing from previous run in {}", artifact_dir.display());
            gan = gan.load(artifact_dir, &recorder, device)?;
            state = load_state(&artifact_dir.join(STATE_FILE))?;
        } else {
            tracing::info!("no saved models found, starting a new session");
        }
    }

    let dataset = ColorizationDataset::new(data_dir, config.image_size as u32)?;
    let dataloader = DataLoaderBuilder::new(ColorizationBatcher::new())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset);
    let total_batches = dataloader.num_items().div_ceil(config.batch_size) as u64;

    let exporter = ExampleWriter::new(artifact_dir.join(SAMPLE_DIR));

    for epoch in state.epoch..config.epochs {
        let mut reporter = ProgressBarReporter::new(epoch, total_batches);
        let summary = gan.train_epoch(epoch, dataloader.iter(), &exporter, &mut reporter)?;

        gan.save(artifact_dir, &recorder)?;
        state = TrainingState {
            epoch: epoch + 1,
            last_summary: Some(summary),
        };
        save_state(&artifact_dir.join(STATE_FILE), &state)?;
        tracing::info!("saved models after epoch {epoch} to {}", artifact_dir.display());
    }

    Ok(())
}

fn load_state(path: &Path) -> error::Result<TrainingState> {
    if !path.exists() {
        return Ok(TrainingState::default());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn save_state(path: &Path, state: &TrainingState) -> error::Result<()> {
    let contents = serde_json::to_string_pretty(state)?;
    std::fs::write(path, contents)?;
    Ok(())
}
