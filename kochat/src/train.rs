//! Fine-tuning loop.
use std::path::PathBuf;

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use kochat_transformers::architectures::CausalLM;
use kochat_transformers::error::BoxedError;
use kochat_transformers::kv_cache::KeyValueCache;
use kochat_transformers::models::gpt2::GPT2CausalLM;
use kochat_transformers::models::hf::{FromHFHub, FromHfHubError, TrainableModel};
use kochat_transformers::models::transformer::TransformerCausalLM;
use kochat_transformers::tokenizers::{FromHFHub as TokenizerFromHFHub, HfTokenizer};
use snafu::{ensure, ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchError, Batcher};
use crate::checkpoint::{CheckpointError, CheckpointManager, CheckpointMetadata};
use crate::config::TrainConfig;
use crate::dataset::{load_turns, DatasetError, Sample, SampleEncoder};
use crate::loss::{masked_cross_entropy, LossError};
use crate::optim::{
    clip_grad_norm, CosineWithWarmup, GroupedAdamW, OptimError, ParameterGroups,
};

#[derive(Debug, Snafu)]
pub enum TrainError {
    #[snafu(display("Cannot load tokenizer '{name}'"))]
    LoadTokenizer { name: String, source: BoxedError },

    #[snafu(display("Cannot load pretrained model '{name}'"))]
    LoadModel {
        name: String,
        source: FromHfHubError,
    },

    #[snafu(display("Cannot prepare training data"))]
    Dataset { source: DatasetError },

    #[snafu(display("No training samples"))]
    NoSamples,

    #[snafu(display("Cannot create batch"))]
    Batch { source: BatchError },

    #[snafu(display("Cannot run forward pass"))]
    Forward { source: BoxedError },

    #[snafu(display("Cannot compute loss"))]
    Loss { source: LossError },

    #[snafu(display("Cannot read loss value"))]
    LossValue { source: candle_core::Error },

    #[snafu(display("Cannot compute gradients"))]
    Backward { source: candle_core::Error },

    #[snafu(display("Cannot optimize parameters"))]
    Optimize { source: OptimError },

    #[snafu(display("Cannot save checkpoint"))]
    Checkpoint { source: CheckpointError },

    #[snafu(display("Cannot create progress bar style"))]
    ProgressStyle {
        source: indicatif::style::TemplateError,
    },
}

/// Outcome of a training run.
#[derive(Clone, Debug)]
pub struct TrainSummary {
    /// Number of optimizer steps.
    pub steps: usize,
    /// Mean loss of each epoch.
    pub epoch_losses: Vec<f32>,
    /// Checkpoint with the lowest epoch loss.
    pub best_checkpoint: Option<PathBuf>,
}

/// Load the pretrained tokenizer and model named in the configuration.
pub fn load_pretrained(
    config: &TrainConfig,
    device: &Device,
) -> Result<(HfTokenizer, TrainableModel<TransformerCausalLM>), TrainError> {
    let revision = config.model_revision.as_deref();
    let tokenizer = <HfTokenizer as TokenizerFromHFHub>::from_hf_hub(&config.model_name, revision)
        .context(LoadTokenizerSnafu {
            name: &config.model_name,
        })?;
    let model = GPT2CausalLM::from_hf_hub_trainable(&config.model_name, revision, device)
        .context(LoadModelSnafu {
            name: &config.model_name,
        })?;
    Ok((tokenizer, model))
}

/// Fine-tunes a causal language model on encoded chat turns.
pub struct Trainer<'a> {
    config: &'a TrainConfig,
    device: Device,
    show_progress: bool,
}

impl<'a> Trainer<'a> {
    pub fn new(config: &'a TrainConfig, device: Device) -> Self {
        Trainer {
            config,
            device,
            show_progress: true,
        }
    }

    /// Show a progress bar during training.
    ///
    /// Default: `true`
    pub fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Load the data and model of the configuration and fine-tune.
    pub fn run(&self) -> Result<TrainSummary, TrainError> {
        let (tokenizer, model) = load_pretrained(self.config, &self.device)?;
        let turns = load_turns(&self.config.data_path).context(DatasetSnafu)?;
        info!(
            path = %self.config.data_path.display(),
            n_turns = turns.len(),
            "Loaded chat turns"
        );
        let samples = SampleEncoder::new(&tokenizer, self.config.max_len)
            .and_then(|encoder| encoder.encode_all(&turns))
            .context(DatasetSnafu)?;
        self.train(&model, &samples)
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar, TrainError> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let progress = ProgressBar::new(len as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .context(ProgressStyleSnafu)?
                .progress_chars("#>-"),
        );
        Ok(progress)
    }

    /// Fine-tune a model on encoded samples.
    ///
    /// Samples without trained positions are skipped. Epochs are numbered
    /// from zero.
    pub fn train(
        &self,
        model: &TrainableModel<TransformerCausalLM>,
        samples: &[Sample],
    ) -> Result<TrainSummary, TrainError> {
        let n_samples = samples.len();
        let samples = samples
            .iter()
            .filter(|sample| sample.n_trained() > 0)
            .collect::<Vec<_>>();
        if samples.len() < n_samples {
            warn!(
                n_skipped = n_samples - samples.len(),
                "Skipping samples without trained positions"
            );
        }
        ensure!(!samples.is_empty(), NoSamplesSnafu);
        let config = self.config;

        let mut batcher =
            Batcher::new(samples.len(), config.batch_size, config.seed).context(BatchSnafu)?;
        let schedule = CosineWithWarmup::with_warmup_ratio(
            batcher.len() * config.max_epochs,
            config.warmup_ratio,
        );
        let groups = ParameterGroups::from_var_map(&model.var_map).context(OptimizeSnafu)?;
        let vars = groups.all();
        let mut optimizer =
            GroupedAdamW::new(&groups, config.lr, config.weight_decay).context(OptimizeSnafu)?;
        let mut checkpoints =
            CheckpointManager::new(&config.checkpoint_dir).context(CheckpointSnafu)?;

        info!(
            n_samples = samples.len(),
            batches_per_epoch = batcher.len(),
            total_steps = schedule.total_steps,
            warmup_steps = schedule.warmup_steps,
            "Starting training"
        );

        let mut step = 0;
        let mut epoch_losses = Vec::with_capacity(config.max_epochs);
        for epoch in 0..config.max_epochs {
            let progress = self.progress_bar(batcher.len())?;
            progress.set_prefix(format!("epoch {}/{}", epoch + 1, config.max_epochs));

            let mut loss_sum = 0f32;
            let batches = batcher.epoch();
            for indices in &batches {
                let batch_samples = indices.iter().map(|&idx| samples[idx]).collect::<Vec<_>>();
                let batch = Batch::collate(&batch_samples, &self.device).context(BatchSnafu)?;

                let output = model
                    .model
                    .forward_t(
                        &batch.token_ids,
                        &batch.attention_mask,
                        &mut KeyValueCache::no_cache(),
                        None,
                        true,
                    )
                    .context(ForwardSnafu)?;
                let loss = masked_cross_entropy(output.logits(), &batch.labels, &batch.loss_mask)
                    .context(LossSnafu)?;
                let train_loss = loss.to_scalar::<f32>().context(LossValueSnafu)?;

                let mut grads = loss.backward().context(BackwardSnafu)?;
                let grad_norm = clip_grad_norm(&mut grads, &vars, config.gradient_clip_val)
                    .context(OptimizeSnafu)?;
                optimizer.set_learning_rate(config.lr * schedule.multiplier(step));
                optimizer.step(&grads).context(OptimizeSnafu)?;
                step += 1;

                debug!(
                    step,
                    train_loss,
                    grad_norm,
                    lr = optimizer.learning_rate(),
                    "Optimizer step"
                );
                loss_sum += train_loss;
                progress.set_message(format!("loss {train_loss:.4}"));
                progress.inc(1);
            }
            progress.finish();

            let train_loss = loss_sum / batches.len() as f32;
            epoch_losses.push(train_loss);
            info!(epoch, step, train_loss, "Finished epoch");

            checkpoints
                .save(
                    &model.var_map,
                    &CheckpointMetadata {
                        model_name: config.model_name.clone(),
                        model_revision: config.model_revision.clone(),
                        epoch,
                        step,
                        train_loss,
                    },
                )
                .context(CheckpointSnafu)?;
        }

        let best_checkpoint = checkpoints.best().map(PathBuf::from);
        if let Some(best) = &best_checkpoint {
            info!(path = %best.display(), "Best checkpoint");
        }

        Ok(TrainSummary {
            steps: step,
            epoch_losses,
            best_checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use snafu::{report, ResultExt, Whatever};

    use super::{TrainError, Trainer};
    use crate::checkpoint::{CheckpointMetadata, LAST_CHECKPOINT};
    use crate::config::TrainConfig;
    use crate::dataset::{ChatTurn, SampleEncoder};
    use crate::util::tests::{tiny_causal_lm, tiny_tokenizer};

    fn turns() -> Vec<ChatTurn> {
        [
            ("안녕", "반가워요", "0"),
            ("오늘 날씨", "좋아요", "2"),
            ("슬퍼요", "괜찮아요", "1"),
        ]
        .into_iter()
        .map(|(question, answer, label)| ChatTurn {
            question: question.to_string(),
            answer: answer.to_string(),
            label: label.to_string(),
        })
        .collect()
    }

    #[test]
    #[report]
    fn trains_and_checkpoints_every_epoch() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().whatever_context("Cannot create directory")?;
        let (_tokenizer_dir, tokenizer) = tiny_tokenizer();
        let config = TrainConfig {
            max_len: 8,
            batch_size: 2,
            lr: 1e-2,
            max_epochs: 2,
            checkpoint_dir: dir.path().to_path_buf(),
            ..TrainConfig::default()
        };

        let samples = SampleEncoder::new(&tokenizer, config.max_len)
            .and_then(|encoder| encoder.encode_all(&turns()))
            .whatever_context("Cannot encode turns")?;
        let model = tiny_causal_lm(&device);
        let summary = Trainer::new(&config, device)
            .show_progress(false)
            .train(&model, &samples)
            .whatever_context("Cannot train")?;

        assert_eq!(summary.steps, 4);
        assert_eq!(summary.epoch_losses.len(), 2);
        assert!(summary.epoch_losses.iter().all(|loss| loss.is_finite()));
        let last = CheckpointMetadata::read(&dir.path().join(LAST_CHECKPOINT))
            .whatever_context("Cannot read metadata")?;
        assert_eq!((last.epoch, last.step), (1, 4));
        let first_epoch = std::fs::read_dir(dir.path())
            .whatever_context("Cannot list checkpoints")?
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().starts_with("model_-00-"));
        assert!(first_epoch);
        let best = summary.best_checkpoint.expect("No best checkpoint");
        assert!(best.exists());
        assert!(best.starts_with(dir.path()));

        Ok(())
    }

    #[test]
    #[report]
    fn loss_decreases_on_repeated_turns() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().whatever_context("Cannot create directory")?;
        let (_tokenizer_dir, tokenizer) = tiny_tokenizer();
        let config = TrainConfig {
            max_len: 8,
            batch_size: 3,
            lr: 1e-2,
            warmup_ratio: 0.,
            max_epochs: 10,
            checkpoint_dir: dir.path().to_path_buf(),
            ..TrainConfig::default()
        };

        let samples = SampleEncoder::new(&tokenizer, config.max_len)
            .and_then(|encoder| encoder.encode_all(&turns()))
            .whatever_context("Cannot encode turns")?;
        let model = tiny_causal_lm(&device);
        let summary = Trainer::new(&config, device)
            .show_progress(false)
            .train(&model, &samples)
            .whatever_context("Cannot train")?;

        let first = summary.epoch_losses[0];
        let last = summary.epoch_losses[summary.epoch_losses.len() - 1];
        assert!(last < first, "loss did not decrease: {first} -> {last}");

        Ok(())
    }

    #[test]
    #[report]
    fn skips_samples_without_trained_positions() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().whatever_context("Cannot create directory")?;
        let (_tokenizer_dir, tokenizer) = tiny_tokenizer();
        let config = TrainConfig {
            max_len: 5,
            batch_size: 1,
            max_epochs: 1,
            checkpoint_dir: dir.path().to_path_buf(),
            ..TrainConfig::default()
        };

        let encoder = SampleEncoder::new(&tokenizer, config.max_len)
            .whatever_context("Cannot create encoder")?;
        let encode = |question: &str, answer: &str, label: &str| {
            encoder.encode(&ChatTurn {
                question: question.to_string(),
                answer: answer.to_string(),
                label: label.to_string(),
            })
        };
        let untrained = encode("안녕", "반가워요", "0")
            .whatever_context("Cannot encode turn")?
            .sample;
        let trained = encode("오늘 날씨", "좋아요", "2")
            .whatever_context("Cannot encode turn")?
            .sample;
        assert_eq!(untrained.n_trained(), 0);

        let model = tiny_causal_lm(&device);
        let trainer = Trainer::new(&config, device).show_progress(false);
        let summary = trainer
            .train(&model, &[untrained.clone(), trained])
            .whatever_context("Cannot train")?;
        assert_eq!(summary.steps, 1);
        assert!(summary.epoch_losses[0].is_finite());

        assert!(matches!(
            trainer.train(&model, &[untrained]),
            Err(TrainError::NoSamples)
        ));

        Ok(())
    }

    #[test]
    fn training_without_samples_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            checkpoint_dir: dir.path().to_path_buf(),
            ..TrainConfig::default()
        };
        let model = tiny_causal_lm(&Device::Cpu);
        assert!(Trainer::new(&config, Device::Cpu)
            .show_progress(false)
            .train(&model, &[])
            .is_err());
    }

    #[test]
    fn loss_value_errors_are_not_reported_as_gradients() {
        let error = TrainError::LossValue {
            source: candle_core::Error::Msg("not a scalar".to_string()),
        };
        assert_eq!(error.to_string(), "Cannot read loss value");
    }
}
