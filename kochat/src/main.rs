use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use kochat::chat::ChatSession;
use kochat::checkpoint::{load_causal_lm, CheckpointMetadata};
use kochat::config::{ChatConfig, TrainConfig};
use kochat::device::DeviceSpec;
use kochat::generate::ChatResponder;
use kochat::sentiment::EmotionClassifier;
use kochat::train::Trainer;
use kochat_transformers::tokenizers::{FromHFHub, HfTokenizer};
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "kochat")]
#[command(version)]
#[command(about = "Korean chatbot that tracks the emotions of its user", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Device to run on (cpu, cuda[:N], metal[:N])
    #[arg(short, long, default_value = "cpu", global = true)]
    device: DeviceSpec,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the dialogue model on question/answer pairs
    Train(TrainArgs),

    /// Start an interactive chat session
    Chat(ChatArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// JSON configuration file, overridden by the options below
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CSV file with Q, A and label columns
    #[arg(long)]
    data: Option<PathBuf>,

    /// Length of a training sample in pieces
    #[arg(long)]
    max_len: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Fraction of the training steps used for warmup
    #[arg(long)]
    warmup_ratio: Option<f64>,

    #[arg(long)]
    max_epochs: Option<usize>,

    /// Directory to save checkpoints to
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Pretrained model (Hugging Face Hub name)
    #[arg(short, long)]
    model: Option<String>,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_file(path)?,
            None => TrainConfig::default(),
        };

        if let Some(data) = self.data {
            config.data_path = data;
        }
        if let Some(max_len) = self.max_len {
            config.max_len = max_len;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(warmup_ratio) = self.warmup_ratio {
            config.warmup_ratio = warmup_ratio;
        }
        if let Some(max_epochs) = self.max_epochs {
            config.max_epochs = max_epochs;
        }
        if let Some(checkpoint_dir) = self.checkpoint_dir {
            config.checkpoint_dir = checkpoint_dir;
        }
        if let Some(model) = self.model {
            config.model_name = model;
        }

        Ok(config)
    }
}

#[derive(Args)]
struct ChatArgs {
    /// JSON configuration file, overridden by the options below
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fine-tuned parameters saved by training
    #[arg(long)]
    model_params: Option<PathBuf>,

    /// Sentiment of the chatbot (0: neutral, 1: negative, 2: positive)
    #[arg(short, long, value_parser = ["0", "1", "2"])]
    sentiment: Option<String>,

    /// Maximum number of pieces in a response
    #[arg(long)]
    max_response_len: Option<usize>,

    /// Directory to write emotion charts to
    #[arg(long)]
    plot_dir: Option<PathBuf>,

    /// Emotion classifier (Hugging Face Hub name)
    #[arg(long)]
    classifier: Option<String>,
}

impl ChatArgs {
    fn into_config(self) -> Result<ChatConfig> {
        let mut config = match &self.config {
            Some(path) => ChatConfig::from_file(path)?,
            None => ChatConfig::default(),
        };

        if let Some(model_params) = self.model_params {
            config.model_params = model_params;
        }
        if let Some(sentiment) = self.sentiment {
            config.sentiment = sentiment;
        }
        if let Some(max_response_len) = self.max_response_len {
            config.max_response_len = max_response_len;
        }
        if let Some(plot_dir) = self.plot_dir {
            config.plot_dir = plot_dir;
        }
        if let Some(classifier) = self.classifier {
            config.classifier_name = classifier;
        }

        Ok(config)
    }
}

fn init_logging(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}

fn train(args: TrainArgs, device: Device) -> Result<()> {
    let config = args.into_config()?;
    info!(?config, "Training configuration");

    let summary = Trainer::new(&config, device)
        .run()
        .context("Training failed")?;
    info!(
        steps = summary.steps,
        best_checkpoint = ?summary.best_checkpoint,
        "Finished training"
    );

    Ok(())
}

fn chat(args: ChatArgs, device: Device) -> Result<()> {
    let config = args.into_config()?;
    info!(?config, "Chat configuration");

    let metadata = CheckpointMetadata::read(&config.model_params)?;
    let tokenizer = <HfTokenizer as FromHFHub>::from_hf_hub(
        &metadata.model_name,
        metadata.model_revision.as_deref(),
    )
    .map_err(|e| anyhow::anyhow!(e))
    .with_context(|| format!("Cannot load tokenizer '{}'", metadata.model_name))?;
    let model = load_causal_lm(&config.model_params, &device)?;
    let responder = ChatResponder::new(model, tokenizer, config.max_response_len, device.clone())?;

    let classifier = EmotionClassifier::from_hf_hub(
        &config.classifier_name,
        &config.classifier_tokenizer,
        device,
    )?;

    fs::create_dir_all(&config.plot_dir).with_context(|| {
        format!("Cannot create plot directory: {}", config.plot_dir.display())
    })?;

    let mut session = ChatSession::new(responder, classifier, config.sentiment, config.plot_dir);
    session.run(io::stdin().lock(), io::stdout().lock())?;

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let device = cli.device.device()?;
    info!(device = %cli.device, "Using device");

    match cli.command {
        Commands::Train(args) => train(args, device),
        Commands::Chat(args) => chat(args, device),
    }
}
