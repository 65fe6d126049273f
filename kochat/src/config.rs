//! Training and chat configuration.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Cannot open configuration file: {}", path.to_string_lossy()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot parse configuration file: {}", path.to_string_lossy()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Fine-tuning configuration.
///
/// Fields that are missing from a configuration file take their default
/// values.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    /// Length of a training sample in pieces.
    pub max_len: usize,
    pub batch_size: usize,
    /// Peak learning rate.
    pub lr: f64,
    /// Fraction of the training steps used for learning rate warmup.
    pub warmup_ratio: f64,
    pub max_epochs: usize,
    /// Weight decay of parameters that are not biases or layer norms.
    pub weight_decay: f64,
    /// Maximum global gradient norm.
    pub gradient_clip_val: f64,
    /// Seed for shuffling the training samples.
    pub seed: u64,
    /// CSV file with `Q`, `A` and `label` columns.
    pub data_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    /// Hugging Face Hub name of the pretrained model.
    pub model_name: String,
    pub model_revision: Option<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            max_len: 32,
            batch_size: 96,
            lr: 5e-5,
            warmup_ratio: 0.1,
            max_epochs: 3,
            weight_decay: 0.01,
            gradient_clip_val: 1.0,
            seed: 42,
            data_path: PathBuf::from("Chatbot_data/ChatbotData.csv"),
            checkpoint_dir: PathBuf::from("model_chp"),
            model_name: "skt/kogpt2-base-v2".to_string(),
            model_revision: None,
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let file = File::open(path).context(OpenSnafu { path })?;
    serde_json::from_reader(BufReader::new(file)).context(ParseSnafu { path })
}

impl TrainConfig {
    /// Read a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }
}

/// Chat configuration.
///
/// Fields that are missing from a configuration file take their default
/// values.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// Fine-tuned parameters saved by training.
    pub model_params: PathBuf,
    /// Sentiment of the system: `0` is neutral, `1` negative and `2`
    /// positive.
    pub sentiment: String,
    /// Hugging Face Hub name of the emotion classifier.
    pub classifier_name: String,
    /// Hugging Face Hub name of the emotion classifier's tokenizer.
    pub classifier_tokenizer: String,
    /// Maximum number of pieces in a response.
    pub max_response_len: usize,
    /// Directory for the emotion charts.
    pub plot_dir: PathBuf,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            model_params: PathBuf::from("model_chp/model_-last.safetensors"),
            sentiment: "0".to_string(),
            classifier_name: "JasonJeon/KcElectra_sentiment".to_string(),
            classifier_tokenizer: "beomi/KcELECTRA-base-v2022".to_string(),
            max_response_len: 64,
            plot_dir: PathBuf::from("."),
        }
    }
}

impl ChatConfig {
    /// Read a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_json(path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{ChatConfig, TrainConfig};

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        fs::write(&path, r#"{"max_len": 64, "data_path": "data.csv"}"#).unwrap();

        let config = TrainConfig::from_file(&path).unwrap();
        assert_eq!(config.max_len, 64);
        assert_eq!(config.data_path, PathBuf::from("data.csv"));
        assert_eq!(config.batch_size, 96);
        assert_eq!(config.model_name, "skt/kogpt2-base-v2");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        fs::write(&path, r#"{"max_len": "long"}"#).unwrap();

        assert!(TrainConfig::from_file(&path).is_err());
        assert!(TrainConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn reads_chat_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        fs::write(
            &path,
            r#"{"sentiment": "2", "model_params": "model_chp/model_-00-1.23.safetensors"}"#,
        )
        .unwrap();

        let config = ChatConfig::from_file(&path).unwrap();
        assert_eq!(
            config,
            ChatConfig {
                sentiment: "2".to_string(),
                model_params: PathBuf::from("model_chp/model_-00-1.23.safetensors"),
                ..ChatConfig::default()
            }
        );

        fs::write(&path, r#"{"max_response_len": -1}"#).unwrap();
        assert!(ChatConfig::from_file(&path).is_err());
    }
}
