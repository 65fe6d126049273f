//! Models initialized from Hugging Face `transformers` checkpoints.
mod checkpoint;
pub use checkpoint::{HFCheckpointError, LoadHFCheckpoint};

mod from_hf;
pub use from_hf::{FromHF, FromHFError, HFConfigWithDType, TrainableModel};

mod hf_hub;
pub use hf_hub::{FromHFHub, FromHfHubError};
