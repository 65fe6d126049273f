pub mod electra;
pub use electra::ElectraSequenceClassifier;

pub mod gpt2;
pub use gpt2::GPT2CausalLM;

pub mod hf;

pub mod transformer;
