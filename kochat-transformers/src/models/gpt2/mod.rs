mod causal_lm;
pub use causal_lm::{GPT2CausalLM, HFGPT2CausalLMConfig};

mod decoder;
pub use decoder::{GPT2Decoder, HFGPT2DecoderConfig};
