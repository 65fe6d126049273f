//! Transformer models for Korean dialogue generation and emotion
//! classification, built on candle.

pub mod architectures;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod models;
pub mod repository;
pub mod tokenizers;
pub mod util;
