//! Fine-tuning and chatting with a Korean dialogue model that tracks the
//! emotions of its user.

pub mod batch;
pub mod chat;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod device;
pub mod generate;
pub mod loss;
pub mod optim;
pub mod plot;
pub mod sentiment;
pub mod tokens;
pub mod train;
