//! Model and tokenizer repositories.

mod hf_hub;
pub use hf_hub::{HfHubRepo, HfHubRepoError};

mod local;
pub use local::LocalRepo;

mod repo;
pub use repo::Repo;
