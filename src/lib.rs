pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod provider;
pub mod secret;
pub mod validation;

mod api;
mod flock;

pub use api::{RepositoryManager, RepositoryManagerBuilder};
pub use error::RepositoryError;
pub use model::{Repository, RepositoryRef};
