pub mod alerts;
pub mod approvals;
pub mod audit;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod import;
pub mod principal;
pub mod ranker;
pub mod safety;
pub mod scheduler;
pub mod template;
pub mod triggers;
pub mod vault;
pub mod worker;

pub use engine::RunbookEngine;
pub use error::{AppError, AppResult};
pub use executor::ExecutorFactory;
pub use principal::Principal;
pub use vault::SecretVault;
