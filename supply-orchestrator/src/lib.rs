pub mod algorithm;
pub mod clients;
pub mod commands;
pub mod config;
pub mod dispatcher_job;
pub mod error;
pub mod fanout;
pub mod generator;
pub mod recovery;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod workflow;

pub use clients::Clients;
pub use config::Settings;
pub use error::{OrchestratorError, Result};
pub use generator::Generator;
pub use recovery::{RecoveryReport, Recoverer};
pub use store::{memory::MemoryStore, Store, StoreError};
pub use workflow::Engine;
