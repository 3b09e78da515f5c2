pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod machine;
pub mod observer;
pub mod paths;
pub mod plugin;
pub mod retry;
pub mod state;
pub mod task;
pub mod types;

pub use error::{FlowError, Result};
