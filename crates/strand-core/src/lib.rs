pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{GraphAssemblyError, Result, StrandError};
pub use event::EventBus;
pub use traits::{Agent, LlmClient, ProgressSink};
pub use types::*;
