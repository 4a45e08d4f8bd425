pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod scanner;
pub mod storage;

pub use config::AppConfig;
pub use engine::{CrawlEngine, SyncSummary};
pub use error::Error;
pub use pipeline::Stage;
pub use progress::{ProgressReporter, SilentReporter};
