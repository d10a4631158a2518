//! avalanche: a chained batch pipeline.
//!
//! Four stages, each a separate job run:
//!
//! 1. `ingest` fetches a JSON batch over HTTP and lands it in the raw bucket.
//! 2. `process` enriches the batch and overwrites its partition of a Delta
//!    table in the processed bucket.
//! 3. `process-spark` does the same on a pool of workers.
//! 4. `dispatch` reads one partition back and posts each row downstream.
//!
//! Every stage ends by handing its artifact to the [`coordinator`], which
//! submits the next stage through a [`coordinator::JobLauncher`].
//!
//! # Example
//!
//! ```ignore
//! use avalanche::config::{Settings, StageCommand};
//! use avalanche::stage::{self, StageContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = StageContext::new(Settings::default())?;
//!     let command = StageCommand::from_arguments("dispatch", &arguments)?;
//!     let report = stage::run(&ctx, command).await?;
//!     ctx.launcher.wait_idle().await;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod identifier;
pub mod logging;
pub mod metrics;
pub mod query;
pub mod record;
pub mod sink;
pub mod source;
pub mod stage;
pub mod storage;
pub mod transform;

// Re-export main types
pub use config::{Settings, StageCommand};
pub use coordinator::{Artifact, Coordinator, RunState, RunStatus};
pub use stage::{StageContext, StageReport, run};
pub use storage::{StorageProvider, StorageProviderRef};
