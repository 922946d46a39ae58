//! Carbonsink - Graphite to ClickHouse ingestion daemon
//!
//! Accepts Graphite metrics over TCP, UDP and the pickle protocol, buffers them
//! in local RowBinary files and uploads finished files to ClickHouse.
//!
//! # Architecture
//!
//! - **Receivers**: network listeners feeding a shared write channel
//! - **Writer**: sole consumer of the write channel, rotating local files
//! - **Uploader**: ships finished files to ClickHouse data and tree tables
//! - **Collector**: periodic self-metrics
//! - **App**: the supervisor that starts and stops all of the above
//!
//! # Example
//!
//! ```rust,no_run
//! use carbonsink::App;
//!
//! # async fn run() -> Result<(), carbonsink::AppError> {
//! let app = App::new("/etc/carbonsink.yaml");
//! app.start().await?;
//! app.run_loop().await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod collector;
pub mod concurrency;
pub mod config;
pub mod receiver;
pub mod row;
pub mod uploader;
pub mod writer;

pub use app::{App, AppError, AppState, AppStatus};
pub use config::{Config, ConfigError};
pub use receiver::{Receiver, ReceiverError, ReceiverKind};
pub use row::{Point, WriteBuffer};
pub use uploader::{Uploader, UploaderBuilder, UploaderError};
pub use writer::{Writer, WriterError};
