//! Courier Publisher - ordered, at-least-once delivery to a set of servers
//!
//! The publisher takes batches of events from a spool channel, spreads
//! them across endpoints according to the configured method, resends
//! whatever a failed endpoint left unacknowledged, and commits progress to
//! a [`Registrar`] strictly in the order batches were submitted.
//!
//! # Example
//!
//! ```ignore
//! let publisher = Publisher::builder(config.network.clone())
//!     .registrar(commits_tx)
//!     .build()?;
//! let status = publisher.status_handle();
//! tokio::spawn(publisher.run(spool_rx, reload_rx, shutdown.clone()));
//! ```

mod endpoint;
mod error;
mod payload;
mod publisher;
mod registrar;
mod scheduler;
mod sink;
mod speed;
mod status;

pub mod method;

pub use endpoint::{AckOutcome, Endpoint, EndpointStatus};
pub use error::{PublisherError, Result};
pub use payload::{Payload, PayloadKey, Rollup, SourceOffset};
pub use publisher::{FactoryBuilder, Publisher, PublisherBuilder, default_factory};
pub use registrar::{Commit, LogRegistrar, Registrar};
pub use scheduler::Scheduler;
pub use sink::{EndpointSink, PlacementError, SinkObserver, Timeout, TimerAction, TimerKey};
pub use speed::SpeedEstimator;
pub use status::{EndpointSnapshot, PublisherStatus, StatusHandle};
