//! pl_core — send/receive pipelines and the public messaging API
//!
//! The application talks to [`AppInterface`]; the network, the provisioning
//! server and the application callbacks are injected as capability traits
//! (see [`collaborators`]). All ratchet mutation for a local user runs on a
//! single background processor (the run queue): API entry points enqueue
//! work and return, which linearizes session updates and makes crash
//! recovery a matter of replaying the durable raw/temp queues in sequence
//! order.
//!
//! # Modules
//! - `api`           — [`AppInterface`]: registration, send, receive, session control
//! - `collaborators` — provisioning / transport / app-callback traits
//! - `descriptor`    — message-descriptor and error-detail JSON helpers
//! - `queue`         — the single-threaded run queue
//! - `send`          — device resolution, session bootstrap, encrypt, framing
//! - `receive`       — duplicate suppression, decrypt, crash-safe commit
//! - `error`         — unified error type with numeric codes

pub mod api;
pub mod collaborators;
pub mod descriptor;
pub mod error;
mod queue;
mod receive;
mod send;

pub use api::{AppInterface, CoreConfig, SessionInfo};
pub use collaborators::{AppCallbacks, DeviceInfo, PreKeyBundle, Provisioning, Transport, TransportItem};
pub use error::CoreError;
