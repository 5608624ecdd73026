//! The central module containing the core logic and data structures of the
//! daemon: the command model, its router and local transport, the dataset
//! manager, the broker interface, the metric facade, and the supervisor
//! that ties them together into a running process.

pub mod broker;
pub mod command;
pub mod dataset;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod receiver;
pub mod registry;
pub mod router;
pub mod serializer;
pub mod supervisor;

pub use command::Command;
pub use errors::CoreError;
