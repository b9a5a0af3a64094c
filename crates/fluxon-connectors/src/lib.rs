//! External collaborators of the fluxon pipeline.
//!
//! [`ingress`] fills the pipeline's buffer pool from a TCP stream of
//! newline-delimited JSON; [`pulsar`] drains serialized batches into a
//! Pulsar topic. Both adapt external services to the narrow interfaces
//! `fluxon-core` defines, and nothing in the core depends on them.

pub mod ingress;
pub mod pulsar;

pub use ingress::{ClientOptions, StreamClient};
pub use pulsar::{BatchingOptions, PulsarOptions, PulsarProducer};
