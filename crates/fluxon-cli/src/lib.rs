//! The fluxon command-line tool: an end-to-end stream driver and a set
//! of stage micro-benchmarks over `fluxon-core` and
//! `fluxon-connectors`.

pub mod bench;
pub mod cli;
pub mod stream;
