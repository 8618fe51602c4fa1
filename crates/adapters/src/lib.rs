#![forbid(unsafe_code)]

pub mod csv;
pub mod keystore;
pub mod schedule;
pub mod tracing_sink;
