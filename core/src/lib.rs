//! ttymux core: session registry, port allocation, worker process lifecycle, control protocol. No HTTP.

pub mod config;
pub mod control;
pub mod manager;
pub mod ports;
pub mod process;
pub mod registry;
