pub mod catalog;
pub mod chip;
pub mod config;
pub mod interconnect;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod sm;
pub mod warp;
