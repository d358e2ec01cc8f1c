pub mod cache;
pub mod config;
pub mod history;
pub mod index;
pub mod job;
pub mod lifecycle;
pub mod outputs;
pub mod reconcile;
pub mod scheduler;
