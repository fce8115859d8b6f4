// emendare-daemon library entry point.

pub mod config;
pub mod engine;
pub mod notify;
pub mod rpc;
pub mod runtime;
pub mod startup;
pub mod store;
