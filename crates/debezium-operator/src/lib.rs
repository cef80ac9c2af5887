//! debezium-operator: Kubernetes operator converging Kafka Connect connectors
//! to DebeziumConnector resources

pub mod bootstrap;
pub mod compare;
pub mod config;
pub mod connect;
pub mod controllers;
pub mod crd;
pub mod finalizer;
pub mod health;
pub mod leader;
pub mod metrics;
pub mod status;
pub mod store;
pub mod validation;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use crd::DebeziumConnector;
