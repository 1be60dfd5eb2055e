pub mod config;
pub mod deep_eq;
pub mod event;
pub mod model;

// Single-flight named tasks
pub mod command;

// Collaborator seams
pub mod bus;
pub mod kvs;
pub mod runtime;
