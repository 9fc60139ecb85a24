//! Domain models

pub mod container;
pub mod execution;
pub mod manifest;
pub mod sandbox;
pub mod service;
pub mod types;
