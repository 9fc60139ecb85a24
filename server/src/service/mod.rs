//! Service layer

pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod service_manager;
