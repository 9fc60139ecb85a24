//! Infrastructure layer

pub mod app_log;
pub mod compose;
pub mod docker;
pub mod process;
pub mod sqlite;
