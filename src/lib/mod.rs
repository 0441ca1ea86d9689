pub mod config;
pub mod tasks;
pub mod worker;
