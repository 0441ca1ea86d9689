pub mod api;
pub mod stats;
pub mod store;
pub mod types;
pub mod worker;
