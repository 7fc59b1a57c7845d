pub mod config;
pub mod errors;
pub mod export;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod supervisor;
