pub mod classify;
pub mod config;
pub mod executor;
pub mod links;
pub mod llm_client;
pub mod media;
pub mod outline;
pub mod resolution;
pub mod session;
pub mod store;
pub mod transcript;
