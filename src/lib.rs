// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access.
pub use cloudllm::client_wrapper::{ClientWrapper, Message, Role};
pub use cloudllm::orchestrator::Orchestrator;
