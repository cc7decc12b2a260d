pub mod config;
pub mod hooks;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod scheduler;
pub mod terminal;
pub mod tools;
