pub mod api;
pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod tickets;
pub mod tools;
pub mod upstream;
