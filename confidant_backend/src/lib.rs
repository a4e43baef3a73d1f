pub mod affect;
pub mod classification;
pub mod config;
pub mod llm_client;
pub mod memory;
pub mod persona;
pub mod reconstruct;
pub mod runtime;
pub mod safety;
pub mod server;
pub mod session;
pub mod taxonomy;
pub mod transcript;
pub mod turn;
