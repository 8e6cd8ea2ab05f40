pub mod cache;
pub mod domain;
pub mod error;
pub mod handler;
pub mod model;
pub mod nat;
pub mod orchestrator;
pub mod spec;
pub mod variants;
