pub mod artifacts;
pub mod error;
pub mod graph;
pub mod handlers;
pub mod identity;
pub mod idle_reaper;
pub mod launcher;
pub mod liveness;
pub mod reaper;
pub mod registry;
pub mod result_store;
pub mod security;
pub mod session;
pub mod settings;
pub mod state;
pub mod worker;
