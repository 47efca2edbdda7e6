pub mod handlers;
pub mod registry;
pub mod state_store;
