pub mod context;
pub mod source;
pub mod sync_state;
pub mod user;
