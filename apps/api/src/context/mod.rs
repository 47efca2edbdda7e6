pub mod handlers;
pub mod merge;
pub mod pack;
pub mod snapshots;
pub mod validation;
