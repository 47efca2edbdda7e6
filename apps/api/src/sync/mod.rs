pub mod fetcher;
pub mod handlers;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub mod testing;
