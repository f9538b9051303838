pub mod consumer;
pub mod queue;
