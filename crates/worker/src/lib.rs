pub mod consumer;
pub mod error;
pub mod health;
pub mod processor;
