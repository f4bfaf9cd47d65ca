//! Pretraining stage for the arc language model
//!
//! Trainer adapters around the arc forward pass: loss/metric aggregation for
//! the LM and arc objectives, the optimizer step with a warmup/warmdown LR
//! schedule, and the training loop. Batch supply (tokenization, corpus
//! loading, sharding) is the caller's concern.

pub mod config;
pub mod metrics;
pub mod optimizer;
pub mod train;
