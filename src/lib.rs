// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! Declares exchanges, queues and bindings against RabbitMQ, restores them
//! after every channel loss and routes inbound messages to the handler whose
//! routing key or headers pattern matches.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod content;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod headers_pattern;
pub mod message;
pub mod queue;
pub mod topic_pattern;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod mocks;
