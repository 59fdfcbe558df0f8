// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Topology Layer
//!
//! `AmqpError` covers everything that can go wrong while declaring and
//! restoring topology: configuration conflicts and missing binding endpoints
//! (raised synchronously at the call site) and transport failures during a
//! setup cycle (reported asynchronously through `ManagerEvent::SetupFailed`).
//!
//! `ContentError` is the per-message decode/parse failure. It is stored on the
//! `Message` instead of being raised, so one bad payload never halts a consumer.

use std::fmt;
use thiserror::Error;

/// Describes which part of a redeclaration disagreed with the first declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    ExchangeKind,
    ExchangeOptions,
    QueueDeclareOptions,
    QueueConsumeOptions,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::ExchangeKind => write!(f, "type mismatch"),
            ConflictKind::ExchangeOptions => write!(f, "options mismatch"),
            ConflictKind::QueueDeclareOptions => write!(f, "declare options mismatch"),
            ConflictKind::QueueConsumeOptions => write!(f, "consume options mismatch"),
        }
    }
}

/// Represents errors that can occur during topology and transport operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// An exchange or queue was redeclared with a different kind or options
    #[error("cannot declare `{name}`: {conflict}")]
    ConfigurationConflict { name: String, conflict: ConflictKind },

    /// A binding references an exchange or queue that was never declared
    #[error("cannot bind: {role} `{name}` not declared")]
    BindingPrerequisiteMissing { role: &'static str, name: String },

    /// The manager was closed, explicitly or after a setup failure
    #[error("topology manager is closed")]
    ManagerClosed,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// No live channel could be obtained from the transport
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring or checking an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring or checking a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to another exchange
    #[error("failure to bind exchange `{0}` to exchange `{1}`")]
    BindingExchangeError(String, String),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

/// Decode or parse failure of a single delivery body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("unknown encoding {0}")]
    UnknownEncoding(String),

    #[error("unknown mime type {0}")]
    UnknownMimeType(String),

    #[error("unknown charset {0}")]
    UnknownCharset(String),

    #[error("failure to decode content: {0}")]
    Decode(String),

    #[error("invalid json: {0}")]
    InvalidJson(String),
}

/// Error returned by message handlers. It is never suppressed by the routing
/// engine and surfaces at the transport consumer loop.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
