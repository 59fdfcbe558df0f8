// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers and Routing Rules
//!
//! A queue may carry several handlers, each registered for one exchange and
//! one routing rule. The rule is what the queue binding was created with, so
//! the same expression decides which handler of the queue gets a message:
//!
//! - an empty routing key matches every message of the exchange;
//! - a routing key without `.` must equal the message routing key;
//! - a routing key with `.` is a topic pattern;
//! - routing headers match the message application headers.

use crate::{
    errors::HandlerError,
    headers_pattern::{HeadersPattern, AMQP_HEADERS_MATCH},
    message::Message,
    topic_pattern::TopicPattern,
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};

/// Application callback for delivered messages. An error returned here is
/// logged, recorded on the delivery span and left for the transport to report;
/// the message is neither acked nor nacked on the handler's behalf.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &Message) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersMatch {
    All,
    Any,
}

/// Header routing rule: the binding arguments of a headers exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingHeaders {
    mode: HeadersMatch,
    headers: BTreeMap<String, AMQPValue>,
}

impl RoutingHeaders {
    pub fn all() -> RoutingHeaders {
        RoutingHeaders {
            mode: HeadersMatch::All,
            headers: BTreeMap::new(),
        }
    }

    pub fn any() -> RoutingHeaders {
        RoutingHeaders {
            mode: HeadersMatch::Any,
            headers: BTreeMap::new(),
        }
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn mode(&self) -> HeadersMatch {
        self.mode
    }

    /// Binding arguments, `x-match` included.
    pub fn arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        let mode = match self.mode {
            HeadersMatch::All => "all",
            HeadersMatch::Any => "any",
        };
        arguments.insert(
            ShortString::from(AMQP_HEADERS_MATCH),
            AMQPValue::LongString(LongString::from(mode)),
        );
        for (key, value) in &self.headers {
            arguments.insert(ShortString::from(key.as_str()), value.clone());
        }
        arguments
    }
}

/// Routing rule a handler is registered with.
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    Key(String),
    Headers(RoutingHeaders),
}

impl From<&str> for Routing {
    fn from(key: &str) -> Self {
        Routing::Key(key.to_owned())
    }
}

impl From<String> for Routing {
    fn from(key: String) -> Self {
        Routing::Key(key)
    }
}

impl From<RoutingHeaders> for Routing {
    fn from(headers: RoutingHeaders) -> Self {
        Routing::Headers(headers)
    }
}

impl Routing {
    /// Routing key and arguments of the matching queue or exchange binding.
    pub(crate) fn binding(&self) -> (String, Option<FieldTable>) {
        match self {
            Routing::Key(key) => (key.clone(), None),
            Routing::Headers(headers) => (String::new(), Some(headers.arguments())),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RoutingMatcher {
    Any,
    Exact(String),
    Topic(TopicPattern),
    Headers(HeadersPattern),
}

impl RoutingMatcher {
    pub(crate) fn new(routing: &Routing) -> RoutingMatcher {
        match routing {
            Routing::Key(key) if key.is_empty() => RoutingMatcher::Any,
            Routing::Key(key) if !key.contains('.') => RoutingMatcher::Exact(key.clone()),
            Routing::Key(key) => RoutingMatcher::Topic(TopicPattern::new(key)),
            Routing::Headers(headers) => {
                RoutingMatcher::Headers(HeadersPattern::new(&headers.arguments()))
            }
        }
    }

    pub(crate) fn matches(&self, msg: &Message) -> bool {
        match self {
            RoutingMatcher::Any => true,
            RoutingMatcher::Exact(key) => key == msg.routing_key(),
            RoutingMatcher::Topic(pattern) => pattern.matches(msg.routing_key()),
            RoutingMatcher::Headers(pattern) => pattern.matches(msg.app_headers()),
        }
    }
}

/// Handler registered on a queue for one exchange and routing rule.
#[derive(Clone)]
pub(crate) struct Consumer {
    pub(crate) exchange: String,
    pub(crate) matcher: RoutingMatcher,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl Consumer {
    pub(crate) fn accepts(&self, msg: &Message) -> bool {
        self.exchange == msg.exchange() && self.matcher.matches(msg)
    }
}
