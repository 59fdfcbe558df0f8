// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Inbound message as seen by handlers.

use crate::{
    content::{Content, ContentParser},
    errors::ContentError,
    transport::{ChannelHandle, Delivery},
};
use lapin::types::AMQPValue;
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt};

pub struct Message {
    body: Result<Content, ContentError>,
    exchange: String,
    routing_key: String,
    app_headers: BTreeMap<String, AMQPValue>,
    x_headers: BTreeMap<String, AMQPValue>,
    delivery: Delivery,
    channel: ChannelHandle,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("body", &self.body)
            .finish()
    }
}

impl Message {
    /// Parses the delivery body and splits its headers. A decode or parse
    /// failure is kept on the message instead of being returned.
    pub(crate) fn new(delivery: Delivery, channel: ChannelHandle, parser: &ContentParser) -> Message {
        let body = parser.parse(
            &delivery.data,
            delivery.content_encoding.as_deref(),
            delivery.content_type.as_deref(),
        );

        let mut app_headers = BTreeMap::new();
        let mut x_headers = BTreeMap::new();
        for (key, value) in delivery.headers.inner() {
            let key = key.as_str();
            match key.strip_prefix("x-").or_else(|| key.strip_prefix("X-")) {
                Some(name) => {
                    x_headers.insert(name.to_lowercase(), value.clone());
                }
                None => {
                    app_headers.insert(key.to_owned(), value.clone());
                }
            }
        }

        Message {
            body,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            app_headers,
            x_headers,
            delivery,
            channel,
        }
    }

    /// Decoded and parsed body, `None` when decoding or parsing failed.
    pub fn body(&self) -> Option<&Content> {
        self.body.as_ref().ok()
    }

    pub fn parse_error(&self) -> Option<&ContentError> {
        self.body.as_ref().err()
    }

    /// Deserializes a JSON body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ContentError> {
        match &self.body {
            Ok(Content::Json(value)) => serde_json::from_value(value.clone())
                .map_err(|err| ContentError::InvalidJson(err.to_string())),
            Ok(Content::Text(text)) => serde_json::from_str(text)
                .map_err(|err| ContentError::InvalidJson(err.to_string())),
            Ok(Content::Raw(bytes)) => serde_json::from_slice(bytes)
                .map_err(|err| ContentError::InvalidJson(err.to_string())),
            Err(err) => Err(err.clone()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    /// Headers set by the publisher.
    pub fn app_headers(&self) -> &BTreeMap<String, AMQPValue> {
        &self.app_headers
    }

    /// Broker headers with the `x-` prefix removed and the name lowercased.
    pub fn x_headers(&self) -> &BTreeMap<String, AMQPValue> {
        &self.x_headers
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Acknowledges the message, or every unacknowledged message up to it.
    /// Returns `false` when the channel it arrived on is gone.
    pub async fn ack(&self, all_up_to: bool) -> bool {
        self.channel.ack(self.delivery.delivery_tag, all_up_to).await
    }

    pub async fn nack(&self, all_up_to: bool, requeue: bool) -> bool {
        self.channel
            .nack(self.delivery.delivery_tag, all_up_to, requeue)
            .await
    }
}
