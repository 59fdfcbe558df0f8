// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Header-based routing patterns, mirroring the broker's `x-match` semantics
//! on the application headers of a message.

use lapin::types::{AMQPValue, FieldTable};
use std::collections::BTreeMap;

pub const AMQP_HEADERS_MATCH: &str = "x-match";

#[derive(Debug, Clone, PartialEq)]
pub struct HeadersPattern {
    all: bool,
    headers: BTreeMap<String, AMQPValue>,
}

impl HeadersPattern {
    /// Builds a pattern from binding arguments. Keys starting with `x-` are
    /// broker directives and never compared; `x-match` selects the mode and
    /// anything other than `all` means `any`.
    pub fn new(arguments: &FieldTable) -> HeadersPattern {
        let mut all = false;
        let mut headers = BTreeMap::new();

        for (key, value) in arguments.inner() {
            let key = key.as_str();
            if key == AMQP_HEADERS_MATCH {
                all = match value {
                    AMQPValue::LongString(mode) => mode.as_bytes() == b"all",
                    AMQPValue::ShortString(mode) => mode.as_str() == "all",
                    _ => false,
                };
                continue;
            }
            if key.starts_with("x-") {
                continue;
            }
            headers.insert(key.to_owned(), value.clone());
        }

        HeadersPattern { all, headers }
    }

    pub fn matches(&self, app_headers: &BTreeMap<String, AMQPValue>) -> bool {
        if self.all {
            self.match_all(app_headers)
        } else {
            self.match_any(app_headers)
        }
    }

    fn match_all(&self, app_headers: &BTreeMap<String, AMQPValue>) -> bool {
        self.headers
            .iter()
            .all(|(key, value)| app_headers.get(key) == Some(value))
    }

    fn match_any(&self, app_headers: &BTreeMap<String, AMQPValue>) -> bool {
        self.headers
            .iter()
            .any(|(key, value)| app_headers.get(key) == Some(value))
    }
}
