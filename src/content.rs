// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Content Decoding and Parsing
//!
//! A delivery body goes through two stages before it reaches a handler:
//!
//! 1. decoders, selected by the `content-encoding` property and applied in
//!    the listed order (`"gzip, base64"` runs gzip first), or the default
//!    decoder when no encoding is set;
//! 2. a parser, selected by the MIME type of the `content-type` property and
//!    given its optional `charset` parameter, or the default parser when no
//!    content type is set.
//!
//! Lookups are case-insensitive. `text/plain` and `application/json` are
//! registered out of the box.

use crate::errors::ContentError;
use std::{collections::HashMap, fmt, sync::Arc};

pub type Decoder = Arc<dyn Fn(Vec<u8>) -> Result<Vec<u8>, ContentError> + Send + Sync>;
pub type Parser = Arc<dyn Fn(&[u8], Option<&str>) -> Result<Content, ContentError> + Send + Sync>;

pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_JSON: &str = "application/json";

/// Decoded and parsed body of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Bytes left untouched because no parser applied.
    Raw(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Content {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Content::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ContentParser {
    decoders: HashMap<String, Decoder>,
    default_decoder: Option<Decoder>,
    parsers: HashMap<String, Parser>,
    default_parser: Option<Parser>,
}

impl fmt::Debug for ContentParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentParser")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("default_decoder", &self.default_decoder.is_some())
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .field("default_parser", &self.default_parser.is_some())
            .finish()
    }
}

impl Default for ContentParser {
    fn default() -> Self {
        let mut parsers: HashMap<String, Parser> = HashMap::new();
        parsers.insert(TEXT_PLAIN.to_owned(), Arc::new(parse_text));
        parsers.insert(APPLICATION_JSON.to_owned(), Arc::new(parse_json));

        ContentParser {
            decoders: HashMap::new(),
            default_decoder: None,
            parsers,
            default_parser: None,
        }
    }
}

impl ContentParser {
    pub fn new() -> ContentParser {
        ContentParser::default()
    }

    pub fn parse(
        &self,
        input: &[u8],
        content_encoding: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<Content, ContentError> {
        let mut data = input.to_vec();

        match content_encoding.filter(|encoding| !encoding.is_empty()) {
            Some(encoding) => {
                let encoding = strip_whitespace(encoding);
                for encoding in encoding.split(',') {
                    let decode = self
                        .decoders
                        .get(&encoding.to_lowercase())
                        .ok_or_else(|| ContentError::UnknownEncoding(encoding.to_owned()))?;
                    data = decode(data)?;
                }
            }
            None => {
                if let Some(decode) = &self.default_decoder {
                    data = decode(data)?;
                }
            }
        }

        match content_type.filter(|content_type| !content_type.is_empty()) {
            Some(content_type) => {
                let content_type = strip_whitespace(content_type);
                let (mime_type, charset) = match content_type.split_once(";charset=") {
                    Some((mime_type, charset)) => (mime_type, Some(charset)),
                    None => (content_type.as_str(), None),
                };

                let parse = self
                    .parsers
                    .get(&mime_type.to_lowercase())
                    .ok_or_else(|| ContentError::UnknownMimeType(mime_type.to_owned()))?;
                parse(&data, charset)
            }
            None => match &self.default_parser {
                Some(parse) => parse(&data, None),
                None => Ok(Content::Raw(data)),
            },
        }
    }

    /// Registers or replaces the decoder of a `content-encoding` token.
    /// Tokens are matched case-insensitively.
    pub fn set_decoder(&mut self, encoding: &str, decoder: Decoder) {
        self.decoders.insert(encoding.to_lowercase(), decoder);
    }

    /// Decoder applied when a message carries no `content-encoding`.
    pub fn set_default_decoder(&mut self, decoder: Decoder) {
        self.default_decoder = Some(decoder);
    }

    /// Registers or replaces the parser of a mime type. The charset parameter
    /// of a `content-type` is passed to the parser, not matched.
    pub fn set_parser(&mut self, mime_type: &str, parser: Parser) {
        self.parsers.insert(mime_type.to_lowercase(), parser);
    }

    /// Parser applied when a message carries no `content-type`. Without one
    /// the body is kept as raw bytes.
    pub fn set_default_parser(&mut self, parser: Parser) {
        self.default_parser = Some(parser);
    }
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Decodes text in one of the supported charsets. Missing charset means UTF-8.
pub fn decode_charset(input: &[u8], charset: Option<&str>) -> Result<String, ContentError> {
    let Some(charset) = charset else {
        return decode_utf8(input);
    };

    match charset.to_lowercase().as_str() {
        "utf-8" | "utf8" => decode_utf8(input),
        "utf-16le" => {
            if input.len() % 2 != 0 {
                return Err(ContentError::Decode("odd number of bytes for utf-16le".to_owned()));
            }
            let units: Vec<u16> = input
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).map_err(|err| ContentError::Decode(err.to_string()))
        }
        "us-ascii" | "ascii" => {
            if !input.is_ascii() {
                return Err(ContentError::Decode("non-ascii byte".to_owned()));
            }
            decode_utf8(input)
        }
        "iso-8859-1" | "latin1" => Ok(input.iter().map(|&byte| byte as char).collect()),
        _ => Err(ContentError::UnknownCharset(charset.to_owned())),
    }
}

fn decode_utf8(input: &[u8]) -> Result<String, ContentError> {
    String::from_utf8(input.to_vec()).map_err(|err| ContentError::Decode(err.to_string()))
}

fn parse_text(input: &[u8], charset: Option<&str>) -> Result<Content, ContentError> {
    decode_charset(input, charset).map(Content::Text)
}

fn parse_json(input: &[u8], _charset: Option<&str>) -> Result<Content, ContentError> {
    serde_json::from_slice(input)
        .map(Content::Json)
        .map_err(|err| ContentError::InvalidJson(err.to_string()))
}
