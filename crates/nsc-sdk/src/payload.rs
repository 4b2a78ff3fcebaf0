//! Request and response bodies.
//!
//! A [`Payload`] is either a JSON value or a byte stream. Record streams are
//! framed as newline-delimited JSON so chunk boundaries never matter.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::HandlerError;

pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

pub enum Payload {
    Json(Value),
    Stream(ByteStream),
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// A stream of NDJSON-framed records.
    pub fn records<S, T>(items: S) -> Self
    where
        S: futures::Stream<Item = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        Self::Stream(json_lines(items))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Stream(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Stream(_) => None,
        }
    }

    /// Deserialises a JSON payload into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, HandlerError> {
        match self {
            Self::Json(value) => Ok(serde_json::from_value(value)?),
            Self::Stream(_) => Err(HandlerError::new("expected a JSON payload, got a stream")),
        }
    }

    /// The payload as raw bytes. A JSON payload becomes a single chunk.
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Stream(stream) => stream,
            Self::Json(value) => {
                let chunk = serde_json::to_vec(&value).map(Bytes::from).map_err(io::Error::other);
                stream::once(async move { chunk }).boxed()
            }
        }
    }

    /// Decodes an NDJSON stream into records. A JSON array payload yields its elements.
    pub fn into_records(self) -> BoxStream<'static, Result<Value, io::Error>> {
        match self {
            Self::Stream(stream) => decode_json_lines(stream),
            Self::Json(Value::Array(items)) => stream::iter(items.into_iter().map(Ok)).boxed(),
            Self::Json(value) => stream::once(async move { Ok(value) }).boxed(),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Encodes each item as one JSON line.
pub fn json_lines<S, T>(items: S) -> ByteStream
where
    S: futures::Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    items
        .map(|item| {
            let mut line = serde_json::to_vec(&item).map_err(io::Error::other)?;
            line.push(b'\n');
            Ok::<_, io::Error>(Bytes::from(line))
        })
        .boxed()
}

/// Decodes an NDJSON byte stream, whatever its chunking.
pub fn decode_json_lines(stream: ByteStream) -> BoxStream<'static, Result<Value, io::Error>> {
    stream::unfold(
        (stream, JsonLinesDecoder::default(), Vec::new(), false),
        |(mut stream, mut decoder, mut ready, mut done)| async move {
            loop {
                if !ready.is_empty() {
                    let next = ready.remove(0);
                    return Some((next, (stream, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                    Some(Err(err)) => {
                        done = true;
                        ready.push(Err(err));
                    }
                    None => {
                        done = true;
                        ready.extend(std::mem::take(&mut decoder).finish());
                    }
                }
            }
        },
    )
    .boxed()
}

/// Incremental NDJSON decoder.
#[derive(Debug, Default)]
pub struct JsonLinesDecoder {
    buffer: Vec<u8>,
}

impl JsonLinesDecoder {
    /// Feeds a chunk and returns every record it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Value, io::Error>> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(record) = parse_line(&line[..line.len() - 1]) {
                records.push(record);
            }
        }
        records
    }

    /// Flushes a trailing record that has no newline.
    pub fn finish(self) -> Option<Result<Value, io::Error>> {
        parse_line(&self.buffer)
    }
}

fn parse_line(line: &[u8]) -> Option<Result<Value, io::Error>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(trimmed).map_err(io::Error::other))
}
