/// Lazy item and byte sequences
///
/// Node handlers exchange data as boxed streams so no handler has to hold a
/// whole dataset in memory. This module defines the stream aliases, the
/// file-backed input adapter and the JSON-array serializer used to persist
/// sequences between nodes.

use crate::error::PipelineResult;
use bytes::Bytes;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

// Streaming input adapter (file -> lazy items)
pub mod reader;

// JSON-array serializer (lazy items -> bytes)
pub mod writer;

/// Single-pass lazy sequence of JSON items
pub type ItemStream = Pin<Box<dyn Stream<Item = PipelineResult<Value>> + Send + 'static>>;

/// Single-pass lazy sequence of raw byte chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = PipelineResult<Bytes>> + Send + 'static>>;

pub use reader::{open_items, open_items_chain, ReadOptions};
pub use writer::json_array_bytes;
