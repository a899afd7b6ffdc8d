/// JSON-array serializer for item streams
///
/// Encodes a lazy item sequence as the chunks of one JSON array document,
/// one chunk per item, so persisting a sequence never buffers it whole.

use crate::stream::{ByteStream, ItemStream};
use bytes::Bytes;
use futures::StreamExt;

pub fn json_array_bytes(mut items: ItemStream) -> ByteStream {
    Box::pin(async_stream::try_stream! {
        yield Bytes::from_static(b"[");

        let mut first = true;
        while let Some(item) = items.next().await {
            let item = item?;
            let mut chunk = Vec::with_capacity(128);
            if !first {
                chunk.push(b',');
            }
            first = false;
            serde_json::to_writer(&mut chunk, &item)?;
            yield Bytes::from(chunk);
        }

        yield Bytes::from_static(b"]");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use serde_json::{json, Value};

    fn from_values(values: Vec<Value>) -> ItemStream {
        futures::stream::iter(values.into_iter().map(Ok)).boxed()
    }

    async fn concat(stream: ByteStream) -> Result<Vec<u8>, PipelineError> {
        let chunks: Vec<_> = stream.collect().await;
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn empty_sequence_is_an_empty_array() {
        let bytes = concat(json_array_bytes(from_values(vec![]))).await.unwrap();
        assert_eq!(bytes, b"[]");
    }

    #[tokio::test]
    async fn items_are_comma_separated() {
        let bytes = concat(json_array_bytes(from_values(vec![json!({"v": 1}), json!("two")])))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!([{"v": 1}, "two"]));
    }

    #[tokio::test]
    async fn upstream_error_terminates_the_stream() {
        let items: ItemStream = futures::stream::iter(vec![
            Ok(json!(1)),
            Err(PipelineError::Parse("bad item".to_string())),
        ])
        .boxed();
        let err = concat(json_array_bytes(items)).await.unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }
}
