/// Streaming input adapter
///
/// Turns a JSON file into a lazy sequence of items without loading the file.
/// The first non-whitespace byte decides the shape: `[` means every top-level
/// element is one item, anything else is a single document yielded as the
/// sole item (or, when an items key is configured and present, the elements
/// of that nested array).
///
/// Parsing runs on a blocking thread and hands items over a bounded channel,
/// so the reader never gets more than `CHANNEL_CAPACITY` items ahead of the
/// consumer. Consumers that must stay in step with their own writes (the
/// database destinations) ask for `ReadOptions::lockstep`, which shrinks the
/// channel to one slot: at most one parsed item waits while the previous one
/// is being inserted.

use crate::error::{PipelineError, PipelineResult};
use crate::stream::ItemStream;
use serde::de::{Deserialize, Deserializer as _, SeqAccess, Visitor};
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 16;
const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Shape of a JSON document, decided from its first significant byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    Array,
    Single,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// For single-object documents: yield the elements of this array field
    /// instead of the object itself, when present
    pub items_key: Option<String>,
    /// Channel slots between parser and consumer; `None` means `CHANNEL_CAPACITY`
    pub read_ahead: Option<usize>,
}

impl ReadOptions {
    pub fn with_items_key(key: impl Into<String>) -> Self {
        Self {
            items_key: Some(key.into()),
            ..Self::default()
        }
    }

    /// One slot: the parser waits for the consumer after every item
    pub fn lockstep() -> Self {
        Self {
            read_ahead: Some(1),
            ..Self::default()
        }
    }

    fn capacity(&self) -> usize {
        self.read_ahead.unwrap_or(CHANNEL_CAPACITY).max(1)
    }
}

/// Peek past leading whitespace and classify the document
///
/// Only whitespace is consumed; the first significant byte stays in the
/// reader's buffer. Returns `None` for an empty or all-whitespace input.
pub fn detect_shape<R: BufRead>(reader: &mut R) -> std::io::Result<Option<DocumentShape>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }

        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(pos) => {
                let shape = if buf[pos] == b'[' {
                    DocumentShape::Array
                } else {
                    DocumentShape::Single
                };
                reader.consume(pos);
                return Ok(Some(shape));
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Open a file as a lazy item sequence
///
/// A missing file is reported immediately as `NotFound`; parse and IO errors
/// met while reading arrive as the final `Err` item of the stream.
pub async fn open_items(path: impl AsRef<Path>, options: ReadOptions) -> PipelineResult<ItemStream> {
    let path = path.as_ref().to_path_buf();
    ensure_file(&path).await?;

    Ok(Box::pin(async_stream::stream! {
        let (tx, mut rx) = mpsc::channel(options.capacity());
        let reader = tokio::task::spawn_blocking(move || read_blocking(path, options, tx));

        while let Some(item) = rx.recv().await {
            yield item;
        }

        if let Err(e) = reader.await {
            yield Err(PipelineError::Io(std::io::Error::other(format!("input reader task failed: {}", e))));
        }
    }))
}

/// Open several files and yield their items back to back, in order
pub async fn open_items_chain(paths: Vec<PathBuf>, options: ReadOptions) -> PipelineResult<ItemStream> {
    for path in &paths {
        ensure_file(path).await?;
    }

    Ok(Box::pin(async_stream::try_stream! {
        for path in paths {
            let mut items = open_items(&path, options.clone()).await?;
            while let Some(item) = futures::StreamExt::next(&mut items).await {
                yield item?;
            }
        }
    }))
}

async fn ensure_file(path: &Path) -> PipelineResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(PipelineError::NotFound(format!("{} is not a file", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PipelineError::NotFound(format!("input file {} does not exist", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

fn read_blocking(path: PathBuf, options: ReadOptions, tx: mpsc::Sender<PipelineResult<Value>>) {
    if let Err(e) = parse_into(&path, &options, &tx) {
        // a closed channel means the consumer stopped early, not a failure
        if !tx.is_closed() {
            let _ = tx.blocking_send(Err(e));
        }
    }
}

fn parse_into(path: &Path, options: &ReadOptions, tx: &mpsc::Sender<PipelineResult<Value>>) -> PipelineResult<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);

    let shape = detect_shape(&mut reader)?
        .ok_or_else(|| PipelineError::Parse(format!("{} is empty", path.display())))?;

    let mut de = serde_json::Deserializer::from_reader(reader);

    match shape {
        DocumentShape::Array => {
            let listening = (&mut de).deserialize_seq(ElementSink { tx })?;
            if !listening {
                return Ok(());
            }
        }
        DocumentShape::Single => {
            let document = Value::deserialize(&mut de)?;
            de.end()?;
            for item in unwrap_document(document, options) {
                if tx.blocking_send(Ok(item)).is_err() {
                    return Ok(());
                }
            }
            return Ok(());
        }
    }

    de.end()?;
    Ok(())
}

fn unwrap_document(document: Value, options: &ReadOptions) -> Vec<Value> {
    if let (Some(key), Value::Object(map)) = (&options.items_key, &document) {
        if let Some(Value::Array(items)) = map.get(key) {
            return items.clone();
        }
    }
    vec![document]
}

/// Visitor that forwards each array element to the channel as it is parsed
struct ElementSink<'a> {
    tx: &'a mpsc::Sender<PipelineResult<Value>>,
}

impl<'de> Visitor<'de> for ElementSink<'_> {
    /// Whether the consumer was still listening when the array ended
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<bool, A::Error> {
        while let Some(item) = seq.next_element::<Value>()? {
            if self.tx.blocking_send(Ok(item)).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::io::Cursor;

    async fn collect(stream: ItemStream) -> Vec<PipelineResult<Value>> {
        stream.collect().await
    }

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn detect_shape_skips_whitespace_without_consuming_payload() {
        let mut reader = BufReader::with_capacity(4, Cursor::new(b"   \n\t  [1]".to_vec()));
        assert_eq!(detect_shape(&mut reader).unwrap(), Some(DocumentShape::Array));
        let mut rest = String::new();
        std::io::Read::read_to_string(&mut reader, &mut rest).unwrap();
        assert_eq!(rest, "[1]");

        let mut object = Cursor::new(b"{\"a\":1}".to_vec());
        assert_eq!(detect_shape(&mut object).unwrap(), Some(DocumentShape::Single));

        let mut blank = Cursor::new(b"  \n ".to_vec());
        assert_eq!(detect_shape(&mut blank).unwrap(), None);
    }

    #[tokio::test]
    async fn array_elements_become_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "a.json", "\n [ {\"id\": 1}, {\"id\": 2}, 3 ]\n");

        let items: Vec<Value> = collect(open_items(&path, ReadOptions::default()).await.unwrap())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items, vec![json!({"id": 1}), json!({"id": 2}), json!(3)]);
    }

    #[tokio::test]
    async fn single_object_is_one_item_unless_items_key_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "o.json", r#"{"items": [{"x": 1}, {"x": 2}], "page": 1}"#);

        let whole = collect(open_items(&path, ReadOptions::default()).await.unwrap()).await;
        assert_eq!(whole.len(), 1);

        let nested = collect(open_items(&path, ReadOptions::with_items_key("items")).await.unwrap()).await;
        let nested: Vec<Value> = nested.into_iter().map(Result::unwrap).collect();
        assert_eq!(nested, vec![json!({"x": 1}), json!({"x": 2})]);

        let scalar = write(&dir, "s.json", "42");
        let items = collect(open_items(&scalar, ReadOptions::with_items_key("items")).await.unwrap()).await;
        assert_eq!(items.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![json!(42)]);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_items(dir.path().join("nope.json"), ReadOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "NotFoundError");
    }

    #[tokio::test]
    async fn malformed_array_ends_with_an_error_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bad.json", r#"[{"id": 1}, {"id": ]"#);

        let items = collect(open_items(&path, ReadOptions::default()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!({"id": 1}));
        assert_eq!(items[1].as_ref().unwrap_err().kind(), "ParseError");
    }

    #[tokio::test]
    async fn empty_file_is_an_error_not_an_empty_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "empty.json", "   ");

        let items = collect(open_items(&path, ReadOptions::default()).await.unwrap()).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[tokio::test]
    async fn early_drop_stops_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::to_string(&(0..10_000).collect::<Vec<_>>()).unwrap();
        let path = write(&dir, "big.json", &body);

        let first: Vec<_> = open_items(&path, ReadOptions::default()).await.unwrap().take(3).collect().await;
        assert_eq!(first.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn lockstep_reader_uses_one_slot_and_yields_everything() {
        assert_eq!(ReadOptions::lockstep().capacity(), 1);
        assert_eq!(ReadOptions::default().capacity(), CHANNEL_CAPACITY);
        assert_eq!(ReadOptions::with_items_key("rows").capacity(), CHANNEL_CAPACITY);

        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::to_string(&(0..100).collect::<Vec<_>>()).unwrap();
        let path = write(&dir, "rows.json", &body);
        let items = collect(open_items(&path, ReadOptions::lockstep()).await.unwrap()).await;
        assert_eq!(items.len(), 100);
        assert_eq!(items[99].as_ref().unwrap(), &json!(99));
    }

    #[tokio::test]
    async fn chain_concatenates_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(&dir, "a.json", "[1, 2]");
        let b = write(&dir, "b.json", "{\"v\": 3}");

        let items = collect(open_items_chain(vec![a, b], ReadOptions::default()).await.unwrap()).await;
        let items: Vec<Value> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec![json!(1), json!(2), json!({"v": 3})]);
    }
}
