//! Large-object handles and their chunked transfer.
//!
//! Uploads arrive as a stream of [`LobDataBlock`]s applied in arrival order to
//! one [`LobResource`]; the uploader gets a reference back once the first
//! block is applied and a final one carrying the byte total. Downloads emit
//! bounded blocks, or a single "no data" block for an empty LOB.

pub mod pipe;

pub use pipe::{LobPipe, PipeReader};

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use duckdb::arrow::array::ArrayRef;
use duckdb::types::Value;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::engine::cells::binary_slice;
use crate::error::ServerError;
use crate::protocol::{LobDataBlock, LobReference, LobType, SessionInfo};
use crate::session::ResourceId;

/// Position carried by the single block that answers a read of an empty LOB.
pub const NO_DATA_POSITION: i64 = -1;

const CHANNEL_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    /// The first upload block has been applied.
    Ready,
    /// Every block has been applied.
    Complete,
    Failed(String),
}

enum LobContent {
    Binary(Vec<u8>),
    /// Character data; `chars` caches the character count.
    Text { text: String, chars: u64 },
    /// Bytes handed to a single blocking reader as they arrive.
    Stream { pipe: LobPipe, next_position: u64 },
    /// Binary cell of a materialised result set, read in place.
    Cell { array: ArrayRef, row: usize },
}

enum Shape {
    Bytes,
    Text,
    Stream,
}

/// A LOB registered under a session.
pub struct LobResource {
    id: ResourceId,
    lob_type: LobType,
    content: Mutex<LobContent>,
    bytes_written: AtomicU64,
    readiness: watch::Sender<Readiness>,
}

impl LobResource {
    fn with_content(lob_type: LobType, content: LobContent, readiness: Readiness) -> Self {
        let (readiness, _) = watch::channel(readiness);
        Self {
            id: ResourceId::new(),
            lob_type,
            content: Mutex::new(content),
            bytes_written: AtomicU64::new(0),
            readiness,
        }
    }

    /// An empty handle that an upload stream will fill.
    pub fn for_upload(lob_type: LobType) -> Self {
        let content = match lob_type {
            LobType::Clob => LobContent::Text {
                text: String::new(),
                chars: 0,
            },
            LobType::BinaryStream => LobContent::Stream {
                pipe: LobPipe::new(),
                next_position: 1,
            },
            LobType::Blob | LobType::Unspecified => LobContent::Binary(Vec::new()),
        };
        let lob_type = match lob_type {
            LobType::Unspecified => LobType::Blob,
            other => other,
        };
        Self::with_content(lob_type, content, Readiness::Pending)
    }

    /// A complete Blob holding bytes copied out of a result set.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        let lob = Self::with_content(LobType::Blob, LobContent::Binary(bytes), Readiness::Complete);
        lob.bytes_written.store(len, Ordering::SeqCst);
        lob
    }

    /// A complete Clob holding text copied out of a result set.
    pub fn from_text(text: String) -> Self {
        let len = text.len() as u64;
        let chars = text.chars().count() as u64;
        let lob = Self::with_content(
            LobType::Clob,
            LobContent::Text { text, chars },
            Readiness::Complete,
        );
        lob.bytes_written.store(len, Ordering::SeqCst);
        lob
    }

    /// A complete, empty LOB the client fills through `setBytes`/`setString`.
    pub fn empty(lob_type: LobType) -> Self {
        let lob = Self::for_upload(lob_type);
        lob.complete();
        lob
    }

    /// A complete Blob that reads a result-set cell without copying it.
    pub fn from_cell(array: ArrayRef, row: usize) -> Self {
        let len = binary_slice(&array, row).map(<[u8]>::len).unwrap_or(0);
        let lob = Self::with_content(
            LobType::Blob,
            LobContent::Cell { array, row },
            Readiness::Complete,
        );
        lob.bytes_written.store(len as u64, Ordering::SeqCst);
        lob
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn lob_type(&self) -> LobType {
        self.lob_type
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    fn content(&self) -> MutexGuard<'_, LobContent> {
        self.content
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shape(&self) -> Shape {
        match &*self.content() {
            LobContent::Binary(_) | LobContent::Cell { .. } => Shape::Bytes,
            LobContent::Text { .. } => Shape::Text,
            LobContent::Stream { .. } => Shape::Stream,
        }
    }

    fn check_failed(&self) -> Result<(), ServerError> {
        match &*self.readiness.borrow() {
            Readiness::Failed(message) => Err(ServerError::LobStream(message.clone())),
            _ => Ok(()),
        }
    }

    /// Apply one upload block at a one-based position; zero or negative appends.
    /// Returns the cumulative number of bytes received.
    pub fn write_block(&self, position: i64, data: &[u8]) -> Result<u64, ServerError> {
        self.check_failed()?;
        let mut content = self.content();
        match &mut *content {
            LobContent::Binary(bytes) => {
                let offset = match u64::try_from(position) {
                    Ok(p) if p > 0 => p - 1,
                    _ => bytes.len() as u64,
                };
                if offset > bytes.len() as u64 {
                    return Err(ServerError::InvalidRequest(format!(
                        "blob write at position {position} leaves a gap after {} bytes",
                        bytes.len()
                    )));
                }
                let offset = offset as usize;
                let end = offset + data.len();
                if end > bytes.len() {
                    bytes.resize(end, 0);
                }
                bytes[offset..end].copy_from_slice(data);
            }
            LobContent::Text { text, chars } => {
                let incoming = std::str::from_utf8(data).map_err(|err| {
                    ServerError::InvalidRequest(format!("clob block is not valid UTF-8: {err}"))
                })?;
                let offset = match u64::try_from(position) {
                    Ok(p) if p > 0 => p - 1,
                    _ => *chars,
                };
                if offset > *chars {
                    return Err(ServerError::InvalidRequest(format!(
                        "clob write at position {position} leaves a gap after {chars} characters"
                    )));
                }
                if offset == *chars {
                    text.push_str(incoming);
                } else {
                    let start = char_to_byte(text, offset);
                    let replaced = incoming.chars().count();
                    let end = text[start..]
                        .char_indices()
                        .nth(replaced)
                        .map(|(i, _)| start + i)
                        .unwrap_or(text.len());
                    text.replace_range(start..end, incoming);
                }
                *chars = text.chars().count() as u64;
            }
            LobContent::Stream {
                pipe,
                next_position,
            } => {
                if position > 0 && position as u64 != *next_position {
                    return Err(ServerError::InvalidRequest(format!(
                        "binary stream expected position {next_position}, got {position}"
                    )));
                }
                *next_position += data.len() as u64;
                pipe.push(data.to_vec());
            }
            LobContent::Cell { .. } => {
                return Err(ServerError::UnsupportedOperation(
                    "result-set LOBs are read-only".to_string(),
                ))
            }
        }
        Ok(self
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::SeqCst)
            + data.len() as u64)
    }

    /// Cut the content to `len` bytes (Blob) or characters (Clob).
    pub fn truncate(&self, len: u64) -> Result<(), ServerError> {
        self.check_failed()?;
        match &mut *self.content() {
            LobContent::Binary(bytes) => bytes.truncate(len as usize),
            LobContent::Text { text, chars } => {
                let end = char_to_byte(text, len);
                text.truncate(end);
                *chars = (*chars).min(len);
            }
            LobContent::Stream { .. } | LobContent::Cell { .. } => {
                return Err(ServerError::UnsupportedOperation(format!(
                    "lob {} cannot be truncated",
                    self.id
                )))
            }
        }
        Ok(())
    }

    /// The first block is applied; dependent statements may bind a stream.
    pub fn mark_ready(&self) {
        self.readiness.send_if_modified(|state| {
            if *state == Readiness::Pending {
                *state = Readiness::Ready;
                true
            } else {
                false
            }
        });
    }

    /// The upload ended cleanly.
    pub fn complete(&self) {
        if let LobContent::Stream { pipe, .. } = &*self.content() {
            pipe.finish();
        }
        self.readiness.send_if_modified(|state| {
            if matches!(state, Readiness::Failed(_)) {
                false
            } else {
                *state = Readiness::Complete;
                true
            }
        });
    }

    /// Mark the LOB unusable and unblock any reader waiting on it.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        if let LobContent::Stream { pipe, .. } = &*self.content() {
            pipe.fail(message.clone());
        }
        self.readiness.send_replace(Readiness::Failed(message));
    }

    async fn wait_for(&self, wanted: impl Fn(&Readiness) -> bool) -> Result<(), ServerError> {
        let mut rx = self.readiness.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, Readiness::Failed(_)) || wanted(state))
            .await
            .map_err(|_| ServerError::LobStream(format!("lob {} was dropped", self.id)))?;
        match &*state {
            Readiness::Failed(message) => Err(ServerError::LobStream(message.clone())),
            _ => Ok(()),
        }
    }

    /// Wait until the LOB can be bound as a parameter: streams after their
    /// first block, Blobs and Clobs once fully uploaded.
    pub async fn wait_bindable(&self) -> Result<(), ServerError> {
        match self.shape() {
            Shape::Stream => {
                self.wait_for(|state| matches!(state, Readiness::Ready | Readiness::Complete))
                    .await
            }
            Shape::Bytes | Shape::Text => self.wait_for(|state| *state == Readiness::Complete).await,
        }
    }

    pub async fn wait_complete(&self) -> Result<(), ServerError> {
        self.wait_for(|state| *state == Readiness::Complete).await
    }

    /// Length in bytes (Blob) or characters (Clob); unknown for streams.
    pub fn length(&self) -> Option<u64> {
        match &*self.content() {
            LobContent::Binary(bytes) => Some(bytes.len() as u64),
            LobContent::Text { chars, .. } => Some(*chars),
            LobContent::Cell { array, row } => {
                Some(binary_slice(array, *row).map(<[u8]>::len).unwrap_or(0) as u64)
            }
            LobContent::Stream { .. } => None,
        }
    }

    fn byte_range(&self, offset: u64, len: u64) -> Vec<u8> {
        let content = self.content();
        let bytes: &[u8] = match &*content {
            LobContent::Binary(bytes) => bytes,
            LobContent::Cell { array, row } => binary_slice(array, *row).unwrap_or(&[]),
            _ => &[],
        };
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len as usize).min(bytes.len());
        bytes[start..end].to_vec()
    }

    /// Byte offset of a character offset, or `None` past the end.
    fn text_offset(&self, char_offset: u64) -> Option<usize> {
        match &*self.content() {
            LobContent::Text { text, chars } if char_offset <= *chars => {
                Some(char_to_byte(text, char_offset))
            }
            _ => None,
        }
    }

    /// Up to `max_bytes` of whole characters starting at `byte_offset`, and
    /// how many characters that is. Always yields at least one character
    /// when any remain.
    fn text_chunk(&self, byte_offset: usize, max_bytes: usize, max_chars: u64) -> (Vec<u8>, u64) {
        let content = self.content();
        let LobContent::Text { text, .. } = &*content else {
            return (Vec::new(), 0);
        };
        let rest = text.get(byte_offset..).unwrap_or("");
        let mut end = 0;
        let mut taken = 0u64;
        for (i, ch) in rest.char_indices() {
            if taken == max_chars || (taken > 0 && i + ch.len_utf8() > max_bytes) {
                break;
            }
            end = i + ch.len_utf8();
            taken += 1;
        }
        (rest.as_bytes()[..end].to_vec(), taken)
    }

    fn take_stream_reader(&self) -> Result<PipeReader, ServerError> {
        match &*self.content() {
            LobContent::Stream { pipe, .. } => pipe.take_reader().ok_or_else(|| {
                ServerError::LobStream(format!("binary stream {} was already consumed", self.id))
            }),
            _ => Err(ServerError::Internal(format!("lob {} is not a stream", self.id))),
        }
    }

    /// Engine value for binding. A stream is read to exhaustion, blocking
    /// the calling thread until its upload finishes or fails.
    pub fn engine_value(&self) -> Result<Value, ServerError> {
        self.check_failed()?;
        if let Shape::Stream = self.shape() {
            let mut reader = self.take_stream_reader()?;
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .map_err(|err| ServerError::LobStream(err.to_string()))?;
            return Ok(Value::Blob(bytes));
        }
        Ok(match &*self.content() {
            LobContent::Binary(bytes) => Value::Blob(bytes.clone()),
            LobContent::Text { text, .. } => Value::Text(text.clone()),
            LobContent::Cell { array, row } => binary_slice(array, *row)
                .map(|bytes| Value::Blob(bytes.to_vec()))
                .unwrap_or(Value::Null),
            LobContent::Stream { .. } => Value::Null,
        })
    }

    /// Whole content as bytes; used by `getBytes`/`getSubString` style calls.
    pub fn read_range(&self, position: i64, length: i64) -> Result<Vec<u8>, ServerError> {
        self.check_failed()?;
        let start = u64::try_from(position.max(1) - 1).unwrap_or(0);
        match self.shape() {
            Shape::Bytes => {
                let total = self.length().unwrap_or(0);
                let len = if length > 0 { length as u64 } else { total.saturating_sub(start) };
                Ok(self.byte_range(start, len))
            }
            Shape::Text => {
                let Some(offset) = self.text_offset(start) else {
                    return Ok(Vec::new());
                };
                let max_chars = if length > 0 { length as u64 } else { u64::MAX };
                Ok(self.text_chunk(offset, usize::MAX, max_chars).0)
            }
            Shape::Stream => Err(ServerError::UnsupportedOperation(
                "random access on a binary stream".to_string(),
            )),
        }
    }

    pub fn reference(&self, session: &SessionInfo, complete: bool) -> LobReference {
        LobReference {
            session: Some(session.clone()),
            lob_uuid: self.id.to_string(),
            lob_type: self.lob_type as i32,
            bytes_written: self.bytes_written() as i64,
            complete,
        }
    }
}

fn char_to_byte(text: &str, char_offset: u64) -> usize {
    text.char_indices()
        .nth(char_offset as usize)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Drives LOB uploads and downloads in bounded blocks.
#[derive(Debug, Clone)]
pub struct LobStreamProcessor {
    block_size: usize,
}

impl LobStreamProcessor {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Apply `first` and then every block of `rest` to `lob` in order.
    ///
    /// The returned stream yields a reference once the first block is applied
    /// and a final `complete` reference with the byte total. An upstream
    /// error fails the LOB, releasing any statement blocked on it.
    pub fn upload<S>(
        &self,
        lob: Arc<LobResource>,
        session: SessionInfo,
        first: LobDataBlock,
        mut rest: S,
    ) -> ReceiverStream<Result<LobReference, ServerError>>
    where
        S: Stream<Item = Result<LobDataBlock, ServerError>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(async move {
            let lob_id = lob.id();
            if let Err(err) = lob.write_block(first.position, &first.data) {
                lob.fail(err.to_string());
                let _ = tx.send(Err(err)).await;
                return;
            }
            lob.mark_ready();
            if tx.send(Ok(lob.reference(&session, false))).await.is_err() {
                debug!(%lob_id, "uploader stopped listening after first reference");
            }

            let mut blocks = 1usize;
            while let Some(item) = rest.next().await {
                let applied = item.and_then(|block| lob.write_block(block.position, &block.data));
                if let Err(err) = applied {
                    warn!(%lob_id, blocks, error = %err, "lob upload failed");
                    lob.fail(err.to_string());
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                blocks += 1;
            }

            lob.complete();
            info!(%lob_id, blocks, bytes = lob.bytes_written(), "lob upload complete");
            let _ = tx.send(Ok(lob.reference(&session, true))).await;
        });
        ReceiverStream::new(rx)
    }

    /// Stream `length` units of `lob` from one-based `position`; zero or
    /// negative `length` reads to the end.
    #[instrument(skip(self, lob, session), fields(lob_id = %lob.id()))]
    pub async fn download(
        &self,
        lob: Arc<LobResource>,
        session: SessionInfo,
        position: i64,
        length: i64,
    ) -> Result<ReceiverStream<Result<LobDataBlock, ServerError>>, ServerError> {
        if let Shape::Stream = lob.shape() {
            lob.wait_bindable().await?;
        } else {
            lob.wait_complete().await?;
        }
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let block_size = self.block_size;
        tokio::task::spawn_blocking(move || {
            let mut sink = BlockSink {
                tx: &tx,
                session: &session,
                lob: &lob,
                sent: 0,
            };
            let result = match lob.shape() {
                Shape::Bytes => download_bytes(&mut sink, position, length, block_size),
                Shape::Text => download_text(&mut sink, position, length, block_size),
                Shape::Stream => download_stream(&mut sink, position, length, block_size),
            };
            match result {
                Ok(true) if sink.sent == 0 => {
                    sink.emit(NO_DATA_POSITION, Vec::new());
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                }
            }
            debug!(blocks = sink.sent, "lob download finished");
        });
        Ok(ReceiverStream::new(rx))
    }
}

struct BlockSink<'a> {
    tx: &'a mpsc::Sender<Result<LobDataBlock, ServerError>>,
    session: &'a SessionInfo,
    lob: &'a LobResource,
    sent: usize,
}

impl BlockSink<'_> {
    /// False once the reader has gone away.
    fn emit(&mut self, position: i64, data: Vec<u8>) -> bool {
        let block = LobDataBlock {
            session: Some(self.session.clone()),
            lob_type: self.lob.lob_type() as i32,
            lob_uuid: self.lob.id().to_string(),
            position,
            data,
        };
        self.sent += 1;
        self.tx.blocking_send(Ok(block)).is_ok()
    }
}

fn start_offset(position: i64) -> u64 {
    u64::try_from(position.max(1) - 1).unwrap_or(0)
}

fn limit(length: i64) -> u64 {
    u64::try_from(length).ok().filter(|l| *l > 0).unwrap_or(u64::MAX)
}

/// Known length: every block is full except an exact-sized last one.
/// Returns false when the reader went away.
fn download_bytes(
    sink: &mut BlockSink<'_>,
    position: i64,
    length: i64,
    block_size: usize,
) -> Result<bool, ServerError> {
    let start = start_offset(position);
    let total = sink.lob.length().unwrap_or(0);
    let end = start.saturating_add(limit(length)).min(total);
    let mut offset = start;
    while offset < end {
        let take = (end - offset).min(block_size as u64);
        let data = sink.lob.byte_range(offset, take);
        if !sink.emit(offset as i64 + 1, data) {
            return Ok(false);
        }
        offset += take;
    }
    Ok(true)
}

/// Clob blocks hold whole characters; positions count characters.
fn download_text(
    sink: &mut BlockSink<'_>,
    position: i64,
    length: i64,
    block_size: usize,
) -> Result<bool, ServerError> {
    let start = start_offset(position);
    let Some(mut byte_offset) = sink.lob.text_offset(start) else {
        return Ok(true);
    };
    let mut char_position = start;
    let mut remaining = limit(length);
    while remaining > 0 {
        let (data, chars) = sink.lob.text_chunk(byte_offset, block_size, remaining);
        if chars == 0 {
            break;
        }
        byte_offset += data.len();
        if !sink.emit(char_position as i64 + 1, data) {
            return Ok(false);
        }
        char_position += chars;
        remaining -= chars;
    }
    Ok(true)
}

/// Unknown length: fill maximum-size blocks until the stream ends and trim
/// the final one to what was actually read.
fn download_stream(
    sink: &mut BlockSink<'_>,
    position: i64,
    length: i64,
    block_size: usize,
) -> Result<bool, ServerError> {
    let mut reader = sink.lob.take_stream_reader()?;
    let start = start_offset(position);
    let stream_err = |err: io::Error| ServerError::LobStream(err.to_string());
    io::copy(&mut (&mut reader).take(start), &mut io::sink()).map_err(stream_err)?;

    let mut offset = start;
    let mut remaining = limit(length);
    while remaining > 0 {
        let want = remaining.min(block_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = reader.read(&mut buf[filled..]).map_err(stream_err)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        buf.truncate(filled);
        if !sink.emit(offset as i64 + 1, buf) {
            return Ok(false);
        }
        offset += filled as u64;
        remaining -= filled as u64;
        if filled < want {
            break;
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use duckdb::arrow::array::BinaryArray;
    use futures::stream;

    use super::*;

    fn block(position: i64, data: &[u8]) -> LobDataBlock {
        LobDataBlock {
            position,
            data: data.to_vec(),
            ..LobDataBlock::default()
        }
    }

    async fn upload_all(
        processor: &LobStreamProcessor,
        lob_type: LobType,
        blocks: Vec<LobDataBlock>,
    ) -> Result<(Arc<LobResource>, Vec<LobReference>)> {
        let lob = Arc::new(LobResource::for_upload(lob_type));
        let mut blocks = blocks.into_iter();
        let first = blocks.next().ok_or_else(|| anyhow!("no blocks"))?;
        let rest = stream::iter(blocks.map(Ok).collect::<Vec<_>>());
        let refs = processor
            .upload(lob.clone(), SessionInfo::default(), first, rest)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok((lob, refs))
    }

    async fn download_all(
        processor: &LobStreamProcessor,
        lob: Arc<LobResource>,
        position: i64,
        length: i64,
    ) -> Result<Vec<LobDataBlock>> {
        processor
            .download(lob, SessionInfo::default(), position, length)
            .await
            .map_err(|e| anyhow!(e.to_string()))?
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!(e.to_string()))
    }

    #[tokio::test]
    async fn clob_blocks_append_by_character_position() -> Result<()> {
        let processor = LobStreamProcessor::new(1024);
        let (lob, refs) = upload_all(
            &processor,
            LobType::Clob,
            vec![block(1, b"AAAA"), block(5, b"BBBB")],
        )
        .await?;
        assert_eq!(refs.len(), 2);
        assert!(!refs[0].complete);
        assert!(refs[1].complete);
        assert_eq!(refs[1].bytes_written, 8);

        let blocks = download_all(&processor, lob, 1, 8).await?;
        let text: Vec<u8> = blocks.into_iter().flat_map(|b| b.data).collect();
        assert_eq!(text, b"AAAABBBB");
        Ok(())
    }

    #[tokio::test]
    async fn empty_lob_reads_as_a_single_no_data_block() -> Result<()> {
        let processor = LobStreamProcessor::new(4);
        let (lob, _) = upload_all(&processor, LobType::Blob, vec![block(1, b"")]).await?;
        let blocks = download_all(&processor, lob, 1, 0).await?;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].position, NO_DATA_POSITION);
        assert!(blocks[0].data.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn known_length_blocks_are_exactly_sized() -> Result<()> {
        let processor = LobStreamProcessor::new(4);
        let lob = Arc::new(LobResource::from_bytes((0u8..10).collect()));
        let blocks = download_all(&processor, lob, 1, 0).await?;
        let sizes: Vec<usize> = blocks.iter().map(|b| b.data.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(blocks[2].position, 9);
        Ok(())
    }

    #[tokio::test]
    async fn multibyte_clob_blocks_split_on_character_boundaries() -> Result<()> {
        let processor = LobStreamProcessor::new(3);
        let (lob, _) = upload_all(&processor, LobType::Clob, vec![block(1, "héllo".as_bytes())]).await?;
        assert_eq!(lob.length(), Some(5));
        let blocks = download_all(&processor, lob, 2, 3).await?;
        let positions: Vec<i64> = blocks.iter().map(|b| b.position).collect();
        assert_eq!(positions, vec![2, 3]);
        let text = String::from_utf8(blocks.into_iter().flat_map(|b| b.data).collect())?;
        assert_eq!(text, "éll");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_binding_blocks_until_upload_finishes() -> Result<()> {
        let lob = Arc::new(LobResource::for_upload(LobType::BinaryStream));
        let (tx, rx) = mpsc::channel::<Result<LobDataBlock, ServerError>>(4);
        let processor = LobStreamProcessor::new(8);
        let mut refs = processor.upload(
            lob.clone(),
            SessionInfo::default(),
            block(1, b"abc"),
            ReceiverStream::new(rx),
        );
        let first = refs
            .next()
            .await
            .ok_or_else(|| anyhow!("missing first reference"))?
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(!first.complete);
        lob.wait_bindable().await.map_err(|e| anyhow!(e.to_string()))?;

        let binder = lob.clone();
        let bound = tokio::task::spawn_blocking(move || binder.engine_value());
        tx.send(Ok(block(4, b"def"))).await?;
        drop(tx);

        let value = bound.await?.map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(value, Value::Blob(b"abcdef".to_vec()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upstream_error_unblocks_stream_reader() -> Result<()> {
        let lob = Arc::new(LobResource::for_upload(LobType::BinaryStream));
        let (tx, rx) = mpsc::channel::<Result<LobDataBlock, ServerError>>(4);
        let processor = LobStreamProcessor::new(8);
        let mut refs = processor.upload(
            lob.clone(),
            SessionInfo::default(),
            block(1, b"abc"),
            ReceiverStream::new(rx),
        );
        refs.next().await;

        let binder = lob.clone();
        let bound = tokio::task::spawn_blocking(move || binder.engine_value());
        tx.send(Err(ServerError::LobStream("client reset".to_string())))
            .await?;

        let err = bound
            .await?
            .err()
            .ok_or_else(|| anyhow!("expected bind to fail"))?;
        assert!(matches!(err, ServerError::LobStream(_)));
        assert!(refs.next().await.is_some_and(|r| r.is_err()));
        Ok(())
    }

    #[test]
    fn blob_writes_reject_gaps_and_cells_are_read_only() -> Result<()> {
        let lob = LobResource::for_upload(LobType::Blob);
        lob.write_block(1, b"xy").map_err(|e| anyhow!(e.to_string()))?;
        assert!(matches!(
            lob.write_block(5, b"z"),
            Err(ServerError::InvalidRequest(_))
        ));
        lob.write_block(2, b"YZ").map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(lob.read_range(1, 0).map_err(|e| anyhow!(e.to_string()))?, b"xYZ");

        let array: ArrayRef = Arc::new(BinaryArray::from(vec![Some(&b"cell"[..])]));
        let cell = LobResource::from_cell(array, 0);
        assert_eq!(cell.length(), Some(4));
        assert!(matches!(
            cell.write_block(1, b"x"),
            Err(ServerError::UnsupportedOperation(_))
        ));
        Ok(())
    }
}
