//! File-backed overflow buffer.
//!
//! A [`RingBufferFile`] is an append-and-drain log of rows used as pressure
//! relief for exactly one producer/consumer pair. The spool file is created
//! lazily on the first enqueue and deleted as soon as the reader catches up
//! with the writer, so it only exists while there is backlog.
//!
//! Failures never leave the buffer unusable:
//! - Corruption (bad magic, impossible pointers, implausible or truncated
//!   record, undecodable JSON) discards the whole file.
//! - Overflow past `max_size_bytes` discards the backlog and logs
//!   `discarded_bytes`.
//! - I/O errors discard the file; `enqueue` also returns the error.
//!
//! A row too large to be read back is refused by `enqueue` and never
//! reaches the file.
//!
//! File I/O goes through `tokio::fs` so a large record does not stall the
//! runtime.

pub mod codec;
pub mod lease;
pub mod spool;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use self::codec::{CodecError, Header, FIRST_RECORD_OFFSET, HEADER_LEN, LENGTH_PREFIX_LEN};
pub use self::lease::{LeaseTicket, Leased, Outstanding};
pub use self::spool::{SpoolLocation, TempDirSpool, TempFileProvider};
use crate::config::BufferConfig;
use crate::Row;

/// Result type for buffer operations.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors that can occur during buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Spool I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Row encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spool file corrupt: {0}")]
    Codec(#[from] CodecError),
}

impl BufferError {
    /// True for errors caused by unreadable spool contents rather than I/O.
    pub fn is_corruption(&self) -> bool {
        matches!(self, BufferError::Codec(_) | BufferError::Json(_))
    }
}

/// Point-in-time view of a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Spool file path, `None` while the buffer holds nothing.
    pub path: Option<PathBuf>,
    pub read_pointer: i64,
    pub write_pointer: i64,
    /// Bytes enqueued and not yet leased.
    pub pending_bytes: i64,
    /// Size of the spool file on disk.
    pub file_size: u64,
    /// Leased rows not yet delivered or discarded.
    pub outstanding: usize,
}

/// Live spool file.
///
/// `file` owns the path and deletes it when removed; `io` is an async
/// handle onto the same file used for every read and write.
#[derive(Debug)]
struct Backing {
    file: NamedTempFile,
    io: File,
    header: Header,
}

impl Backing {
    fn path(&self) -> &Path {
        self.file.path()
    }

    async fn file_size(&self) -> u64 {
        self.io
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or_default()
    }

    /// Re-read the header from disk so external damage is noticed.
    async fn load_header(&mut self) -> Result<Header> {
        let data = self.read_at(0, HEADER_LEN as u64).await?;
        let header = Header::decode(&data)?;
        self.header = header;
        Ok(header)
    }

    async fn store_header(&mut self) -> Result<()> {
        let data = self.header.encode();
        self.write_at(0, &data).await
    }

    async fn write_at(&mut self, offset: i64, bytes: &[u8]) -> Result<()> {
        self.io.seek(SeekFrom::Start(offset as u64)).await?;
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read up to `len` bytes. A short result means the file ended early.
    async fn read_at(&mut self, offset: i64, len: u64) -> Result<Vec<u8>> {
        self.io.seek(SeekFrom::Start(offset as u64)).await?;
        let mut data = Vec::with_capacity(len as usize);
        AsyncReadExt::take(&mut self.io, len)
            .read_to_end(&mut data)
            .await?;
        Ok(data)
    }
}

/// Bounded, self-healing spool for one listener.
///
/// All operations are serialized by an internal lock. The buffer is owned by
/// a single listener and is not meant to be shared further.
#[derive(Debug)]
pub struct RingBufferFile {
    /// Used as the spool file name prefix and in log lines.
    name: String,
    config: BufferConfig,
    spool: Arc<dyn TempFileProvider>,
    backing: Mutex<Option<Backing>>,
    outstanding: Arc<Outstanding>,
}

impl RingBufferFile {
    pub fn new(
        name: impl Into<String>,
        config: BufferConfig,
        spool: Arc<dyn TempFileProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            spool,
            backing: Mutex::new(None),
            outstanding: Outstanding::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a row.
    ///
    /// Rows larger than `max_record_bytes` are refused and the spool is left
    /// untouched. On I/O failure the buffer is reset and the error returned;
    /// the next call starts from a clean file.
    pub async fn enqueue(&self, row: &Row) -> Result<()> {
        let payload = serde_json::to_vec(row)?;
        let limit = self.config.max_record_bytes;
        if payload.len() as u64 > limit {
            warn!(
                buffer = %self.name,
                length = payload.len(),
                limit,
                "Row exceeds maximum record size, dropping"
            );
            return Err(CodecError::ImplausibleLength {
                length: payload.len() as u64,
                limit,
            }
            .into());
        }
        let frame = codec::encode_record(&payload);

        let mut slot = self.backing.lock().await;
        if let Err(e) = self.append(&mut slot, &frame).await {
            error!(buffer = %self.name, error = %e, "Spool enqueue failed, resetting buffer");
            self.reset_locked(&mut slot, "io_error");
            return Err(e);
        }
        Ok(())
    }

    async fn append(&self, slot: &mut Option<Backing>, frame: &[u8]) -> Result<()> {
        if let Some(backing) = slot.as_mut() {
            let loaded = backing.load_header().await;
            match loaded {
                Ok(header) => {
                    let end = header.write_pointer as u64 + frame.len() as u64;
                    if header.write_pointer > FIRST_RECORD_OFFSET
                        && end > self.config.max_size_bytes
                    {
                        warn!(
                            buffer = %self.name,
                            path = %backing.path().display(),
                            discarded_bytes = header.pending_bytes(),
                            max_size_bytes = self.config.max_size_bytes,
                            "Spool file exceeded maximum size, discarding backlog"
                        );

                        #[cfg(feature = "otel")]
                        {
                            use crate::utils::metrics::{self, BUFFER_DISCARDED_BYTES};
                            BUFFER_DISCARDED_BYTES.add(
                                header.pending_bytes().max(0) as u64,
                                &[metrics::buffer_attr(&self.name)],
                            );
                        }

                        self.reset_locked(slot, "overflow");
                    }
                }
                Err(e) if e.is_corruption() => {
                    warn!(
                        buffer = %self.name,
                        path = %backing.path().display(),
                        error = %e,
                        "Spool header corrupt, resetting buffer"
                    );
                    self.reset_locked(slot, "corruption");
                }
                Err(e) => return Err(e),
            }
        }

        let backing = match slot.take() {
            Some(backing) => backing,
            None => self.open().await?,
        };
        let backing = slot.insert(backing);

        let offset = backing.header.write_pointer;
        backing.write_at(offset, frame).await?;
        backing.header.write_pointer = offset + frame.len() as i64;
        backing.store_header().await
    }

    async fn open(&self) -> Result<Backing> {
        let spool = Arc::clone(&self.spool);
        let prefix = self.name.clone();
        let (file, io) = tokio::task::spawn_blocking(move || -> std::io::Result<_> {
            let file = spool.create(&prefix)?;
            match file.reopen() {
                Ok(io) => Ok((file, io)),
                Err(e) => {
                    let _ = spool.remove(file);
                    Err(e)
                }
            }
        })
        .await
        .map_err(std::io::Error::other)??;

        let mut backing = Backing {
            file,
            io: File::from_std(io),
            header: Header::virgin(),
        };

        if let Err(e) = backing.store_header().await {
            if let Err(remove_err) = self.spool.remove(backing.file) {
                warn!(buffer = %self.name, error = %remove_err, "Failed to remove spool file");
            }
            return Err(e);
        }

        debug!(
            buffer = %self.name,
            path = %backing.path().display(),
            "Spool file opened"
        );
        Ok(backing)
    }

    /// Read up to `count` rows.
    ///
    /// Returns nothing if any record in the batch is damaged; the buffer is
    /// reset in that case. Each returned row holds a ticket counted in
    /// [`outstanding`](Self::outstanding) until dropped.
    pub async fn lease(&self, count: usize) -> Vec<Leased> {
        if count == 0 {
            return Vec::new();
        }

        let mut slot = self.backing.lock().await;
        let Some(backing) = slot.as_mut() else {
            return Vec::new();
        };

        let batch = self.read_batch(backing, count).await;
        let rows = match batch {
            Ok(rows) => rows,
            Err(e) => {
                if e.is_corruption() {
                    warn!(
                        buffer = %self.name,
                        path = %backing.path().display(),
                        read_pointer = backing.header.read_pointer,
                        write_pointer = backing.header.write_pointer,
                        error = %e,
                        "Spool file corrupt, discarding backlog"
                    );
                    self.reset_locked(&mut slot, "corruption");
                } else {
                    error!(
                        buffer = %self.name,
                        path = %backing.path().display(),
                        error = %e,
                        "Spool read failed, discarding backlog"
                    );
                    self.reset_locked(&mut slot, "io_error");
                }
                return Vec::new();
            }
        };

        if backing.header.is_drained() {
            debug!(buffer = %self.name, "Spool drained, removing file");
            self.remove_file(&mut slot);
        }

        rows.into_iter()
            .map(|row| Leased::new(row, self.outstanding.acquire()))
            .collect()
    }

    async fn read_batch(&self, backing: &mut Backing, count: usize) -> Result<Vec<Row>> {
        let mut header = backing.load_header().await?;
        let mut rows = Vec::new();
        let mut cursor = header.read_pointer;

        while rows.len() < count && cursor < header.write_pointer {
            let remaining = (header.write_pointer - cursor) as u64;
            let truncated = |found: u64, expected: u64| CodecError::TruncatedRecord {
                offset: cursor,
                expected,
                found,
            };

            if remaining < LENGTH_PREFIX_LEN as u64 {
                return Err(truncated(remaining, LENGTH_PREFIX_LEN as u64).into());
            }

            let raw = backing.read_at(cursor, LENGTH_PREFIX_LEN as u64).await?;
            let prefix: [u8; LENGTH_PREFIX_LEN] = raw
                .as_slice()
                .try_into()
                .map_err(|_| truncated(raw.len() as u64, LENGTH_PREFIX_LEN as u64))?;
            let length = codec::decode_length(prefix, self.config.max_record_bytes)?;

            let frame_len = LENGTH_PREFIX_LEN as u64 + length;
            if frame_len > remaining {
                return Err(truncated(remaining, frame_len).into());
            }

            let payload = backing
                .read_at(cursor + LENGTH_PREFIX_LEN as i64, length)
                .await?;
            if payload.len() as u64 != length {
                return Err(truncated(payload.len() as u64, length).into());
            }

            rows.push(serde_json::from_slice::<Row>(&payload)?);
            cursor += frame_len as i64;
        }

        header.read_pointer = cursor;
        backing.header = header;
        backing.store_header().await?;
        Ok(rows)
    }

    /// Discard everything and return to the file-less state.
    pub async fn reset(&self) {
        let mut slot = self.backing.lock().await;
        self.reset_locked(&mut slot, "reset");
    }

    /// Discard everything. Used on shutdown.
    pub async fn close(&self) {
        let mut slot = self.backing.lock().await;
        if slot.is_some() {
            debug!(buffer = %self.name, "Closing spool with unread backlog");
        }
        self.remove_file(&mut slot);
    }

    fn reset_locked(&self, slot: &mut Option<Backing>, reason: &'static str) {
        if slot.is_none() {
            return;
        }
        debug!(buffer = %self.name, reason, "Resetting spool");

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, BUFFER_RESETS};
            BUFFER_RESETS.add(
                1,
                &[
                    metrics::buffer_attr(&self.name),
                    metrics::reason_attr(reason),
                ],
            );
        }

        self.remove_file(slot);
    }

    fn remove_file(&self, slot: &mut Option<Backing>) {
        if let Some(backing) = slot.take() {
            if let Err(e) = self.spool.remove(backing.file) {
                warn!(buffer = %self.name, error = %e, "Failed to remove spool file");
            }
        }
    }

    /// Leased rows not yet delivered or discarded.
    pub fn outstanding(&self) -> usize {
        self.outstanding.count()
    }

    /// Resolve once every leased row's ticket has been dropped.
    pub async fn wait_outstanding(&self) {
        self.outstanding.wait_idle().await
    }

    pub async fn stats(&self) -> BufferStats {
        let slot = self.backing.lock().await;
        let outstanding = self.outstanding.count();

        match slot.as_ref() {
            Some(backing) => BufferStats {
                path: Some(backing.path().to_path_buf()),
                read_pointer: backing.header.read_pointer,
                write_pointer: backing.header.write_pointer,
                pending_bytes: backing.header.pending_bytes(),
                file_size: backing.file_size().await,
                outstanding,
            },
            None => {
                let header = Header::virgin();
                BufferStats {
                    path: None,
                    read_pointer: header.read_pointer,
                    write_pointer: header.write_pointer,
                    pending_bytes: 0,
                    file_size: 0,
                    outstanding,
                }
            }
        }
    }
}

impl Drop for RingBufferFile {
    fn drop(&mut self) {
        if let Some(backing) = self.backing.get_mut().take() {
            let _ = self.spool.remove(backing.file);
        }
    }
}
