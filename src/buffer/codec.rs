//! Binary layout of the spool file.
//!
//! All integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       4     magic ("SPW^")
//! 4       8     read pointer  (i64)
//! 12      8     write pointer (i64)
//! 20      30    reserved, zero
//! 50      ..    records: [u64 length][length bytes of JSON]
//! ```
//!
//! Integrity is a plausibility check only: magic, pointer ordering and a
//! length bound. A corrupted length that happens to look plausible is not
//! detected here; the JSON decode that follows is the last line.

/// Marker written at offset zero of every spool file.
pub const FILE_MAGIC: [u8; 4] = *b"SPW\x5e";

/// Size of the on-disk header, including reserved padding.
pub const HEADER_LEN: usize = 50;

/// File offset of the first record.
pub const FIRST_RECORD_OFFSET: i64 = HEADER_LEN as i64;

/// Size of the length prefix in front of each record.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Errors raised while decoding the header or a record frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Header too short: {0} bytes")]
    ShortHeader(usize),

    #[error("Invalid magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Invalid pointers: read {read}, write {write}")]
    InvalidPointers { read: i64, write: i64 },

    #[error("Implausible record length {length} (limit {limit})")]
    ImplausibleLength { length: u64, limit: u64 },

    #[error("Truncated record at offset {offset}: expected {expected} bytes, found {found}")]
    TruncatedRecord {
        offset: i64,
        expected: u64,
        found: u64,
    },
}

/// Read/write cursors persisted at the start of the spool file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Leasing starts at this file offset.
    pub read_pointer: i64,
    /// Enqueue appends at this file offset.
    pub write_pointer: i64,
}

impl Default for Header {
    fn default() -> Self {
        Self::virgin()
    }
}

impl Header {
    /// Header of a freshly created, empty file.
    pub fn virgin() -> Self {
        Self {
            read_pointer: FIRST_RECORD_OFFSET,
            write_pointer: FIRST_RECORD_OFFSET,
        }
    }

    /// Bytes enqueued but not yet leased.
    pub fn pending_bytes(&self) -> i64 {
        self.write_pointer - self.read_pointer
    }

    /// True when every record has been leased.
    pub fn is_drained(&self) -> bool {
        self.read_pointer == self.write_pointer
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut data = [0u8; HEADER_LEN];
        data[0..4].copy_from_slice(&FILE_MAGIC);
        data[4..12].copy_from_slice(&self.read_pointer.to_le_bytes());
        data[12..20].copy_from_slice(&self.write_pointer.to_le_bytes());
        data
    }

    /// Decode and validate a header.
    ///
    /// Rejects bad magic and any pointer pair that violates
    /// `FIRST_RECORD_OFFSET <= read <= write`.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::ShortHeader(data.len()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if magic != FILE_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let header = Self {
            read_pointer: i64::from_le_bytes(le_word(&data[4..12])),
            write_pointer: i64::from_le_bytes(le_word(&data[12..20])),
        };

        if header.read_pointer < FIRST_RECORD_OFFSET || header.read_pointer > header.write_pointer
        {
            return Err(CodecError::InvalidPointers {
                read: header.read_pointer,
                write: header.write_pointer,
            });
        }

        Ok(header)
    }
}

fn le_word(bytes: &[u8]) -> [u8; 8] {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    word
}

/// Frame a payload as `[u64 length][payload]`.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a record length prefix, rejecting zero and anything above `limit`.
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_LEN], limit: u64) -> Result<u64, CodecError> {
    let length = u64::from_le_bytes(prefix);
    if length == 0 || length > limit {
        return Err(CodecError::ImplausibleLength { length, limit });
    }
    Ok(length)
}
