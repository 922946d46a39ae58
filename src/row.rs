//! ClickHouse RowBinary encoding for points and metric tree rows.
//!
//! The write channel carries [`WriteBuffer`]s: batches of already encoded data
//! rows with the column layout
//! `(Path String, Value Float64, Time UInt32, Date Date, Timestamp UInt32)`.
//! The writer appends them verbatim to local files, so a finished file is a
//! valid `FORMAT RowBinary` insert body.

use thiserror::Error;

/// Seconds per day, for `Date` columns.
const SECONDS_PER_DAY: u32 = 86_400;

/// Errors that can occur while decoding RowBinary data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    /// Input ended in the middle of a row.
    #[error("unexpected end of row data at offset {0}")]
    UnexpectedEof(usize),

    /// Length prefix does not fit in 64 bits.
    #[error("varint overflow at offset {0}")]
    VarintOverflow(usize),

    /// Path is not valid UTF-8.
    #[error("invalid utf-8 path at offset {0}")]
    InvalidUtf8(usize),
}

/// A single Graphite data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub path: String,
    pub value: f64,
    /// Unix timestamp of the sample.
    pub time: u32,
}

impl Point {
    pub fn new(path: impl Into<String>, value: f64, time: u32) -> Self {
        Self {
            path: path.into(),
            value,
            time,
        }
    }
}

/// A decoded data row.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub path: String,
    pub value: f64,
    pub time: u32,
    pub date: u16,
    /// Receive time, used by ClickHouse as the row version.
    pub version: u32,
}

/// Batch of encoded data rows travelling through the write channel.
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    body: Vec<u8>,
    points: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a point; `version` is the receive timestamp.
    pub fn write_point(&mut self, point: &Point, version: u32) {
        encode_data_row(
            &mut self.body,
            &point.path,
            point.value,
            point.time,
            days_since_epoch(point.time),
            version,
        );
        self.points += 1;
    }

    pub fn points(&self) -> usize {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }
}

/// Days since the Unix epoch for a timestamp, as stored in `Date` columns.
pub fn days_since_epoch(timestamp: u32) -> u16 {
    // u32 seconds / 86400 fits in u16 until 2149.
    (timestamp / SECONDS_PER_DAY) as u16
}

/// Reverse the node order of a dotted path: `a.b.c` becomes `c.b.a`.
pub fn reverse_path(path: &str) -> String {
    path.rsplit('.').collect::<Vec<_>>().join(".")
}

/// Append one data row.
pub fn encode_data_row(
    buf: &mut Vec<u8>,
    path: &str,
    value: f64,
    time: u32,
    date: u16,
    version: u32,
) {
    put_string(buf, path);
    buf.extend_from_slice(&value.to_le_bytes());
    buf.extend_from_slice(&time.to_le_bytes());
    buf.extend_from_slice(&date.to_le_bytes());
    buf.extend_from_slice(&version.to_le_bytes());
}

/// Append one tree row:
/// `(Date Date, Level UInt32, Path String, Deleted UInt8, Version UInt32)`.
pub fn encode_tree_row(buf: &mut Vec<u8>, date: u16, level: u32, path: &str, version: u32) {
    buf.extend_from_slice(&date.to_le_bytes());
    buf.extend_from_slice(&level.to_le_bytes());
    put_string(buf, path);
    buf.push(0);
    buf.extend_from_slice(&version.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len() as u64;
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
    buf.extend_from_slice(s.as_bytes());
}

/// Iterator over the data rows of a RowBinary body.
pub struct RowReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RowReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RowError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(RowError::UnexpectedEof(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], RowError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_uvarint(&mut self) -> Result<u64, RowError> {
        let start = self.pos;
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let [byte] = self.read_array::<1>()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(RowError::VarintOverflow(start))
    }

    fn read_string(&mut self) -> Result<String, RowError> {
        let start = self.pos;
        let len = usize::try_from(self.read_uvarint()?).map_err(|_| RowError::UnexpectedEof(start))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| RowError::InvalidUtf8(start))
    }

    fn read_row(&mut self) -> Result<DataRow, RowError> {
        let path = self.read_string()?;
        let value = f64::from_le_bytes(self.read_array()?);
        let time = u32::from_le_bytes(self.read_array()?);
        let date = u16::from_le_bytes(self.read_array()?);
        let version = u32::from_le_bytes(self.read_array()?);
        Ok(DataRow {
            path,
            value,
            time,
            date,
            version,
        })
    }
}

impl Iterator for RowReader<'_> {
    type Item = Result<DataRow, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let row = self.read_row();
        if row.is_err() {
            // Stop after the first malformed row; offsets past it are meaningless.
            self.pos = self.data.len();
        }
        Some(row)
    }
}
