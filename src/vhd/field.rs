//! Forward-only big-endian field reader.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::io::{ErrorKind, Read};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the VHD epoch.
const VHD_EPOCH_UNIX_SECONDS: i64 = 946_684_800;

/// Decodes scalar fields from a byte stream, tracking how far it has read.
///
/// Running out of input mid-field is reported as `MalformedImage` naming the
/// structure being decoded.
pub struct FieldReader<R> {
    inner: R,
    position: u64,
    context: &'static str,
}

impl<R: Read> FieldReader<R> {
    pub fn new(inner: R, context: &'static str) -> Self {
        Self {
            inner,
            position: 0,
            context,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn read_bytes<const N: usize>(&mut self) -> SyncResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    pub fn read_vec(&mut self, len: usize) -> SyncResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    pub fn skip(&mut self, len: usize) -> SyncResult<()> {
        let copied = std::io::copy(
            &mut (&mut self.inner).take(len as u64),
            &mut std::io::sink(),
        )?;
        self.position += copied;
        if copied < len as u64 {
            return Err(self.truncated());
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> SyncResult<u8> {
        Ok(self.read_bytes::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> SyncResult<u16> {
        Ok(u16::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_u32(&mut self) -> SyncResult<u32> {
        Ok(u32::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_u64(&mut self) -> SyncResult<u64> {
        Ok(u64::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_uuid(&mut self) -> SyncResult<Uuid> {
        Ok(Uuid::from_bytes(self.read_bytes()?))
    }

    /// Reads a timestamp stored as seconds since the VHD epoch.
    pub fn read_timestamp(&mut self) -> SyncResult<DateTime<Utc>> {
        Ok(vhd_timestamp(self.read_u32()?))
    }

    /// Reads a fixed-width ASCII field, dropping trailing NUL and space padding.
    pub fn read_ascii(&mut self, len: usize) -> SyncResult<String> {
        let raw = self.read_vec(len)?;
        let text: String = raw.iter().map(|&b| b as char).collect();
        Ok(text.trim_end_matches(['\0', ' ']).to_string())
    }

    /// Reads a fixed-width UTF-16BE field terminated by the first NUL.
    pub fn read_utf16_be(&mut self, len: usize) -> SyncResult<String> {
        let raw = self.read_vec(len)?;
        Ok(decode_utf16(&raw, u16::from_be_bytes))
    }

    fn fill(&mut self, buf: &mut [u8]) -> SyncResult<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(self.truncated()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncated(&self) -> SyncError {
        SyncError::malformed(format!(
            "{} truncated after {} bytes",
            self.context, self.position
        ))
    }
}

/// Converts seconds since 2000-01-01T00:00:00Z into a UTC timestamp.
pub fn vhd_timestamp(seconds: u32) -> DateTime<Utc> {
    let epoch = Utc
        .timestamp_opt(VHD_EPOCH_UNIX_SECONDS, 0)
        .single()
        .unwrap_or_default();
    epoch + Duration::seconds(seconds as i64)
}

/// Decodes NUL-terminated UTF-16 code units using the given byte order.
pub fn decode_utf16(raw: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// One's complement of the byte sum of `raw`, skipping the 4-byte checksum
/// field at `checksum_offset`.
pub fn ones_complement_checksum(raw: &[u8], checksum_offset: usize) -> u32 {
    let sum = raw
        .iter()
        .enumerate()
        .filter(|(i, _)| !(checksum_offset..checksum_offset + 4).contains(i))
        .fold(0u32, |acc, (_, &b)| acc.wrapping_add(b as u32));
    !sum
}
