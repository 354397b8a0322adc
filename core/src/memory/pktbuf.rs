//! Packet buffer manipulation.
//!
//! A [PktBuf] owns the bytes of a single captured frame together with its
//! capture timestamp. Frames are copied out of the capture driver as soon as
//! they are read, so buffers can cross thread boundaries and outlive the
//! capture handle that produced them.
//!
//! The accessor API is adapted from
//! [capsule::Mbuf](https://docs.rs/capsule/0.1.5/capsule/struct.Mbuf.html).

use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};

use std::fmt;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A packet buffer.
///
/// Wraps the raw bytes of a single Ethernet frame and the timestamp at which
/// the frame was captured.
#[derive(Clone)]
pub struct PktBuf {
    data: Vec<u8>,
    ts: DateTime<Utc>,
}

impl PktBuf {
    /// Creates a new PktBuf by copying `data`.
    pub fn from_bytes(data: &[u8], ts: DateTime<Utc>) -> Self {
        PktBuf {
            data: data.to_vec(),
            ts,
        }
    }

    /// Returns the capture timestamp of the frame.
    #[inline]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }

    /// Returns the length of the data in the buffer.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Returns the contents of the buffer as a byte slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a byte slice of data with length count at offset.
    ///
    /// Errors if `offset` is greater than or equal to the buffer length or `count` exceeds the size
    /// of the data stored at `offset`.
    pub fn get_data_slice(&self, offset: usize, count: usize) -> Result<&[u8]> {
        if offset < self.data_len() {
            if offset + count <= self.data_len() {
                Ok(&self.data[offset..offset + count])
            } else {
                bail!(PktBufError::ReadPastBuffer)
            }
        } else {
            bail!(PktBufError::BadOffset)
        }
    }

    /// Reads the data at `offset` as `T` and returns it as a raw pointer. Errors if `offset` is
    /// greater than or equal to the buffer length or the size of `T` exceeds the size of the data
    /// stored at `offset`.
    ///
    /// The returned pointer is byte-aligned; callers must read it with
    /// `read_unaligned`.
    pub(crate) fn get_data<T: PacketHeader>(&self, offset: usize) -> Result<*const T> {
        if offset < self.data_len() {
            if offset + T::size_of() <= self.data_len() {
                Ok(self.data[offset..].as_ptr() as *const T)
            } else {
                bail!(PktBufError::ReadPastBuffer)
            }
        } else {
            bail!(PktBufError::BadOffset)
        }
    }
}

impl<'a> Packet<'a> for PktBuf {
    fn buf(&self) -> &PktBuf {
        self
    }

    fn header_len(&self) -> usize {
        0
    }

    fn next_header_offset(&self) -> usize {
        0
    }

    fn next_header(&self) -> Option<usize> {
        None
    }

    fn parse_from(_outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        // parse_from should never be called for PktBuf.
        bail!(PacketParseError::InvalidProtocol)
    }
}

impl fmt::Debug for PktBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PktBuf")
            .field("ts", &self.ts)
            .field("data_len", &self.data.len())
            .finish()
    }
}

// displays the actual packet data of the frame
impl fmt::Display for PktBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (byte, value) in self.data.iter().enumerate() {
            write!(f, "{:02x} ", value)?;
            if byte % 16 == 15 {
                writeln!(f,)?;
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub(crate) enum PktBufError {
    #[error("Offset exceeds buffer length")]
    BadOffset,

    #[error("Data read exceeds buffer length")]
    ReadPastBuffer,
}
