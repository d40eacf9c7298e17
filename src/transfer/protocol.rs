//! Wire frames of the data-transfer endpoint.
//!
//! A client sends a fixed 24-byte request: block id, offset and length, each a
//! big-endian `u64`. The server answers with a 9-byte header (status byte plus
//! big-endian `u64` length) followed by exactly that many raw block bytes. One
//! connection may carry any number of request/response pairs.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transfer::TransferError;

pub const REQUEST_LEN: usize = 24;
pub const RESPONSE_HEADER_LEN: usize = 9;

/// Read `length` bytes of `block_id` starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub block_id: u64,
    pub offset: u64,
    pub length: u64,
}

impl ReadRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(REQUEST_LEN);
        buf.put_u64(self.block_id);
        buf.put_u64(self.offset);
        buf.put_u64(self.length);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, TransferError> {
        if buf.len() < REQUEST_LEN {
            return Err(TransferError::Protocol(format!(
                "short request frame: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            block_id: buf.get_u64(),
            offset: buf.get_u64(),
            length: buf.get_u64(),
        })
    }

    /// Read the next request, or `None` once the peer has closed its side.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Option<Self>, TransferError> {
        let mut frame = [0u8; REQUEST_LEN];
        match reader.read_exact(&mut frame).await {
            Ok(_) => Self::decode(&frame).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), TransferError> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Ok = 0,
    NotFound = 1,
    OutOfRange = 2,
}

impl TryFrom<u8> for ResponseStatus {
    type Error = TransferError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseStatus::Ok),
            1 => Ok(ResponseStatus::NotFound),
            2 => Ok(ResponseStatus::OutOfRange),
            other => Err(TransferError::Protocol(format!("unknown response status {other}"))),
        }
    }
}

/// Precedes `length` bytes of block data when `status` is `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: ResponseStatus,
    pub length: u64,
}

impl ResponseHeader {
    pub fn ok(length: u64) -> Self {
        Self {
            status: ResponseStatus::Ok,
            length,
        }
    }

    pub fn error(status: ResponseStatus) -> Self {
        Self { status, length: 0 }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
        buf.put_u8(self.status as u8);
        buf.put_u64(self.length);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, TransferError> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(TransferError::Protocol(format!(
                "short response header: {} bytes",
                buf.len()
            )));
        }
        let status = ResponseStatus::try_from(buf.get_u8())?;
        Ok(Self {
            status,
            length: buf.get_u64(),
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, TransferError> {
        let mut frame = [0u8; RESPONSE_HEADER_LEN];
        reader.read_exact(&mut frame).await?;
        Self::decode(&frame)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), TransferError> {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }
}
