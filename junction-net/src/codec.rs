use std::io;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::swarm::StreamProtocol;

use crate::error::NetworkError;
use crate::protocol::{MAX_DIRECT_MESSAGE_SIZE, MAX_FILE_SIZE};
use crate::types::{
    DirectMessageRequest, DirectMessageResponse, DirectMessageStatus, FileRequest, FileResponse,
};
use crate::wire::{self, codec_error, FieldValue, ProtoReader, ProtoWriter};

/// A request or response carried in at most one frame.
pub trait WireMessage: Sized {
    /// Frame payload, or `None` to end the stream without writing a frame.
    fn into_payload(self) -> Option<Vec<u8>>;

    fn from_payload(payload: &[u8]) -> Result<Self, NetworkError>;

    /// The message a stream that ends before any frame stands for.
    fn from_empty_stream() -> Option<Self> {
        None
    }
}

/// Varint length-prefixed codec for libp2p request-response.
///
/// Wire format: `[unsigned varint length][payload]`, the framing of
/// `it-length-prefixed`. Each stream carries one request then one response.
pub struct LengthPrefixedCodec<Req, Resp> {
    max_message_size: usize,
    _marker: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> LengthPrefixedCodec<Req, Resp> {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            _marker: PhantomData,
        }
    }

    async fn read_message<M, T>(&self, io: &mut T) -> io::Result<M>
    where
        M: WireMessage,
        T: AsyncRead + Unpin + Send,
    {
        match wire::read_length_prefixed(io, self.max_message_size).await? {
            Some(payload) => M::from_payload(&payload).map_err(into_io_error),
            None => M::from_empty_stream()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof)),
        }
    }

    async fn write_message<M, T>(&self, io: &mut T, msg: M) -> io::Result<()>
    where
        M: WireMessage,
        T: AsyncWrite + Unpin + Send,
    {
        let Some(payload) = msg.into_payload() else {
            return Ok(());
        };
        let data =
            wire::length_prefixed(&payload, self.max_message_size).map_err(into_io_error)?;
        io.write_all(&data).await
    }
}

impl<Req, Resp> Clone for LengthPrefixedCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new(self.max_message_size)
    }
}

/// Codec for the direct message protocol.
pub type DirectMessageCodec = LengthPrefixedCodec<DirectMessageRequest, DirectMessageResponse>;

/// Codec for the file exchange protocol.
pub type FileExchangeCodec = LengthPrefixedCodec<FileRequest, FileResponse>;

impl Default for DirectMessageCodec {
    fn default() -> Self {
        Self::new(MAX_DIRECT_MESSAGE_SIZE)
    }
}

impl Default for FileExchangeCodec {
    fn default() -> Self {
        Self::new(MAX_FILE_SIZE)
    }
}

#[async_trait]
impl<Req, Resp> libp2p::request_response::Codec for LengthPrefixedCodec<Req, Resp>
where
    Req: WireMessage + Send + 'static,
    Resp: WireMessage + Send + 'static,
{
    type Protocol = StreamProtocol;
    type Request = Req;
    type Response = Resp;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        self.read_message(io).await
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        self.read_message(io).await
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        self.write_message(io, req).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        self.write_message(io, res).await
    }
}

fn into_io_error(e: NetworkError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

// message Metadata { string clientVersion = 1; int64 timestamp = 2; }
fn encode_metadata(client_version: &str, timestamp: i64) -> Vec<u8> {
    ProtoWriter::new()
        .string(1, client_version)
        .varint(2, timestamp as u64)
        .finish()
}

fn decode_metadata(data: &[u8]) -> Result<(String, i64), NetworkError> {
    let mut client_version = String::new();
    let mut timestamp = 0;
    for field in ProtoReader::new(data) {
        match field? {
            (1, value) => client_version = value.as_string()?,
            (2, FieldValue::Varint(v)) => timestamp = v as i64,
            _ => {}
        }
    }
    Ok((client_version, timestamp))
}

// message DirectMessageRequest { Metadata meta = 1; string content = 2; string type = 3; }
impl WireMessage for DirectMessageRequest {
    fn into_payload(self) -> Option<Vec<u8>> {
        let meta = encode_metadata(&self.client_version, self.timestamp);
        Some(
            ProtoWriter::new()
                .bytes(1, &meta)
                .string(2, &self.data)
                .string(3, &self.mime_type)
                .finish(),
        )
    }

    fn from_payload(payload: &[u8]) -> Result<Self, NetworkError> {
        let mut req = DirectMessageRequest {
            client_version: String::new(),
            timestamp: 0,
            mime_type: String::new(),
            data: String::new(),
        };
        for field in ProtoReader::new(payload) {
            match field? {
                (1, FieldValue::Bytes(meta)) => {
                    (req.client_version, req.timestamp) = decode_metadata(meta)?;
                }
                (2, value) => req.data = value.as_string()?,
                (3, value) => req.mime_type = value.as_string()?,
                _ => {}
            }
        }
        Ok(req)
    }
}

// message DirectMessageResponse { Metadata meta = 1; Status status = 2; }
impl WireMessage for DirectMessageResponse {
    fn into_payload(self) -> Option<Vec<u8>> {
        let meta = encode_metadata(&self.client_version, self.timestamp);
        Some(
            ProtoWriter::new()
                .bytes(1, &meta)
                .varint(2, self.status.code())
                .finish(),
        )
    }

    fn from_payload(payload: &[u8]) -> Result<Self, NetworkError> {
        let mut res = DirectMessageResponse {
            client_version: String::new(),
            timestamp: 0,
            status: DirectMessageStatus::from_code(0),
        };
        for field in ProtoReader::new(payload) {
            match field? {
                (1, FieldValue::Bytes(meta)) => {
                    (res.client_version, res.timestamp) = decode_metadata(meta)?;
                }
                (2, FieldValue::Varint(code)) => res.status = DirectMessageStatus::from_code(code),
                _ => {}
            }
        }
        Ok(res)
    }
}

/// The request payload is the UTF-8 file id, nothing else.
impl WireMessage for FileRequest {
    fn into_payload(self) -> Option<Vec<u8>> {
        Some(self.id.into_bytes())
    }

    fn from_payload(payload: &[u8]) -> Result<Self, NetworkError> {
        let id = String::from_utf8(payload.to_vec())
            .map_err(|e| codec_error(format!("file id is not utf-8: {}", e)))?;
        Ok(FileRequest { id })
    }
}

/// The response payload is the raw file body. A stream closed without a
/// frame means the file is unknown.
impl WireMessage for FileResponse {
    fn into_payload(self) -> Option<Vec<u8>> {
        match self {
            FileResponse::Found(body) => Some(body),
            FileResponse::NotFound => None,
        }
    }

    fn from_payload(payload: &[u8]) -> Result<Self, NetworkError> {
        Ok(FileResponse::Found(payload.to_vec()))
    }

    fn from_empty_stream() -> Option<Self> {
        Some(FileResponse::NotFound)
    }
}
