//! Length-prefixed JSON framing shared by the tracker and peer links.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! that many bytes of UTF-8 JSON, per the design. We get the length-prefix
//! half of this for free from [`tokio_util::codec::LengthDelimitedCodec`]
//! (configured for a 4-byte big-endian header, its default) and layer JSON
//! (de)serialization of a fixed message type `T` on top, the same way the
//! corpus's other JSON-over-TCP peer-to-peer code pairs
//! `LengthDelimitedCodec` with `serde_json`.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{Error, Result};

/// A [`tokio_util::codec`] `Encoder`/`Decoder` that frames `T` values as
/// length-prefixed JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

// `M` is deliberately not tied to `T`: a tracker connection decodes
// `TrackerRequest`s but encodes `TrackerResponse`s on the same socket, so the
// encoder side accepts any serializable message, while the decoder side
// (below) is fixed to the codec's `T`.
impl<T, M: Serialize> Encoder<M> for JsonCodec<T> {
    type Error = Error;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| Error::Malformed(format!("failed to serialize message: {}", e)))?;
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(Error::Network)
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        match self.inner.decode(src).map_err(Error::Network)? {
            Some(frame) => {
                let msg = serde_json::from_slice(&frame).map_err(|e| {
                    Error::Malformed(format!("invalid JSON frame: {}", e))
                })?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde::Deserialize;
    use tokio_util::codec::Framed;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn round_trips_messages_over_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Framed::new(client, JsonCodec::<Ping>::new());
        let mut server = Framed::new(server, JsonCodec::<Ping>::new());

        client.send(Ping { n: 42 }).await.unwrap();
        let received = server.next().await.unwrap().unwrap();
        assert_eq!(received, Ping { n: 42 });
    }

    #[tokio::test]
    async fn malformed_json_surfaces_as_an_error() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let mut rx = Framed::new(rx, JsonCodec::<Ping>::new());

        // hand-crafted frame: 4-byte big-endian length prefix then garbage
        let garbage = b"not json";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        buf.extend_from_slice(garbage);
        use tokio::io::AsyncWriteExt;
        tx.write_all(&buf).await.unwrap();
        drop(tx);

        let result = rx.next().await.unwrap();
        assert!(result.is_err());
    }
}
