mod frame;
pub(crate) use frame::{BoxedReader, BoxedWriter, FrameReader, FrameWriter};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, ErrorKind, Result};

/// On-wire metadata carried by every request and response frame.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct Header {
    /// Dotted `"Service.Method"` selector; empty is invalid.
    pub service_method: String,
    /// Client-assigned sequence number; 0 is reserved as invalid.
    pub seq: u64,
    /// Empty on success, otherwise a server-side failure message.
    pub error: String,
}

/// Tag selecting the payload encoding for a connection.
///
/// The tag travels inside the JSON option line, so both endpoints agree on
/// the codec before the first frame is exchanged. Each codec delimits its
/// own values on the wire: MessagePack values carry their extent in their
/// markers, JSON values are newline-terminated.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum CodecType {
    #[default]
    #[serde(rename = "application/msgpack")]
    Msgpack,
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            CodecType::Msgpack => "application/msgpack",
            CodecType::Json => "application/json",
        }
    }

    /// Encodes one self-delimited value.
    ///
    /// # Errors
    pub(crate) fn encode<P: Serialize>(self, payload: &P) -> Result<Bytes> {
        match self {
            CodecType::Msgpack => rmp_serde::to_vec_named(payload)
                .map(Bytes::from)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, format!("msgpack encode: {e}"))),
            CodecType::Json => serde_json::to_vec(payload)
                .map(|mut value| {
                    value.push(b'\n');
                    Bytes::from(value)
                })
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, format!("json encode: {e}"))),
        }
    }

    /// # Errors
    pub(crate) fn decode<P: DeserializeOwned>(self, bytes: &[u8]) -> Result<P> {
        match self {
            CodecType::Msgpack => rmp_serde::from_slice(bytes)
                .map_err(|e| Error::new(ErrorKind::DeserializeFailed, format!("msgpack decode: {e}"))),
            CodecType::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::new(ErrorKind::DeserializeFailed, format!("json decode: {e}"))),
        }
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
