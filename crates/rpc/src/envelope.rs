//! Request and response envelopes.
//!
//! Envelopes ride inside chunk payloads, encoded with MessagePack: a
//! self-describing compact binary form, so a client can verify shape
//! before trusting content. The schema discovery object is served under a
//! reserved service name and lets clients check compatibility at connect
//! time.

use helio_core::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reserved service name answering schema discovery requests.
pub const DISCOVERY_SERVICE: &str = "$schema";

/// Whether the operation may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Snapshot reads only; the client library may retry freely.
    Read,
    /// Executes as a read-write transaction.
    ReadWrite,
}

/// A request as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Target service name.
    pub service: String,
    /// Operation within the service.
    pub operation: String,
    /// Read or read-write.
    pub kind: RequestKind,
    /// MessagePack-encoded argument tuple.
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    /// Build a request with an encoded argument tuple.
    pub fn new<A: Serialize>(
        service: &str,
        operation: &str,
        kind: RequestKind,
        args: &A,
    ) -> Result<Self> {
        Ok(RequestEnvelope {
            service: service.to_string(),
            operation: operation.to_string(),
            kind,
            payload: encode(args)?,
        })
    }

    /// Decode the argument tuple.
    pub fn args<A: DeserializeOwned>(&self) -> Result<A> {
        decode(&self.payload)
    }
}

/// A response as carried on the wire. Exactly one of `error`/`payload`
/// means something: a response either failed with a typed error or carries
/// an encoded result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// 0 on success, otherwise the error's stable wire code.
    pub status: u16,
    /// The typed error on failure.
    pub error: Option<Error>,
    /// MessagePack-encoded result on success.
    pub payload: Vec<u8>,
}

impl ResponseEnvelope {
    /// A success response carrying `result`.
    pub fn ok<R: Serialize>(result: &R) -> Result<Self> {
        Ok(ResponseEnvelope {
            status: 0,
            error: None,
            payload: encode(result)?,
        })
    }

    /// A failure response.
    pub fn fail(error: Error) -> Self {
        ResponseEnvelope {
            status: error.wire_code(),
            error: Some(error),
            payload: Vec::new(),
        }
    }

    /// Decode the result, surfacing a carried error instead.
    pub fn result<R: DeserializeOwned>(&self) -> Result<R> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => decode(&self.payload),
        }
    }
}

/// What the server advertises for connect-time compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiscovery {
    /// Wire protocol version (chunk header version).
    pub protocol_version: u32,
    /// Installed model-version GUID.
    pub model_guid: String,
    /// Installed model version number.
    pub model_version: u32,
    /// Exposed service names.
    pub services: Vec<String>,
}

/// MessagePack-encode a value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// MessagePack-decode a value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_core::error::ConflictKind;

    #[test]
    fn request_round_trips_its_args() {
        let req =
            RequestEnvelope::new("Books", "CreateBook", RequestKind::ReadWrite, &("Gatsby", 1925))
                .unwrap();
        let bytes = encode(&req).unwrap();
        let back: RequestEnvelope = decode(&bytes).unwrap();
        assert_eq!(back.service, "Books");
        assert_eq!(back.kind, RequestKind::ReadWrite);
        let (title, year): (String, i32) = back.args().unwrap();
        assert_eq!((title.as_str(), year), ("Gatsby", 1925));
    }

    #[test]
    fn response_carries_typed_errors() {
        let resp = ResponseEnvelope::fail(Error::Conflict(ConflictKind::WriteAfterRead));
        let bytes = encode(&resp).unwrap();
        let back: ResponseEnvelope = decode(&bytes).unwrap();
        assert_eq!(back.status, 10);
        let err = back.result::<String>().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn success_response_decodes_result() {
        let resp = ResponseEnvelope::ok(&42i64).unwrap();
        assert_eq!(resp.status, 0);
        assert_eq!(resp.result::<i64>().unwrap(), 42);
    }
}
