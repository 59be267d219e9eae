//! Content types accepted on the control endpoint.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid protobuf message: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Protobuf,
    Json,
}

impl ContentType {
    pub const PROTOBUF_MEDIA_TYPE: &'static str = "application/x-protobuf";
    pub const JSON_MEDIA_TYPE: &'static str = "application/json";

    pub fn media_type(&self) -> &'static str {
        match self {
            ContentType::Protobuf => Self::PROTOBUF_MEDIA_TYPE,
            ContentType::Json => Self::JSON_MEDIA_TYPE,
        }
    }

    /// Parse a `Content-Type` header value. Parameters such as `charset` are
    /// ignored.
    pub fn from_header(value: &str) -> Option<Self> {
        let media_type = value.split(';').next()?.trim().to_ascii_lowercase();
        match media_type.as_str() {
            Self::PROTOBUF_MEDIA_TYPE => Some(ContentType::Protobuf),
            Self::JSON_MEDIA_TYPE => Some(ContentType::Json),
            _ => None,
        }
    }

    /// Pick the response encoding from an `Accept` header.
    ///
    /// Without a header, or when a wildcard is acceptable, the response uses
    /// the request's encoding. Ranges with `q=0` are not acceptable.
    pub fn negotiate(accept: Option<&str>, request: ContentType) -> Option<Self> {
        let Some(accept) = accept.map(str::trim).filter(|a| !a.is_empty()) else {
            return Some(request);
        };

        let mut acceptable = Vec::new();
        for range in accept.split(',') {
            let mut parts = range.split(';');
            let media_range = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let rejected = parts.any(|param| {
                let param = param.trim().replace(' ', "");
                param == "q=0" || param == "q=0.0" || param == "q=0.00" || param == "q=0.000"
            });
            if !rejected {
                acceptable.push(media_range);
            }
        }

        let accepts = |content_type: ContentType| {
            acceptable.iter().any(|range| {
                range == "*/*" || range == "application/*" || range == content_type.media_type()
            })
        };

        if accepts(request) {
            return Some(request);
        }
        [ContentType::Json, ContentType::Protobuf]
            .into_iter()
            .find(|&content_type| accepts(content_type))
    }

    pub fn encode<M>(&self, message: &M) -> Result<Vec<u8>, CodecError>
    where
        M: prost::Message + Serialize,
    {
        match self {
            ContentType::Protobuf => Ok(message.encode_to_vec()),
            ContentType::Json => Ok(serde_json::to_vec(message)?),
        }
    }

    pub fn decode<M>(&self, body: &[u8]) -> Result<M, CodecError>
    where
        M: prost::Message + Default + DeserializeOwned,
    {
        match self {
            ContentType::Protobuf => Ok(M::decode(body)?),
            ContentType::Json => Ok(serde_json::from_slice(body)?),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.media_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::call::Call;
    use crate::provider::info::tests::storage_provider;

    #[test]
    fn test_from_header() {
        assert_eq!(
            ContentType::from_header("application/json; charset=utf-8"),
            Some(ContentType::Json)
        );
        assert_eq!(
            ContentType::from_header("Application/X-Protobuf"),
            Some(ContentType::Protobuf)
        );
        assert_eq!(ContentType::from_header("text/plain"), None);
    }

    #[test]
    fn test_negotiate() {
        use ContentType::*;

        assert_eq!(ContentType::negotiate(None, Protobuf), Some(Protobuf));
        assert_eq!(ContentType::negotiate(Some("*/*"), Json), Some(Json));
        assert_eq!(ContentType::negotiate(Some("application/*"), Protobuf), Some(Protobuf));
        assert_eq!(ContentType::negotiate(Some("application/json"), Protobuf), Some(Json));
        assert_eq!(
            ContentType::negotiate(Some("text/html, application/x-protobuf;q=0.5"), Json),
            Some(Protobuf)
        );
        assert_eq!(ContentType::negotiate(Some("text/html"), Json), None);
        assert_eq!(ContentType::negotiate(Some("application/json;q=0"), Json), None);
    }

    #[test]
    fn test_both_encodings_decode_to_same_call() {
        let call = Call::add(storage_provider("test", "/bin/plugin", "volume1:4GB"));
        for content_type in [ContentType::Protobuf, ContentType::Json] {
            let body = content_type.encode(&call).unwrap();
            let decoded: Call = content_type.decode(&body).unwrap();
            assert_eq!(decoded, call, "{}", content_type);
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ContentType::Json.decode::<Call>(b"{ nope").is_err());
        assert!(ContentType::Protobuf.decode::<Call>(&[0xff, 0xff, 0xff]).is_err());
    }
}
