//! Base64 data URLs, the wire form of images in prediction requests.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{Error, Result};

/// A decoded `data:<mime>;base64,<payload>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    mime: Option<String>,
    data: Vec<u8>,
}

impl DataUrl {
    /// Wrap raw bytes with a declared mime type.
    pub fn new(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime: Some(mime.into()),
            data,
        }
    }

    /// Parse an image data URL.
    ///
    /// A bare base64 payload without the `data:` header is also accepted; its
    /// mime type is then unknown and the raster format is sniffed on decode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DataUrl`] for non-image or non-base64 URLs and
    /// [`Error::Base64`] if the payload does not decode.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();

        let (mime, payload) = match input.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| Error::DataUrl {
                    reason: "missing ',' between header and payload".to_string(),
                })?;
                let mime = header.strip_suffix(";base64").ok_or_else(|| Error::DataUrl {
                    reason: format!("only base64 data URLs are supported, got '{header}'"),
                })?;
                if !mime.starts_with("image/") {
                    return Err(Error::DataUrl {
                        reason: format!("expected an image mime type, got '{mime}'"),
                    });
                }
                (Some(mime.to_string()), payload)
            }
            None => (None, input),
        };

        if payload.is_empty() {
            return Err(Error::DataUrl {
                reason: "empty payload".to_string(),
            });
        }

        let data = STANDARD.decode(payload)?;

        Ok(Self { mime, data })
    }

    /// Declared mime type, if the URL carried a header.
    #[must_use]
    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Decoded payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Display for DataUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mime = self.mime.as_deref().unwrap_or("application/octet-stream");
        write!(f, "data:{mime};base64,{}", STANDARD.encode(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_png_data_url() {
        let url = DataUrl::parse("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(url.mime(), Some("image/png"));
        assert_eq!(url.data(), b"hello");
    }

    #[test]
    fn test_parse_bare_payload() {
        let url = DataUrl::parse("  aGVsbG8=\n").unwrap();
        assert_eq!(url.mime(), None);
        assert_eq!(url.into_data(), b"hello");
    }

    #[test]
    fn test_display() {
        let url = DataUrl::new("image/jpeg", b"hello".to_vec());
        assert_eq!(url.to_string(), "data:image/jpeg;base64,aGVsbG8=");
        assert_eq!(DataUrl::parse(&url.to_string()).unwrap(), url);
    }

    #[test]
    fn test_rejects_malformed_base64() {
        let err = DataUrl::parse("data:image/png;base64,@@not base64@@").unwrap_err();
        assert!(matches!(err, Error::Base64(_)));
        assert!(err.is_request_error());
    }

    #[test]
    fn test_rejects_bad_headers() {
        for input in [
            "data:image/png;base64",
            "data:text/plain;base64,aGVsbG8=",
            "data:image/png,hello",
            "data:image/png;base64,",
        ] {
            let err = DataUrl::parse(input).unwrap_err();
            assert!(matches!(err, Error::DataUrl { .. }), "{input}: {err}");
        }
    }
}
