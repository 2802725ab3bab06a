//! `data:` URL codec for Ignition file contents
//!
//! Ignition embeds file payloads as `data:[<mediatype>][;base64],<payload>`.
//! The installer always emits the base64 form, which is the only form we
//! accept.

use base64::{engine::general_purpose::STANDARD, Engine};

use strata_common::{Error, Result};

/// Header used for every payload we write
pub const DATA_URL_PREFIX: &str = "data:text/plain;charset=utf-8;base64,";

/// Encode bytes as a base64 data URL
pub fn encode(data: &[u8]) -> String {
    format!("{}{}", DATA_URL_PREFIX, STANDARD.encode(data))
}

/// Decode a base64 data URL into bytes
pub fn decode(url: &str) -> Result<Vec<u8>> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| Error::ignition("contents.source", "source is not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::ignition("contents.source", "data URL has no payload separator"))?;
    if !header.split(';').any(|param| param == "base64") {
        return Err(Error::ignition(
            "contents.source",
            format!("unsupported data URL encoding: {}", header),
        ));
    }
    STANDARD
        .decode(payload)
        .map_err(|e| Error::ignition("contents.source", format!("invalid base64 payload: {}", e)))
}
