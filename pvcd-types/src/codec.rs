//! A single typed codec layer between raw coordination-store bytes and the
//! cluster's value types. Every value is ASCII or opaque bytes (spec: all
//! store values are ASCII or opaque bytes) so decoding goes through `FromStr`
//! and encoding through `Display`; there is no "decode or treat as empty"
//! fallback here, malformed data is always a `CodecError` a caller must act
//! on.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("value for '{field}' is not valid UTF-8")]
    NotUtf8 { field: &'static str },
    #[error("value for '{field}' is malformed: '{value}'")]
    Malformed { field: &'static str, value: String },
}

impl CodecError {
    pub fn invalid(field: &'static str, value: &str) -> Self {
        CodecError::Malformed {
            field,
            value: value.to_string(),
        }
    }
}

/// Decode a raw store value for `field`, failing loudly on anything that
/// isn't well-formed rather than defaulting to an empty/zero value.
pub fn decode<T>(field: &'static str, raw: &[u8]) -> Result<T, CodecError>
where
    T: FromStr,
{
    let text = std::str::from_utf8(raw)
        .map_err(|_| CodecError::NotUtf8 { field })?
        .trim();
    text.parse()
        .map_err(|_| CodecError::invalid(field, text))
}

/// Encode a value into the bytes written to the store.
pub fn encode<T: fmt::Display>(value: &T) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode a comma-separated list (`node_limit`, `rbdlist`). An empty value
/// decodes to an empty list rather than a one-element list containing "".
pub fn decode_list(field: &'static str, raw: &[u8]) -> Result<Vec<String>, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8 { field })?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    Ok(text.split(',').map(|part| part.trim().to_string()).collect())
}

pub fn encode_list(values: &[String]) -> Vec<u8> {
    values.join(",").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DomainState;

    #[test]
    fn decodes_known_domain_state() {
        let state: DomainState = decode("state", b"start").unwrap();
        assert_eq!(state, DomainState::Start);
    }

    #[test]
    fn refuses_malformed_domain_state_instead_of_defaulting() {
        let err = decode::<DomainState>("state", b"sttart").unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn empty_list_decodes_to_empty_not_one_blank_entry() {
        assert_eq!(decode_list("node_limit", b"").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn list_round_trips() {
        let values = vec!["hv1".to_string(), "hv2".to_string()];
        let encoded = encode_list(&values);
        assert_eq!(decode_list("node_limit", &encoded).unwrap(), values);
    }
}
