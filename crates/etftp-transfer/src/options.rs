//! RFC 2347 option lists: `name\0value\0` pairs after a request or in an OACK.
//!
//! Names are case-insensitive and stored lowercase. Numeric values are ASCII
//! decimal. The key exchange coordinates travel as lowercase hex so a zero
//! byte in a coordinate never collides with the NUL framing.

use std::collections::BTreeMap;

use etftp_crypto::{CurveError, PublicPoint};

use crate::error::ParseError;

pub const BLKSIZE: &str = "blksize";
pub const WINDOWSIZE: &str = "windowsize";
pub const TSIZE: &str = "tsize";
pub const TIMEOUT: &str = "timeout";
pub const KEYX: &str = "keyx";
pub const KEYY: &str = "keyy";

/// Split at the first NUL, dropping it.
pub(crate) fn split_cstr<'a>(
    buf: &'a [u8],
    field: &'static str,
) -> Result<(&'a [u8], &'a [u8]), ParseError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(ParseError::Unterminated(field))?;
    Ok((&buf[..end], &buf[end + 1..]))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<String, Vec<u8>>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn set_number(&mut self, name: &str, value: u64) {
        self.insert(name, value.to_string());
    }

    /// Parse an ASCII decimal value. `None` if absent or not a number.
    pub fn number(&self, name: &str) -> Option<u64> {
        let raw = self.get(name)?;
        if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(raw).ok()?.parse().ok()
    }

    pub fn set_public_point(&mut self, point: &PublicPoint) {
        self.insert(KEYX, hex::encode(point.x));
        self.insert(KEYY, hex::encode(point.y));
    }

    /// The peer's public point, or `None` if either coordinate is missing.
    pub fn public_point(&self) -> Option<Result<PublicPoint, CurveError>> {
        let x = self.get(KEYX)?;
        let y = self.get(KEYY)?;
        Some(decode_point(x, y))
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.0 {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
            buf.extend_from_slice(value);
            buf.push(0);
        }
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, ParseError> {
        let mut options = Options::new();
        while !body.is_empty() {
            let (name, rest) = split_cstr(body, "option name")?;
            if name.is_empty() {
                return Err(ParseError::EmptyOptionName);
            }
            let (value, rest) = split_cstr(rest, "option value")?;
            let name =
                std::str::from_utf8(name).map_err(|_| ParseError::InvalidUtf8("option name"))?;
            options.insert(name, value);
            body = rest;
        }
        Ok(options)
    }
}

fn decode_point(x: &[u8], y: &[u8]) -> Result<PublicPoint, CurveError> {
    let x = hex::decode(x).map_err(|_| CurveError::MalformedCoordinate)?;
    let y = hex::decode(y).map_err(|_| CurveError::MalformedCoordinate)?;
    PublicPoint::from_coordinates(&x, &y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etftp_crypto::KeyExchange;

    #[test]
    fn names_are_case_insensitive() {
        let mut options = Options::new();
        options.insert("BlkSize", "1024");
        assert_eq!(options.number("blksize"), Some(1024));
        assert_eq!(options.number("BLKSIZE"), Some(1024));
    }

    #[test]
    fn numbers_must_be_plain_decimal() {
        let mut options = Options::new();
        options.insert("a", "42");
        options.insert("b", "-1");
        options.insert("c", "");
        options.insert("d", "12x");
        options.insert("e", "99999999999999999999999");
        assert_eq!(options.number("a"), Some(42));
        assert_eq!(options.number("b"), None);
        assert_eq!(options.number("c"), None);
        assert_eq!(options.number("d"), None);
        assert_eq!(options.number("e"), None);
        assert_eq!(options.number("missing"), None);
    }

    #[test]
    fn decode_keeps_unknown_options() {
        let options = Options::decode(b"blksize\x001024\x00Color\x00blue\x00").unwrap();
        assert_eq!(options.len(), 2);
        assert_eq!(options.get("color"), Some(&b"blue"[..]));
    }

    #[test]
    fn decode_rejects_bad_framing() {
        assert_eq!(
            Options::decode(b"blksize\x001024"),
            Err(ParseError::Unterminated("option value"))
        );
        assert_eq!(
            Options::decode(b"blksize"),
            Err(ParseError::Unterminated("option name"))
        );
        assert_eq!(Options::decode(b"\x00value\x00"), Err(ParseError::EmptyOptionName));
    }

    #[test]
    fn public_point_travels_as_hex() {
        let point = KeyExchange::generate().public_point();
        let mut options = Options::new();
        options.set_public_point(&point);

        let x = options.get(KEYX).unwrap();
        assert_eq!(x.len(), 64);
        assert!(x.iter().all(|b| b.is_ascii_hexdigit()));

        let mut encoded = Vec::new();
        options.encode_into(&mut encoded);
        let decoded = Options::decode(&encoded).unwrap();
        assert_eq!(decoded.public_point(), Some(Ok(point)));
    }

    #[test]
    fn missing_or_garbled_point() {
        let mut options = Options::new();
        options.insert(KEYX, "abcd");
        assert_eq!(options.public_point(), None);

        options.insert(KEYY, "not hex");
        assert_eq!(options.public_point(), Some(Err(CurveError::MalformedCoordinate)));
    }
}
