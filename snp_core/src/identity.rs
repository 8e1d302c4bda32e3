//! Opaque identity values exchanged during the handshake and used to key
//! certificates and connections: SteamID, IP address, a short generic
//! string, generic bytes, or an unrecognized forward-compatible form.

use std::fmt;

use crate::ipaddr::{self, IpEndpoint};

pub const MAX_GENERIC_STRING_LEN: usize = 31;
pub const MAX_GENERIC_BYTES_LEN: usize = 32;

/// A 64-bit SteamID, opaque at this layer (no universe/account-type
/// decomposition is needed by the transport core; identity equality is by
/// raw value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SteamId(pub u64);

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tagged sum of identity kinds, per the data model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Invalid,
    SteamId(SteamId),
    Ip(IpEndpoint),
    GenericString(String),
    GenericBytes(Vec<u8>),
    /// Forward-compatibility carrier: an unrecognized `<prefix>:...` form,
    /// preserved verbatim. Open Question #1: two unknowns compare equal
    /// by exact byte equality of the raw string (the legacy behavior).
    UnknownRaw(String),
}

impl Identity {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Identity::Invalid)
    }

    /// Canonical text form: `steamid:`, `ip:`, `str:`, `gen:<hex>`, or the
    /// raw `<prefix>:...` string for unknown forms.
    pub fn to_canonical_string(&self) -> String {
        match self {
            Identity::Invalid => "invalid".to_string(),
            Identity::SteamId(id) => format!("steamid:{}", id.0),
            Identity::Ip(ep) => format!("ip:{}", ep),
            Identity::GenericString(s) => format!("str:{}", s),
            Identity::GenericBytes(b) => format!("gen:{}", hex::encode(b)),
            Identity::UnknownRaw(raw) => raw.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityParseError;

impl fmt::Display for IdentityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identity string")
    }
}
impl std::error::Error for IdentityParseError {}

/// Tolerant parser: recognizes the strict canonical prefixes, and
/// preserves any other `<prefix>:...` form verbatim as `UnknownRaw` per
/// the legacy tolerant behavior, rather than rejecting it.
pub fn parse_identity(s: &str) -> Result<Identity, IdentityParseError> {
    if s == "invalid" {
        return Ok(Identity::Invalid);
    }
    if let Some(rest) = s.strip_prefix("steamid:") {
        let v: u64 = rest.parse().map_err(|_| IdentityParseError)?;
        return Ok(Identity::SteamId(SteamId(v)));
    }
    if let Some(rest) = s.strip_prefix("ip:") {
        let ep = ipaddr::parse_ip_endpoint(rest).map_err(|_| IdentityParseError)?;
        return Ok(Identity::Ip(ep));
    }
    if let Some(rest) = s.strip_prefix("str:") {
        if rest.len() > MAX_GENERIC_STRING_LEN {
            return Err(IdentityParseError);
        }
        return Ok(Identity::GenericString(rest.to_string()));
    }
    if let Some(rest) = s.strip_prefix("gen:") {
        let bytes = hex::decode(rest).map_err(|_| IdentityParseError)?;
        if bytes.len() > MAX_GENERIC_BYTES_LEN {
            return Err(IdentityParseError);
        }
        return Ok(Identity::GenericBytes(bytes));
    }
    if s.contains(':') {
        return Ok(Identity::UnknownRaw(s.to_string()));
    }
    Err(IdentityParseError)
}

impl std::str::FromStr for Identity {
    type Err = IdentityParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identity(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipaddr::IpAddr;

    #[test]
    fn id_001_steamid_roundtrip() {
        let id = Identity::SteamId(SteamId(76561198000000000));
        let s = id.to_canonical_string();
        assert_eq!(s, "steamid:76561198000000000");
        assert_eq!(parse_identity(&s).unwrap(), id);
    }

    #[test]
    fn id_002_ip_roundtrip() {
        let id = Identity::Ip(IpEndpoint { ip: IpAddr::v4(1, 2, 3, 4), port: 27015 });
        let s = id.to_canonical_string();
        assert_eq!(s, "ip:1.2.3.4:27015");
        assert_eq!(parse_identity(&s).unwrap(), id);
    }

    #[test]
    fn id_003_generic_string_roundtrip() {
        let id = Identity::GenericString("bot-7".to_string());
        let s = id.to_canonical_string();
        assert_eq!(parse_identity(&s).unwrap(), id);
    }

    #[test]
    fn id_004_generic_bytes_roundtrip() {
        let id = Identity::GenericBytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let s = id.to_canonical_string();
        assert_eq!(s, "gen:deadbeef");
        assert_eq!(parse_identity(&s).unwrap(), id);
    }

    #[test]
    fn id_005_unknown_prefix_preserved_verbatim() {
        let raw = "futuretype:abcxyz";
        let id = parse_identity(raw).unwrap();
        assert_eq!(id, Identity::UnknownRaw(raw.to_string()));
        assert_eq!(id.to_canonical_string(), raw);
    }

    #[test]
    fn id_006_unknown_raw_equality_is_byte_exact() {
        let a = Identity::UnknownRaw("x:AbC".to_string());
        let b = Identity::UnknownRaw("x:abc".to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn id_007_invalid_roundtrip() {
        assert_eq!(parse_identity("invalid").unwrap(), Identity::Invalid);
        assert!(!Identity::Invalid.is_valid());
    }

    #[test]
    fn id_008_generic_string_too_long_rejected() {
        let too_long = "a".repeat(MAX_GENERIC_STRING_LEN + 1);
        assert!(parse_identity(&format!("str:{}", too_long)).is_err());
    }
}
