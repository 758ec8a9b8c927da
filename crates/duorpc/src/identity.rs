//! Peer identity and credentials exchanged during the handshake.

use duopack::Decoder;
use duopack::Encoder;

use crate::error::Error;
use crate::error::Result;

/// Who a peer is. Announced in `Hello` and `Welcome` frames.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub region: String,
    pub environment: String,
    pub instance_id: String,
}

impl Identity {
    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        write_map_str(enc, "name", &self.name)?;
        write_map_str(enc, "version", &self.version)?;
        write_map_u64(enc, "port", u64::from(self.port))?;
        write_map_str(enc, "region", &self.region)?;
        write_map_str(enc, "environment", &self.environment)?;
        write_map_str(enc, "instance_id", &self.instance_id)?;
        enc.map_end()?;
        Ok(())
    }

    pub(crate) fn decode(dec: &mut Decoder) -> Result<Self> {
        let mut map = dec.map()?;
        let mut identity = Identity::default();
        let mut has_name = false;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "name" => { identity.name = val.str()?.to_string(); has_name = true; }
                "version" => identity.version = val.str()?.to_string(),
                "port" => {
                    let port = val.u64()?;
                    identity.port = u16::try_from(port)
                        .map_err(|_| Error::ProtocolViolation(format!("Port out of range: {}", port)))?;
                }
                "region" => identity.region = val.str()?.to_string(),
                "environment" => identity.environment = val.str()?.to_string(),
                "instance_id" => identity.instance_id = val.str()?.to_string(),
                _ => val.skip()?,
            }
        }

        if !has_name {
            return Err(Error::ProtocolViolation("Missing identity name".into()));
        }
        Ok(identity)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}/{}", self.name, self.version, self.region, self.environment)
    }
}

/// Authentication material presented by the dialing peer.
///
/// The scheme selects which authenticator validates the key on the listening side.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub scheme: String,
    pub key: String,
}

impl Credential {
    pub fn new(scheme: impl Into<String>, key: impl Into<String>) -> Self {
        Self { scheme: scheme.into(), key: key.into() }
    }

    pub(crate) fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        write_map_str(enc, "scheme", &self.scheme)?;
        write_map_str(enc, "key", &self.key)?;
        enc.map_end()?;
        Ok(())
    }

    pub(crate) fn decode(dec: &mut Decoder) -> Result<Self> {
        let mut map = dec.map()?;
        let mut scheme = None;
        let mut key = None;

        while let Some((name, mut val)) = map.next()? {
            match name {
                "scheme" => scheme = Some(val.str()?.to_string()),
                "key" => key = Some(val.str()?.to_string()),
                _ => val.skip()?,
            }
        }

        Ok(Self {
            scheme: scheme.ok_or(Error::ProtocolViolation("Missing credential scheme".into()))?,
            key: key.ok_or(Error::ProtocolViolation("Missing credential key".into()))?,
        })
    }
}

// keys never end up in logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("key", &"<redacted>")
            .finish()
    }
}

pub(crate) fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

pub(crate) fn write_map_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u64(val)?;
    enc.variant_end()?;
    Ok(())
}
