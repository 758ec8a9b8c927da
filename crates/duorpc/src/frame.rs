//! # Protocol Frames
//!
//! Every message on a connection is exactly one `Frame`.
//!
//! ## Wire Shape
//! `Variant(kind) { Map { field: value, ... } }`, where `kind` is one of
//! `Hello`, `Welcome`, `Reject`, `Request`, `Response`, `Invoke`.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown header fields are safely skipped.
//! - **Id Pairing**: A `Response` carries the id of the `Request` or `Invoke` it answers.

use duopack::Decoder;
use duopack::Encoder;

use crate::codec::CallbackSink;
use crate::codec::CallbackSource;
use crate::codec::decode_value;
use crate::codec::encode_value;
use crate::error::Error;
use crate::error::Failure;
use crate::error::FailureKind;
use crate::error::Result;
use crate::identity::Credential;
use crate::identity::Identity;
use crate::identity::write_map_str;
use crate::identity::write_map_u64;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Dialer -> listener: who I am and how I authenticate.
    Hello { identity: Identity, credential: Credential },
    /// Listener -> dialer: credential accepted.
    Welcome { identity: Identity },
    /// Listener -> dialer: credential rejected. The connection ends here.
    Reject { reason: String },
    /// A method call. `reply = false` marks a fire-and-forget call.
    Request { id: u64, method: String, args: Value, reply: bool },
    /// The single answer to a `Request` (with `reply = true`) or an `Invoke`.
    Response { id: u64, result: std::result::Result<Value, Failure> },
    /// Invocation of a callback previously exported by the receiving side.
    Invoke { id: u64, callback: u64, args: Value },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "Hello",
            Frame::Welcome { .. } => "Welcome",
            Frame::Reject { .. } => "Reject",
            Frame::Request { .. } => "Request",
            Frame::Response { .. } => "Response",
            Frame::Invoke { .. } => "Invoke",
        }
    }

    /// Encodes the frame, exporting any embedded functions through `sink`.
    pub fn encode(&self, sink: &dyn CallbackSink) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.variant_begin(self.kind())?;
        enc.map_begin()?;

        match self {
            Frame::Hello { identity, credential } => {
                enc.variant_begin("identity")?;
                identity.encode(&mut enc)?;
                enc.variant_end()?;
                enc.variant_begin("credential")?;
                credential.encode(&mut enc)?;
                enc.variant_end()?;
            }
            Frame::Welcome { identity } => {
                enc.variant_begin("identity")?;
                identity.encode(&mut enc)?;
                enc.variant_end()?;
            }
            Frame::Reject { reason } => {
                write_map_str(&mut enc, "reason", reason)?;
            }
            Frame::Request { id, method, args, reply } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_str(&mut enc, "method", method)?;
                enc.variant_begin("reply")?;
                enc.bool(*reply)?;
                enc.variant_end()?;
                enc.variant_begin("args")?;
                encode_value(&mut enc, args, sink)?;
                enc.variant_end()?;
            }
            Frame::Response { id, result } => {
                write_map_u64(&mut enc, "id", *id)?;
                enc.variant_begin("result")?;
                match result {
                    Ok(value) => {
                        enc.result_ok_begin()?;
                        encode_value(&mut enc, value, sink)?;
                        enc.result_ok_end()?;
                    }
                    Err(failure) => {
                        enc.result_err_begin()?;
                        enc.variant_begin(failure.kind.as_tag())?;
                        enc.str(&failure.message)?;
                        enc.variant_end()?;
                        enc.result_err_end()?;
                    }
                }
                enc.variant_end()?;
            }
            Frame::Invoke { id, callback, args } => {
                write_map_u64(&mut enc, "id", *id)?;
                write_map_u64(&mut enc, "callback", *callback)?;
                enc.variant_begin("args")?;
                encode_value(&mut enc, args, sink)?;
                enc.variant_end()?;
            }
        }

        enc.map_end()?;
        enc.variant_end()?;
        Ok(enc.into_bytes()?)
    }

    /// Decodes a frame, resolving callback ids through `source`.
    pub fn decode(bytes: &[u8], source: &dyn CallbackSource) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (kind, mut body) = dec.variant()?;
        if dec.remaining() != 0 {
            return Err(Error::ProtocolViolation("Trailing bytes after frame".into()));
        }

        let mut map = body.map()?;
        let mut fields = Fields::default();

        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => fields.id = Some(val.u64()?),
                "callback" => fields.callback = Some(val.u64()?),
                "method" => fields.method = Some(val.str()?.to_string()),
                "reason" => fields.reason = Some(val.str()?.to_string()),
                "reply" => fields.reply = Some(val.bool()?),
                "args" => fields.args = Some(decode_value(&mut val, source)?),
                "identity" => fields.identity = Some(Identity::decode(&mut val)?),
                "credential" => fields.credential = Some(Credential::decode(&mut val)?),
                "result" => fields.result = Some(decode_result(&mut val, source)?),
                _ => val.skip()?,
            }
        }

        match kind {
            "Hello" => Ok(Frame::Hello {
                identity: required(fields.identity, "identity")?,
                credential: required(fields.credential, "credential")?,
            }),
            "Welcome" => Ok(Frame::Welcome {
                identity: required(fields.identity, "identity")?,
            }),
            "Reject" => Ok(Frame::Reject {
                reason: required(fields.reason, "reason")?,
            }),
            "Request" => Ok(Frame::Request {
                id: required(fields.id, "id")?,
                method: required(fields.method, "method")?,
                args: fields.args.unwrap_or_default(),
                reply: fields.reply.unwrap_or(true),
            }),
            "Response" => Ok(Frame::Response {
                id: required(fields.id, "id")?,
                result: required(fields.result, "result")?,
            }),
            "Invoke" => Ok(Frame::Invoke {
                id: required(fields.id, "id")?,
                callback: required(fields.callback, "callback")?,
                args: fields.args.unwrap_or_default(),
            }),
            _ => Err(Error::UnknownVariant(format!("Top-level frame: {}", kind))),
        }
    }
}

#[derive(Default)]
struct Fields {
    id: Option<u64>,
    callback: Option<u64>,
    method: Option<String>,
    reason: Option<String>,
    reply: Option<bool>,
    args: Option<Value>,
    identity: Option<Identity>,
    credential: Option<Credential>,
    result: Option<std::result::Result<Value, Failure>>,
}

fn required<T>(field: Option<T>, name: &str) -> Result<T> {
    field.ok_or_else(|| Error::ProtocolViolation(format!("Missing {}", name)))
}

fn decode_result(dec: &mut Decoder, source: &dyn CallbackSource) -> Result<std::result::Result<Value, Failure>> {
    match dec.result()? {
        Ok(mut ok_body) => Ok(Ok(decode_value(&mut ok_body, source)?)),
        Err(mut err_body) => {
            let (tag, mut message) = err_body.variant()?;
            let kind = FailureKind::from_tag(tag)?;
            Ok(Err(Failure::new(kind, message.str()?)))
        }
    }
}

/// The routing fields of a frame, readable even when its arguments are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    pub kind: &'a str,
    pub id: u64,
    /// Whether the sender waits for a `Response`. Only a `Request` can say no.
    pub reply: bool,
}

/// Reads the kind, id and reply flag of a frame without decoding its
/// arguments, so that an undecodable call can still be answered.
pub fn peek_header(bytes: &[u8]) -> Result<Header<'_>> {
    let mut dec = Decoder::new(bytes);
    let (kind, mut body) = dec.variant()?;
    let mut map = body.map()?;
    let mut id = None;
    let mut reply = true;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "id" => id = Some(val.u64()?),
            "reply" if kind == "Request" => reply = val.bool()?,
            _ => val.skip()?,
        }
    }

    Ok(Header { kind, id: required(id, "id")?, reply })
}
