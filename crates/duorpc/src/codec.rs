//! # Codec
//!
//! The translation layer between `Value` and the duopack wire format.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **No Closures On The Wire**: Functions are exported through a `CallbackSink` and
//!   written as callback ids; ids read back are resolved through a `CallbackSource`.

use std::collections::BTreeMap;

use duopack::Decoder;
use duopack::Encoder;
use duopack::Tag;

use crate::error::Error;
use crate::error::Result;
use crate::value::Function;
use crate::value::Value;

/// The maximum nesting depth for Values.
const MAX_RECURSION_DEPTH: usize = 64;

/// Registers outbound functions and hands back the id to put on the wire.
pub trait CallbackSink {
    fn export(&self, function: &Function) -> Result<u64>;
}

/// Turns inbound callback ids into invokable functions.
pub trait CallbackSource {
    fn import(&self, id: u64) -> Result<Function>;
}

/// Sink and source for contexts where functions cannot appear (the handshake).
pub struct NoCallbacks;

impl CallbackSink for NoCallbacks {
    fn export(&self, _function: &Function) -> Result<u64> {
        Err(Error::UnexpectedCallback)
    }
}

impl CallbackSource for NoCallbacks {
    fn import(&self, _id: u64) -> Result<Function> {
        Err(Error::UnexpectedCallback)
    }
}

/// Encodes a `Value` into the encoder stream.
///
/// # Errors
/// Returns `Error::RecursionLimitExceeded` if the value is too deeply nested.
pub fn encode_value(enc: &mut Encoder, val: &Value, sink: &dyn CallbackSink) -> Result<()> {
    encode_value_impl(enc, val, sink, 0)
}

fn encode_value_impl(enc: &mut Encoder, val: &Value, sink: &dyn CallbackSink, depth: usize) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    match val {
        Value::Null => enc.null()?,
        Value::Bool(b) => enc.bool(*b)?,
        Value::Number(n) => enc.f64(*n)?,
        Value::String(s) => enc.str(s)?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_impl(enc, item, sink, depth + 1)?;
            }
            enc.list_end()?;
        },
        Value::Map(entries) => {
            enc.map_begin()?;
            for (key, value) in entries {
                enc.variant_begin(key)?;
                encode_value_impl(enc, value, sink, depth + 1)?;
                enc.variant_end()?;
            }
            enc.map_end()?;
        },
        Value::Function(f) => {
            let id = sink.export(f)?;
            enc.callback(id)?;
        },
    }
    Ok(())
}

/// Decodes a single `Value`.
pub fn decode_value(dec: &mut Decoder, source: &dyn CallbackSource) -> Result<Value> {
    decode_value_impl(dec, source, 0)
}

fn decode_value_impl(dec: &mut Decoder, source: &dyn CallbackSource, depth: usize) -> Result<Value> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    let value = match dec.peek_tag()? {
        Tag::Null => { dec.null()?; Value::Null },
        Tag::BoolTrue | Tag::BoolFalse => Value::Bool(dec.bool()?),
        Tag::F64 => Value::Number(dec.f64()?),
        Tag::String => Value::String(dec.str()?.to_string()),
        Tag::List => {
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = iter.next()? {
                items.push(decode_value_impl(&mut item, source, depth + 1)?);
            }
            Value::List(items)
        },
        Tag::Map => {
            let mut iter = dec.map()?;
            let mut entries = BTreeMap::new();
            while let Some((key, mut item)) = iter.next()? {
                entries.insert(key.to_string(), decode_value_impl(&mut item, source, depth + 1)?);
            }
            Value::Map(entries)
        },
        Tag::Callback => Value::Function(source.import(dec.callback()?)?),
        tag @ (Tag::U64 | Tag::ResultOk | Tag::ResultErr | Tag::Variant) => {
            return Err(Error::ProtocolViolation(format!("Tag {:?} is not a value", tag)));
        }
    };
    Ok(value)
}
