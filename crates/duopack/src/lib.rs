//! # Duopack
//!
//! The byte format spoken between duplex peers: one tag byte, then either
//! nothing, an 8-byte word, or a `u32` length and that many body bytes.
//!
//! ## Philosophy
//!
//! - **Explicit nesting**: `Encoder` keeps its own stack of open containers
//!   and rejects structure the decoder could not read back.
//! - **Skippable**: every item announces its own extent, so readers can step
//!   over fields they do not understand.
//! - **Borrowed reads**: a `Decoder` is a checked window onto the input and
//!   never copies string data.
//!
//! ## Layout
//!
//! | class   | tags                                   | after the tag         |
//! |---------|----------------------------------------|-----------------------|
//! | bare    | `BoolTrue` `BoolFalse` `Null`          | nothing               |
//! | word    | `U64` `F64` `Callback`                 | 8 bytes, LE           |
//! | sized   | `String` `List` `Map` `Result*` `Variant` | `u32` LE length, body |


/// Everything that can go wrong while writing or reading duopack bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Unknown tag byte, or a known tag where another was required.
    InvalidTag(u8),
    /// A string body is not UTF-8.
    InvalidUtf8,
    /// `*_end` called for a container other than the innermost one.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// `*_end` called with nothing open.
    ScopeUnderflow,
    /// `into_bytes` called with containers still open.
    ScopeStillOpen,
    /// Input ended inside an item.
    UnexpectedEnd,
    /// A body longer than a `u32` can describe.
    BlobTooLarge(usize),
    /// Second item written into a single-item container.
    TooManyItems(Scope),
    /// Single-item container closed while empty.
    EmptyAdt(Scope),
    /// Something other than a variant written directly into a map.
    InvalidMapEntry,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(byte) => write!(f, "unexpected tag byte {:#04x}", byte),
            Error::InvalidUtf8 => write!(f, "string body is not valid utf-8"),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "cannot close {:?} while {:?} is innermost", expected, actual)
            }
            Error::ScopeUnderflow => write!(f, "no open container to close"),
            Error::ScopeStillOpen => write!(f, "containers left open at end of encoding"),
            Error::UnexpectedEnd => write!(f, "input ended mid-item"),
            Error::BlobTooLarge(len) => write!(f, "body of {} bytes exceeds u32 length", len),
            Error::TooManyItems(scope) => write!(f, "{:?} holds a single item", scope),
            Error::EmptyAdt(scope) => write!(f, "{:?} closed without its item", scope),
            Error::InvalidMapEntry => write!(f, "map entries must be variants"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// First byte of every encoded item.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U64 = 0x06,
    F64 = 0x0C,
    Null = 0x0E,
    String = 0x10,
    List = 0x20,
    Map = 0x21,
    ResultOk = 0x31,
    ResultErr = 0x32,
    Variant = 0x33,
    Callback = 0x40,
}

/// What follows a tag on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Body {
    Bare,
    Word,
    Sized,
}

const TAGS: [Tag; 12] = [
    Tag::BoolTrue,
    Tag::BoolFalse,
    Tag::U64,
    Tag::F64,
    Tag::Null,
    Tag::String,
    Tag::List,
    Tag::Map,
    Tag::ResultOk,
    Tag::ResultErr,
    Tag::Variant,
    Tag::Callback,
];

impl Tag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        TAGS.iter().copied().find(|tag| *tag as u8 == byte)
    }

    fn body(self) -> Body {
        match self {
            Tag::BoolTrue | Tag::BoolFalse | Tag::Null => Body::Bare,
            Tag::U64 | Tag::F64 | Tag::Callback => Body::Word,
            _ => Body::Sized,
        }
    }
}

/// Container kinds tracked by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Top level, outside any container.
    Root,
    List,
    /// Holds only variants, one per key.
    Map,
    /// `ResultOk` or `ResultErr`, holding one item.
    Result,
    /// A name followed by one item.
    Variant,
}

impl Scope {
    fn single(self) -> bool {
        matches!(self, Scope::Result | Scope::Variant)
    }
}

/// An open container: where its body begins and how many items it holds.
struct Open {
    scope: Scope,
    body_at: usize,
    items: usize,
}

/// Writes items into a growing buffer, back-filling container lengths as
/// each container closes.
///
/// Maps accept only variants, results and variants accept exactly one item,
/// and the bytes are only released once every container is closed.
pub struct Encoder {
    out: Vec<u8>,
    open: Vec<Open>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            out: Vec::with_capacity(256),
            open: vec![Open { scope: Scope::Root, body_at: 0, items: 0 }],
        }
    }

    /// Hands back the encoded bytes, or `ScopeStillOpen` if a container was
    /// never closed.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.open.len() {
            1 => Ok(self.out),
            _ => Err(Error::ScopeStillOpen),
        }
    }

    fn innermost(&mut self) -> &mut Open {
        let depth = self.open.len() - 1;
        &mut self.open[depth]
    }

    /// Checks that `tag` may start an item here and counts it.
    fn admit(&mut self, tag: Tag) -> Result<()> {
        let open = self.innermost();
        if open.scope == Scope::Map && tag != Tag::Variant {
            return Err(Error::InvalidMapEntry);
        }
        if open.scope.single() && open.items > 0 {
            return Err(Error::TooManyItems(open.scope));
        }
        open.items += 1;
        Ok(())
    }

    fn put_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::BlobTooLarge(len))?;
        self.out.extend_from_slice(&len.to_le_bytes());
        Ok(())
    }

    fn put_bare(&mut self, tag: Tag) -> Result<()> {
        self.admit(tag)?;
        self.out.push(tag as u8);
        Ok(())
    }

    fn put_word(&mut self, tag: Tag, word: [u8; 8]) -> Result<()> {
        self.admit(tag)?;
        self.out.push(tag as u8);
        self.out.extend_from_slice(&word);
        Ok(())
    }

    fn open(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.admit(tag)?;
        self.out.push(tag as u8);
        self.out.extend_from_slice(&[0; 4]);
        let body_at = self.out.len();
        self.open.push(Open { scope, body_at, items: 0 });
        Ok(())
    }

    fn close(&mut self, scope: Scope) -> Result<()> {
        if self.open.len() == 1 {
            return Err(Error::ScopeUnderflow);
        }
        let open = self.innermost();
        if open.scope != scope {
            return Err(Error::ScopeMismatch { expected: scope, actual: open.scope });
        }
        if scope.single() && open.items == 0 {
            return Err(Error::EmptyAdt(scope));
        }
        let body_at = open.body_at;
        let len = self.out.len() - body_at;
        let len = u32::try_from(len).map_err(|_| Error::BlobTooLarge(len))?;
        self.out[body_at - 4..body_at].copy_from_slice(&len.to_le_bytes());
        self.open.pop();
        Ok(())
    }

    pub fn null(&mut self) -> Result<()> {
        self.put_bare(Tag::Null)
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.put_bare(if v { Tag::BoolTrue } else { Tag::BoolFalse })
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        self.put_word(Tag::U64, v.to_le_bytes())
    }

    pub fn f64(&mut self, v: f64) -> Result<()> {
        self.put_word(Tag::F64, v.to_le_bytes())
    }

    /// Writes a reference to a callback the receiver can invoke by `id`.
    pub fn callback(&mut self, id: u64) -> Result<()> {
        self.put_word(Tag::Callback, id.to_le_bytes())
    }

    pub fn str(&mut self, v: &str) -> Result<()> {
        if u32::try_from(v.len()).is_err() {
            return Err(Error::BlobTooLarge(v.len()));
        }
        self.admit(Tag::String)?;
        self.out.push(Tag::String as u8);
        self.put_len(v.len())?;
        self.out.extend_from_slice(v.as_bytes());
        Ok(())
    }

    pub fn list_begin(&mut self) -> Result<()> {
        self.open(Tag::List, Scope::List)
    }

    pub fn list_end(&mut self) -> Result<()> {
        self.close(Scope::List)
    }

    /// Opens a map; write each entry with `variant_begin(key)`.
    pub fn map_begin(&mut self) -> Result<()> {
        self.open(Tag::Map, Scope::Map)
    }

    pub fn map_end(&mut self) -> Result<()> {
        self.close(Scope::Map)
    }

    pub fn result_ok_begin(&mut self) -> Result<()> {
        self.open(Tag::ResultOk, Scope::Result)
    }

    pub fn result_ok_end(&mut self) -> Result<()> {
        self.close(Scope::Result)
    }

    pub fn result_err_begin(&mut self) -> Result<()> {
        self.open(Tag::ResultErr, Scope::Result)
    }

    pub fn result_err_end(&mut self) -> Result<()> {
        self.close(Scope::Result)
    }

    /// Opens a named variant. The name does not count as its item.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.open(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        self.innermost().items = 0;
        Ok(())
    }

    pub fn variant_end(&mut self) -> Result<()> {
        self.close(Scope::Variant)
    }
}

/// A read cursor over encoded bytes.
///
/// Container reads split off the container body as a decoder of its own,
/// so a nested reader can never run past its parent's bounds.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn peek_tag(&self) -> Result<Tag> {
        match self.rest.first() {
            None => Err(Error::UnexpectedEnd),
            Some(&byte) => Tag::from_u8(byte).ok_or(Error::InvalidTag(byte)),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.rest.len() < n {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn word(&mut self) -> Result<[u8; 8]> {
        let mut word = [0; 8];
        word.copy_from_slice(self.take(8)?);
        Ok(word)
    }

    fn sized_body(&mut self) -> Result<&'a [u8]> {
        let mut len = [0; 4];
        len.copy_from_slice(self.take(4)?);
        self.take(u32::from_le_bytes(len) as usize)
    }

    /// Consumes the tag byte if it is `want`.
    fn expect(&mut self, want: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != want {
            return Err(Error::InvalidTag(found as u8));
        }
        self.take(1).map(drop)
    }

    fn expect_word(&mut self, want: Tag) -> Result<[u8; 8]> {
        self.expect(want)?;
        self.word()
    }

    fn container(&mut self, want: Tag) -> Result<Decoder<'a>> {
        self.expect(want)?;
        Ok(Decoder::new(self.sized_body()?))
    }

    /// Steps over the next item, whatever it contains.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        match tag.body() {
            Body::Bare => Ok(()),
            Body::Word => self.take(8).map(drop),
            Body::Sized => self.sized_body().map(drop),
        }
    }

    pub fn null(&mut self) -> Result<()> {
        self.expect(Tag::Null)
    }

    pub fn bool(&mut self) -> Result<bool> {
        let value = match self.peek_tag()? {
            Tag::BoolTrue => true,
            Tag::BoolFalse => false,
            other => return Err(Error::InvalidTag(other as u8)),
        };
        self.take(1)?;
        Ok(value)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.expect_word(Tag::U64).map(u64::from_le_bytes)
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.expect_word(Tag::F64).map(f64::from_le_bytes)
    }

    pub fn callback(&mut self) -> Result<u64> {
        self.expect_word(Tag::Callback).map(u64::from_le_bytes)
    }

    /// Borrows a string straight out of the input.
    pub fn str(&mut self) -> Result<&'a str> {
        self.expect(Tag::String)?;
        let body = self.sized_body()?;
        std::str::from_utf8(body).map_err(|_| Error::InvalidUtf8)
    }

    pub fn list(&mut self) -> Result<Items<'a>> {
        self.container(Tag::List).map(|body| Items { body })
    }

    pub fn map(&mut self) -> Result<Entries<'a>> {
        self.container(Tag::Map).map(|body| Entries { body })
    }

    /// Reads a result, handing back the payload reader on the matching side.
    pub fn result(&mut self) -> Result<std::result::Result<Decoder<'a>, Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::ResultOk => self.container(Tag::ResultOk).map(Ok),
            Tag::ResultErr => self.container(Tag::ResultErr).map(Err),
            other => Err(Error::InvalidTag(other as u8)),
        }
    }

    /// Reads a variant as its name and a reader positioned at its item.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut body = self.container(Tag::Variant)?;
        let name = body.str()?;
        Ok((name, body))
    }
}

/// The items of a list, one decoder each.
#[derive(Debug)]
pub struct Items<'a> {
    body: Decoder<'a>,
}

impl<'a> Items<'a> {
    /// `Ok(None)` once the list is exhausted. A truncated or unknown item is
    /// an error rather than the end.
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.body.remaining() == 0 {
            return Ok(None);
        }
        let before = self.body.rest;
        self.body.skip()?;
        let used = before.len() - self.body.remaining();
        Ok(Some(Decoder::new(&before[..used])))
    }
}

/// The key/value entries of a map.
#[derive(Debug)]
pub struct Entries<'a> {
    body: Decoder<'a>,
}

impl<'a> Entries<'a> {
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.body.remaining() == 0 {
            return Ok(None);
        }
        self.body.variant().map(Some)
    }
}
