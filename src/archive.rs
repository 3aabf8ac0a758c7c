//! The record stream used to persist grids.
//!
//! A grid never touches bytes or files directly. It emits a self-describing sequence of tagged records through an
//! [`ArchiveWriter`] and reads it back through an [`ArchiveReader`]; choosing an encoding, compression or file name is up
//! to the archive implementation. [`TokenArchive`] is a simple in-memory implementation of both sides.

use crate::ArchiveError;

/// Sink for a stream of tagged records.
pub trait ArchiveWriter {
    /// Opens a record. Records nest.
    fn begin_value(&mut self, tag: &str) -> Result<(), ArchiveError>;
    fn write_i64(&mut self, x: i64) -> Result<(), ArchiveError>;
    fn write_u64(&mut self, x: u64) -> Result<(), ArchiveError>;
    fn write_f64(&mut self, x: f64) -> Result<(), ArchiveError>;
    fn write_str(&mut self, s: &str) -> Result<(), ArchiveError>;
    /// Closes the innermost open record.
    fn end_value(&mut self) -> Result<(), ArchiveError>;
}

/// Source of a stream of tagged records, the dual of [`ArchiveWriter`].
pub trait ArchiveReader {
    /// Opens the next record and returns its tag.
    fn read_begin(&mut self) -> Result<String, ArchiveError>;
    fn read_i64(&mut self) -> Result<i64, ArchiveError>;
    fn read_u64(&mut self) -> Result<u64, ArchiveError>;
    fn read_f64(&mut self) -> Result<f64, ArchiveError>;
    fn read_string(&mut self) -> Result<String, ArchiveError>;
    /// Consumes the end of the innermost open record.
    fn read_end(&mut self) -> Result<(), ArchiveError>;

    /// Opens the next record and fails unless it is tagged `tag`.
    fn expect_value(&mut self, tag: &str) -> Result<(), ArchiveError> {
        let found = self.read_begin()?;
        if found == tag {
            Ok(())
        } else {
            Err(ArchiveError::TagMismatch {
                expected: tag.to_owned(),
                found,
            })
        }
    }
}

/// A value that knows how to write itself to an archive and read itself back.
pub trait Archivable: Sized {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError>;
    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError>;
}

macro_rules! impl_archivable_signed {
    ($($t:ty),*) => {
        $(
            impl Archivable for $t {
                #[inline]
                fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
                    ar.write_i64(*self as i64)
                }

                #[inline]
                fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
                    let x = ar.read_i64()?;
                    <$t>::try_from(x).map_err(|_| {
                        ArchiveError::malformed(format!("{} does not fit in {}", x, stringify!($t)))
                    })
                }
            }
        )*
    };
}

macro_rules! impl_archivable_unsigned {
    ($($t:ty),*) => {
        $(
            impl Archivable for $t {
                #[inline]
                fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
                    ar.write_u64(*self as u64)
                }

                #[inline]
                fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
                    let x = ar.read_u64()?;
                    <$t>::try_from(x).map_err(|_| {
                        ArchiveError::malformed(format!("{} does not fit in {}", x, stringify!($t)))
                    })
                }
            }
        )*
    };
}

impl_archivable_signed!(i8, i16, i32, i64, isize);
impl_archivable_unsigned!(u8, u16, u32, u64, usize);

impl Archivable for f64 {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        ar.write_f64(*self)
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        ar.read_f64()
    }
}

impl Archivable for f32 {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        ar.write_f64(*self as f64)
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        Ok(ar.read_f64()? as f32)
    }
}

impl Archivable for bool {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        ar.write_u64(*self as u64)
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        match ar.read_u64()? {
            0 => Ok(false),
            1 => Ok(true),
            x => Err(ArchiveError::malformed(format!("{} is not a bool", x))),
        }
    }
}

impl Archivable for char {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        ar.write_u64(*self as u64)
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        let x = ar.read_u64()?;
        u32::try_from(x)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| ArchiveError::malformed(format!("{} is not a char", x)))
    }
}

impl Archivable for String {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        ar.write_str(self)
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        ar.read_string()
    }
}

impl<T: Archivable> Archivable for Option<T> {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        match self {
            Some(value) => {
                ar.begin_value("some")?;
                value.archive(ar)?;
            }
            None => ar.begin_value("none")?,
        }
        ar.end_value()
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        let tag = ar.read_begin()?;
        let value = match tag.as_str() {
            "some" => Some(T::unarchive(ar)?),
            "none" => None,
            _ => {
                return Err(ArchiveError::TagMismatch {
                    expected: "some|none".to_owned(),
                    found: tag,
                })
            }
        };
        ar.read_end()?;
        Ok(value)
    }
}

impl<T: Archivable, const N: usize> Archivable for [T; N] {
    fn archive<W: ArchiveWriter + ?Sized>(&self, ar: &mut W) -> Result<(), ArchiveError> {
        for value in self.iter() {
            value.archive(ar)?;
        }
        Ok(())
    }

    fn unarchive<R: ArchiveReader + ?Sized>(ar: &mut R) -> Result<Self, ArchiveError> {
        let values = (0..N)
            .map(|_| T::unarchive(ar))
            .collect::<Result<Vec<T>, _>>()?;
        values
            .try_into()
            .map_err(|_| ArchiveError::malformed("array length changed while reading"))
    }
}

/// One element of a [`TokenArchive`].
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Begin(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    End,
}

/// An in-memory archive: writing appends tokens, reading consumes them from the front.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenArchive {
    tokens: Vec<Token>,
    read_pos: usize,
}

impl TokenArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            read_pos: 0,
        }
    }

    #[inline]
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    /// Moves the read position back to the first token.
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// The number of tokens not yet read.
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.read_pos
    }

    fn next_token(&mut self) -> Result<&Token, ArchiveError> {
        let token = self
            .tokens
            .get(self.read_pos)
            .ok_or(ArchiveError::UnexpectedEnd)?;
        self.read_pos += 1;
        Ok(token)
    }
}

fn type_mismatch(expected: &'static str, found: &Token) -> ArchiveError {
    ArchiveError::TypeMismatch {
        expected,
        found: format!("{:?}", found),
    }
}

impl ArchiveWriter for TokenArchive {
    fn begin_value(&mut self, tag: &str) -> Result<(), ArchiveError> {
        self.tokens.push(Token::Begin(tag.to_owned()));
        Ok(())
    }

    fn write_i64(&mut self, x: i64) -> Result<(), ArchiveError> {
        self.tokens.push(Token::Int(x));
        Ok(())
    }

    fn write_u64(&mut self, x: u64) -> Result<(), ArchiveError> {
        self.tokens.push(Token::UInt(x));
        Ok(())
    }

    fn write_f64(&mut self, x: f64) -> Result<(), ArchiveError> {
        self.tokens.push(Token::Float(x));
        Ok(())
    }

    fn write_str(&mut self, s: &str) -> Result<(), ArchiveError> {
        self.tokens.push(Token::Str(s.to_owned()));
        Ok(())
    }

    fn end_value(&mut self) -> Result<(), ArchiveError> {
        self.tokens.push(Token::End);
        Ok(())
    }
}

impl ArchiveReader for TokenArchive {
    fn read_begin(&mut self) -> Result<String, ArchiveError> {
        match self.next_token()? {
            Token::Begin(tag) => Ok(tag.clone()),
            other => Err(type_mismatch("record", other)),
        }
    }

    fn read_i64(&mut self) -> Result<i64, ArchiveError> {
        match self.next_token()? {
            Token::Int(x) => Ok(*x),
            other => Err(type_mismatch("signed integer", other)),
        }
    }

    fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        match self.next_token()? {
            Token::UInt(x) => Ok(*x),
            other => Err(type_mismatch("unsigned integer", other)),
        }
    }

    fn read_f64(&mut self) -> Result<f64, ArchiveError> {
        match self.next_token()? {
            Token::Float(x) => Ok(*x),
            other => Err(type_mismatch("float", other)),
        }
    }

    fn read_string(&mut self) -> Result<String, ArchiveError> {
        match self.next_token()? {
            Token::Str(s) => Ok(s.clone()),
            other => Err(type_mismatch("string", other)),
        }
    }

    fn read_end(&mut self) -> Result<(), ArchiveError> {
        match self.next_token()? {
            Token::End => Ok(()),
            other => Err(type_mismatch("end of record", other)),
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
