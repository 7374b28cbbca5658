//! Declarations of named compound types, referenced from marker formats as
//! `#{name}`.
//!
//! ```text
//! decl     := int | "string" | "ptr" | enum | array | sequence | struct
//!           | union | <name of a defined type>
//! int      := s8 | s16 | s32 | s64 | u8 | u16 | u32 | u64
//!           | int | uint | long | ulong | size_t
//! enum     := "enum" "<" int ">" "{" label ("," label)* "}"
//! array    := "array" "<" number "," decl ">"
//! sequence := "sequence" "<" int "," decl ">"
//! struct   := "struct" "{" (name ":" decl ";")* "}"
//! union    := "union" "<" name ">" "{" (name ":" decl ";")* "}"
//! ```
//!
//! Widths of `int`, `long` and friends are resolved per marker, with the
//! producer widths recorded when the marker id was registered.

use super::MarkerError;
use super::field::FieldType;
use super::field::Member;
use crate::types::ArchWidths;
use compact_str::CompactString;
use std::collections::HashMap;

/// Width of an integer in a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    Fixed(u8),
    Int,
    Long,
    SizeT,
    Pointer,
}

impl IntWidth {
    pub fn resolve(self, widths: &ArchWidths) -> u8 {
        match self {
            Self::Fixed(size) => size,
            Self::Int => widths.int_size,
            Self::Long => widths.long_size,
            Self::SizeT => widths.size_t_size,
            Self::Pointer => widths.pointer_size,
        }
    }
}

/// A parsed, width independent type declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDecl {
    Signed(IntWidth),
    Unsigned(IntWidth),
    Pointer,
    String,
    Enum {
        width: IntWidth,
        labels: Vec<CompactString>,
    },
    Array {
        length: usize,
        element: Box<TypeDecl>,
    },
    Sequence {
        length: IntWidth,
        element: Box<TypeDecl>,
    },
    Struct(Vec<(CompactString, TypeDecl)>),
    Union {
        discriminant: CompactString,
        members: Vec<(CompactString, TypeDecl)>,
    },
}

impl TypeDecl {
    /// Parse a declaration. Names of earlier types are looked up in `known`
    /// and inlined.
    pub fn parse(text: &str, known: &HashMap<CompactString, Self>) -> Result<Self, MarkerError> {
        let mut parser = DeclParser {
            lexer: Lexer { text, pos: 0 },
            known,
        };
        let decl = parser.decl()?;
        match parser.lexer.next()? {
            Token::End => Ok(decl),
            token => Err(parser.unexpected(token)),
        }
    }

    /// True when every value of the type occupies no bytes.
    fn is_empty(&self) -> bool {
        match self {
            Self::Array { length, element } => *length == 0 || element.is_empty(),
            Self::Struct(members) | Self::Union { members, .. } => {
                members.iter().all(|(_, decl)| decl.is_empty())
            }
            _ => false,
        }
    }

    /// Concrete field type with the given producer widths.
    pub fn resolve(&self, widths: &ArchWidths) -> FieldType {
        match self {
            Self::Signed(width) => FieldType::SignedInt {
                size: width.resolve(widths),
            },
            Self::Unsigned(width) => FieldType::UnsignedInt {
                size: width.resolve(widths),
            },
            Self::Pointer => FieldType::Pointer {
                size: widths.pointer_size,
            },
            Self::String => FieldType::String,
            Self::Enum { width, labels } => FieldType::Enum {
                size: width.resolve(widths),
                labels: labels.clone(),
            },
            Self::Array { length, element } => FieldType::Array {
                length: *length,
                element: Box::new(element.resolve(widths)),
            },
            Self::Sequence { length, element } => FieldType::Sequence {
                length_size: length.resolve(widths),
                element: Box::new(element.resolve(widths)),
            },
            Self::Struct(members) => FieldType::Struct {
                members: resolve_members(members, widths),
            },
            Self::Union {
                discriminant,
                members,
            } => FieldType::Union {
                discriminant: discriminant.clone(),
                members: resolve_members(members, widths),
            },
        }
    }
}

fn resolve_members(members: &[(CompactString, TypeDecl)], widths: &ArchWidths) -> Vec<Member> {
    members
        .iter()
        .map(|(name, decl)| Member {
            name: name.clone(),
            ty: decl.resolve(widths),
        })
        .collect()
}

/// Map an integer type keyword to signedness and width.
fn integer_keyword(word: &str) -> Option<(bool, IntWidth)> {
    Some(match word {
        "s8" => (true, IntWidth::Fixed(1)),
        "s16" => (true, IntWidth::Fixed(2)),
        "s32" => (true, IntWidth::Fixed(4)),
        "s64" => (true, IntWidth::Fixed(8)),
        "u8" => (false, IntWidth::Fixed(1)),
        "u16" => (false, IntWidth::Fixed(2)),
        "u32" => (false, IntWidth::Fixed(4)),
        "u64" => (false, IntWidth::Fixed(8)),
        "int" => (true, IntWidth::Int),
        "uint" => (false, IntWidth::Int),
        "long" => (true, IntWidth::Long),
        "ulong" => (false, IntWidth::Long),
        "size_t" => (false, IntWidth::SizeT),
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Number(usize),
    Punct(char),
    End,
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn next(&mut self) -> Result<Token<'a>, MarkerError> {
        let rest = &self.text[self.pos..];
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();
        let Some(first) = trimmed.chars().next() else {
            return Ok(Token::End);
        };
        if first.is_ascii_alphabetic() || first == '_' {
            let len = trimmed
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(trimmed.len());
            self.pos += len;
            return Ok(Token::Ident(&trimmed[..len]));
        }
        if first.is_ascii_digit() {
            let len = trimmed
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(trimmed.len());
            self.pos += len;
            let value = trimmed[..len]
                .parse()
                .map_err(|_| MarkerError::TypeDecl(format!("Number too large: {}", &trimmed[..len])))?;
            return Ok(Token::Number(value));
        }
        if "<>{},;:".contains(first) {
            self.pos += 1;
            return Ok(Token::Punct(first));
        }
        Err(MarkerError::TypeDecl(format!(
            "Unexpected character {first:?} at offset {}",
            self.pos
        )))
    }
}

struct DeclParser<'a, 'k> {
    lexer: Lexer<'a>,
    known: &'k HashMap<CompactString, TypeDecl>,
}

impl<'a> DeclParser<'a, '_> {
    fn unexpected(&self, token: Token<'_>) -> MarkerError {
        MarkerError::TypeDecl(format!(
            "Unexpected {token:?} at offset {} in {:?}",
            self.lexer.pos, self.lexer.text
        ))
    }

    fn expect(&mut self, punct: char) -> Result<(), MarkerError> {
        match self.lexer.next()? {
            Token::Punct(c) if c == punct => Ok(()),
            token => Err(self.unexpected(token)),
        }
    }

    fn ident(&mut self) -> Result<&'a str, MarkerError> {
        match self.lexer.next()? {
            Token::Ident(word) => Ok(word),
            token => Err(self.unexpected(token)),
        }
    }

    fn integer(&mut self) -> Result<IntWidth, MarkerError> {
        let word = self.ident()?;
        integer_keyword(word)
            .map(|(_, width)| width)
            .ok_or_else(|| MarkerError::TypeDecl(format!("Expected an integer type, got {word}")))
    }

    fn decl(&mut self) -> Result<TypeDecl, MarkerError> {
        let word = self.ident()?;
        if let Some((signed, width)) = integer_keyword(word) {
            return Ok(if signed {
                TypeDecl::Signed(width)
            } else {
                TypeDecl::Unsigned(width)
            });
        }
        match word {
            "ptr" => Ok(TypeDecl::Pointer),
            "string" => Ok(TypeDecl::String),
            "enum" => {
                self.expect('<')?;
                let width = self.integer()?;
                self.expect('>')?;
                self.expect('{')?;
                let mut labels = Vec::new();
                loop {
                    labels.push(CompactString::from(self.ident()?));
                    match self.lexer.next()? {
                        Token::Punct(',') => {}
                        Token::Punct('}') => break,
                        token => return Err(self.unexpected(token)),
                    }
                }
                Ok(TypeDecl::Enum { width, labels })
            }
            "array" => {
                self.expect('<')?;
                let length = match self.lexer.next()? {
                    Token::Number(n) => n,
                    token => return Err(self.unexpected(token)),
                };
                self.expect(',')?;
                let element = Box::new(self.element()?);
                self.expect('>')?;
                Ok(TypeDecl::Array { length, element })
            }
            "sequence" => {
                self.expect('<')?;
                let length = self.integer()?;
                self.expect(',')?;
                let element = Box::new(self.element()?);
                self.expect('>')?;
                Ok(TypeDecl::Sequence { length, element })
            }
            "struct" => Ok(TypeDecl::Struct(self.members()?)),
            "union" => {
                self.expect('<')?;
                let discriminant = CompactString::from(self.ident()?);
                self.expect('>')?;
                let members = self.members()?;
                Ok(TypeDecl::Union {
                    discriminant,
                    members,
                })
            }
            name => self
                .known
                .get(name)
                .cloned()
                .ok_or_else(|| MarkerError::UndefinedType(name.into())),
        }
    }

    /// Element of an array or sequence. Empty elements would let a corrupt
    /// count run without consuming any data.
    fn element(&mut self) -> Result<TypeDecl, MarkerError> {
        let element = self.decl()?;
        if element.is_empty() {
            return Err(MarkerError::TypeDecl(
                "Array and sequence elements cannot be empty".into(),
            ));
        }
        Ok(element)
    }

    fn members(&mut self) -> Result<Vec<(CompactString, TypeDecl)>, MarkerError> {
        self.expect('{')?;
        let mut members = Vec::new();
        loop {
            let name = match self.lexer.next()? {
                Token::Punct('}') => break,
                Token::Ident(name) => CompactString::from(name),
                token => return Err(self.unexpected(token)),
            };
            self.expect(':')?;
            let decl = self.decl()?;
            self.expect(';')?;
            members.push((name, decl));
        }
        Ok(members)
    }
}
