//! Architecture description of the machine that produced a trace.

use serde_derive::Serialize;

/// Byte order of the data in a tracefile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    /// True when values must be byte swapped to be read on this host.
    pub fn is_reversed(self) -> bool {
        self != Self::native()
    }
}

/// Data model of the traced machine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArchSize {
    Lp32,
    Ilp32,
    Lp64,
    Ilp64,
    #[default]
    Unknown,
}

impl ArchSize {
    /// Classify from the pointer size stored in subbuffer headers.
    pub fn from_pointer_size(size: u8) -> Self {
        match size {
            4 => Self::Ilp32,
            8 => Self::Lp64,
            _ => Self::Unknown,
        }
    }
}

/// C type widths (in bytes) on the producer, captured when a marker id is
/// registered. Field layouts are always computed with these, never with the
/// widths of the analysis host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchWidths {
    pub int_size: u8,
    pub long_size: u8,
    pub pointer_size: u8,
    pub size_t_size: u8,
    /// 0 means packed data, otherwise the architecture word size.
    pub alignment: u8,
}

impl ArchWidths {
    pub const LP64: Self = Self {
        int_size: 4,
        long_size: 8,
        pointer_size: 8,
        size_t_size: 8,
        alignment: 8,
    };

    pub const ILP32: Self = Self {
        int_size: 4,
        long_size: 4,
        pointer_size: 4,
        size_t_size: 4,
        alignment: 4,
    };

    /// Widths implied by a subbuffer header: pointer-sized longs.
    pub fn from_header(arch_size: u8, alignment: u8) -> Self {
        Self {
            int_size: 4,
            long_size: arch_size,
            pointer_size: arch_size,
            size_t_size: arch_size,
            alignment,
        }
    }
}

/// Number of padding bytes needed to align `offset` for a type of
/// `size_of_type` bytes.
///
/// The effective alignment is the smaller of the type size and the
/// architecture `alignment`. An `alignment` of 0 disables alignment.
pub const fn align_padding(offset: usize, size_of_type: usize, alignment: usize) -> usize {
    if alignment == 0 || size_of_type <= 1 {
        return 0;
    }
    let align = if alignment < size_of_type {
        alignment
    } else {
        size_of_type
    };
    (align - offset % align) % align
}
