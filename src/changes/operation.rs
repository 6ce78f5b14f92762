// Operation tags.

/// Terminates the record list of one structure on the wire.
pub const END_OF_STRUCTURE: u8 = 0xc1;

/// What happened at an index since the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Replace,
    Delete,
    /// Structure-wide: every member was removed.
    Clear,
}

impl Operation {
    /// Wire byte for this operation.
    #[inline]
    pub const fn tag(self) -> u8 {
        match self {
            Operation::Add => 0x80,
            Operation::Replace => 0x00,
            Operation::Delete => 0x40,
            Operation::Clear => 0x0a,
        }
    }

    #[inline]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x80 => Some(Operation::Add),
            0x00 => Some(Operation::Replace),
            0x40 => Some(Operation::Delete),
            0x0a => Some(Operation::Clear),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::Add => "ADD",
            Operation::Replace => "REPLACE",
            Operation::Delete => "DELETE",
            Operation::Clear => "CLEAR",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
