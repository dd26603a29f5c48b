// Interface identifiers: 16-byte GUIDs compared by exact value.
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};

#[repr(C)]
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InterfaceId([u8; 16]);

/// Identity of the base object; every component answers it with its first interface.
pub const IID_OBJECT: InterfaceId = InterfaceId::from_u128(0xd285ff10_ba9b_4d4a_9c5e_2f3c8a1b6e01);

impl InterfaceId {
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Accepts the hyphenated form with or without surrounding braces.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        let inner = trimmed
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(trimmed);
        let uuid = Uuid::parse_str(inner).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid interface id: {input}"))
                .with_source(err)
        })?;
        Ok(Self(uuid.into_bytes()))
    }
}

impl FromStr for InterfaceId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterfaceId({{{self}}})")
    }
}
