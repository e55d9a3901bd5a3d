//! Register log lines: `timestamp_ms XX XX XX XX XX XX`.

use std::{fmt, str::FromStr};

pub const REGISTERS_PER_ENTRY: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLogEntry {
    /// Milliseconds since the session started.
    pub timestamp_ms: u64,
    pub values: [u8; REGISTERS_PER_ENTRY],
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseEntryError {
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("bad timestamp '{0}'")]
    BadTimestamp(String),
    #[error("expected 6 register values, found {0}")]
    WrongCount(usize),
    #[error("bad register value '{0}'")]
    BadValue(String),
}

impl fmt::Display for RegisterLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:8}", self.timestamp_ms)?;
        for value in self.values {
            write!(f, " {value:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for RegisterLogEntry {
    type Err = ParseEntryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let timestamp = tokens.next().ok_or(ParseEntryError::MissingTimestamp)?;
        let timestamp_ms = timestamp
            .parse()
            .map_err(|_| ParseEntryError::BadTimestamp(timestamp.to_string()))?;

        let mut values = [0u8; REGISTERS_PER_ENTRY];
        let mut count = 0;
        for token in tokens {
            if count < REGISTERS_PER_ENTRY {
                if token.len() != 2 {
                    return Err(ParseEntryError::BadValue(token.to_string()));
                }
                values[count] = u8::from_str_radix(token, 16)
                    .map_err(|_| ParseEntryError::BadValue(token.to_string()))?;
            }
            count += 1;
        }
        if count != REGISTERS_PER_ENTRY {
            return Err(ParseEntryError::WrongCount(count));
        }

        Ok(RegisterLogEntry {
            timestamp_ms,
            values,
        })
    }
}
