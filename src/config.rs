//! Frontend register configuration file.
//!
//! One register per line, `ADDRESS VALUE` in hex with an optional `0x`
//! prefix. Blank lines and anything after `#` or `;` are ignored.

use std::{fs, io, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: expected 'ADDRESS VALUE', got '{text}'")]
    Malformed { line: usize, text: String },

    #[error("line {line}: '{token}' is not a hex byte")]
    BadByte { line: usize, token: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub writes: Vec<(u8, u8)>,
}

fn hex_byte(token: &str, line: usize) -> Result<u8, ConfigError> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u8::from_str_radix(digits, 16).map_err(|_| ConfigError::BadByte {
        line,
        token: token.to_string(),
    })
}

impl ChannelConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        fs::read_to_string(path)?.parse()
    }
}

impl std::str::FromStr for ChannelConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut writes = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split(['#', ';']).next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = content.split_whitespace().collect();
            let [address, value] = tokens.as_slice() else {
                return Err(ConfigError::Malformed {
                    line,
                    text: raw.to_string(),
                });
            };
            writes.push((hex_byte(address, line)?, hex_byte(value, line)?));
        }
        Ok(ChannelConfig { writes })
    }
}
