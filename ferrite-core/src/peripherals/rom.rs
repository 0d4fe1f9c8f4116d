use crate::bus::Peripheral;
use thiserror::Error;

/// Read-only memory holding the boot image.
///
/// Reads beyond the image (but within the mapped window) return zero; all
/// writes are dropped.
#[derive(Debug, Clone)]
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    /// Create a ROM holding `image` byte for byte.
    pub fn new(image: Vec<u8>) -> Self {
        Self { data: image }
    }

    /// Parse a hex-text image: whitespace-separated 2-digit hex bytes, one
    /// byte per token.
    pub fn from_hex_text(text: &str) -> Result<Self, HexImageError> {
        let mut data = Vec::new();
        for token in text.split_whitespace() {
            if token.len() != 2 {
                return Err(HexImageError::BadToken(token.to_owned()));
            }
            let byte = u8::from_str_radix(token, 16)
                .map_err(|_| HexImageError::BadToken(token.to_owned()))?;
            data.push(byte);
        }
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Peripheral for Rom {
    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn read_byte(&mut self, offset: u32) -> u8 {
        self.data.get(offset as usize).copied().unwrap_or(0)
    }

    fn write_byte(&mut self, _offset: u32, _value: u8) {
        // Writes to ROM are dropped.
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum HexImageError {
    #[error("invalid hex byte token {0:?}")]
    BadToken(String),
}
