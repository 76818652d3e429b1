//! Intel HEX decoding into contiguous flash segments.

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("line {line}: record does not start with ':'")]
    MissingStartCode { line: usize },

    #[error("line {line}: {source}")]
    InvalidDigits {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },

    #[error("line {line}: record length does not match its byte count")]
    Length { line: usize },

    #[error("line {line}: checksum mismatch")]
    Checksum { line: usize },

    #[error("line {line}: unsupported record type {kind:02X}")]
    RecordType { line: usize, kind: u8 },

    #[error("image has no end-of-file record")]
    MissingEof,

    #[error("image contains no data")]
    Empty,
}

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT: u8 = 0x02;
const START_SEGMENT: u8 = 0x03;
const EXTENDED_LINEAR: u8 = 0x04;
const START_LINEAR: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.address.wrapping_add(self.data.len() as u32)
    }
}

/// Firmware as a list of `(address, bytes)` runs in file order. Adjacent
/// data records are merged into one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn from_hex(text: &str) -> Result<Self, HexError> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut base: u32 = 0;
        let mut saw_eof = false;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let record = raw.trim();
            if record.is_empty() {
                continue;
            }
            let digits = record
                .strip_prefix(':')
                .ok_or(HexError::MissingStartCode { line })?;
            let bytes =
                hex::decode(digits).map_err(|source| HexError::InvalidDigits { line, source })?;
            if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
                return Err(HexError::Length { line });
            }
            if bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
                return Err(HexError::Checksum { line });
            }

            let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
            let kind = bytes[3];
            let payload = &bytes[4..bytes.len() - 1];

            match kind {
                DATA => {
                    let address = base.wrapping_add(offset);
                    match segments.last_mut() {
                        Some(last) if last.end() == address => last.data.extend_from_slice(payload),
                        _ => segments.push(Segment { address, data: payload.to_vec() }),
                    }
                }
                END_OF_FILE => {
                    saw_eof = true;
                    break;
                }
                EXTENDED_SEGMENT | EXTENDED_LINEAR => {
                    if payload.len() != 2 {
                        return Err(HexError::Length { line });
                    }
                    let value = u16::from_be_bytes([payload[0], payload[1]]) as u32;
                    base = if kind == EXTENDED_SEGMENT { value << 4 } else { value << 16 };
                }
                // Entry points mean nothing to the flash.
                START_SEGMENT | START_LINEAR => {}
                other => return Err(HexError::RecordType { line, kind: other }),
            }
        }

        if !saw_eof {
            return Err(HexError::MissingEof);
        }
        segments.retain(|s| !s.data.is_empty());
        if segments.is_empty() {
            return Err(HexError::Empty);
        }
        Ok(Self { segments })
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }
}
