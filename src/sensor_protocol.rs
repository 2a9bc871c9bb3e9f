//! Wire format spoken by a single quadrant of the pressure pad.
//!
//! The host sends a fixed request, and the tile answers with:
//!
//! ```text
//! [ "SA1A355" ][ 4 ASCII hex digits: payload length ][ payload ][ "FFE" ]
//! ```
//!
//! The payload is always 4608 bytes: 48x48 little-endian `u16` cells in
//! row-major order. Any other declared length is treated as corrupted or
//! unsupported firmware and rejected outright.

use crate::grid::{Grid, TILE_SIZE};

use nom::{
    bytes::complete::{tag, take},
    combinator::{map_res, verify},
    multi::count,
    number::complete::le_u16,
    sequence::{preceded, terminated},
    IResult,
};
use thiserror::Error;

/// The request that asks a tile for one full reading.
pub const REQUEST: [u8; 14] = [
    0x53, 0x41, 0x33, 0x41, 0x31, 0x35, 0x35, 0x00, 0x00, 0x00, 0x00, 0x46, 0x46, 0x45,
];

/// Start-of-response marker.
pub const SIGNATURE: [u8; 7] = [0x53, 0x41, 0x31, 0x41, 0x33, 0x35, 0x35];

/// End-of-response marker.
pub const TAIL: [u8; 3] = [0x46, 0x46, 0x45];

/// The signature must show up within this many bytes of the reply.
pub const SIGNATURE_WINDOW: usize = 20;

/// Width of the ASCII hex length field.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Signature plus length field.
pub const HEADER_LEN: usize = SIGNATURE.len() + LENGTH_FIELD_LEN;

/// The only payload length the firmware is allowed to declare.
pub const PAYLOAD_LEN: usize = TILE_SIZE * TILE_SIZE * 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("length field {0:?} is not four hex digits")]
    BadLengthField(Vec<u8>),

    #[error("declared payload length {0} is not {PAYLOAD_LEN}")]
    UnsupportedLength(usize),

    #[error("bad frame tail {0:02X?}")]
    BadTail(Vec<u8>),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Looks for [`SIGNATURE`] fully contained in the first
/// [`SIGNATURE_WINDOW`] bytes of `buf`, returning its offset.
pub fn find_signature(buf: &[u8]) -> Option<usize> {
    let window = &buf[..buf.len().min(SIGNATURE_WINDOW)];
    window
        .windows(SIGNATURE.len())
        .position(|w| w == SIGNATURE)
}

/// True once `buf` holds the whole search window and no signature is in it,
/// so waiting for more bytes cannot help.
pub fn signature_window_exhausted(buf: &[u8]) -> bool {
    buf.len() >= SIGNATURE_WINDOW && find_signature(buf).is_none()
}

/// Total bytes a reply occupies when its signature starts at `header_offset`.
pub fn frame_end(header_offset: usize) -> usize {
    header_offset + HEADER_LEN + PAYLOAD_LEN + TAIL.len()
}

fn hex_digits(s: &[u8]) -> IResult<&[u8], usize> {
    map_res(take(LENGTH_FIELD_LEN), |digits: &[u8]| {
        if !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(());
        }
        let text = std::str::from_utf8(digits).map_err(|_| ())?;
        usize::from_str_radix(text, 16).map_err(|_| ())
    })(s)
}

fn payload(s: &[u8]) -> IResult<&[u8], Vec<u16>> {
    count(le_u16, TILE_SIZE * TILE_SIZE)(s)
}

fn frame(s: &[u8]) -> IResult<&[u8], Vec<u16>> {
    preceded(
        tag(&SIGNATURE[..]),
        preceded(
            verify(hex_digits, |len: &usize| *len == PAYLOAD_LEN),
            terminated(payload, tag(&TAIL[..])),
        ),
    )(s)
}

/// Parses the 4-digit hex length field and insists on [`PAYLOAD_LEN`].
pub fn parse_length_field(field: &[u8]) -> Result<usize, ProtocolError> {
    match hex_digits(field) {
        Ok((_, PAYLOAD_LEN)) => Ok(PAYLOAD_LEN),
        Ok((_, other)) => Err(ProtocolError::UnsupportedLength(other)),
        Err(_) => Err(ProtocolError::BadLengthField(field.to_vec())),
    }
}

/// Decodes a complete reply whose signature starts at `header_offset`.
///
/// Returns the tile grid and the number of bytes of `buf` it consumed,
/// which is always [`frame_end`]`(header_offset)`.
pub fn decode_frame(buf: &[u8], header_offset: usize) -> Result<(Grid, usize), ProtocolError> {
    let end = frame_end(header_offset);
    if buf.len() < end {
        return Err(ProtocolError::Malformed(format!(
            "need {end} bytes, have {}",
            buf.len()
        )));
    }

    let length_field = &buf[header_offset + SIGNATURE.len()..header_offset + HEADER_LEN];
    parse_length_field(length_field)?;

    let tail = &buf[end - TAIL.len()..end];
    if tail != TAIL {
        return Err(ProtocolError::BadTail(tail.to_vec()));
    }

    let (_rest, cells) = frame(&buf[header_offset..end])
        .map_err(|e| ProtocolError::Malformed(format!("{e:?}")))?;
    let grid = Grid::from_cells(TILE_SIZE, cells)
        .ok_or_else(|| ProtocolError::Malformed("payload does not fill a tile".to_owned()))?;

    Ok((grid, end))
}

/// Builds a well-formed reply carrying `grid`. Used by the simulated pad.
pub fn encode_frame(grid: &Grid) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame_end(0));
    out.extend_from_slice(&SIGNATURE);
    out.extend_from_slice(format!("{PAYLOAD_LEN:04X}").as_bytes());
    for &cell in grid.cells() {
        out.extend_from_slice(&cell.to_le_bytes());
    }
    out.extend_from_slice(&TAIL);
    out
}
