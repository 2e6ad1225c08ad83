//! TCP option parsing and emission.

use std::io;

pub(crate) const END_OF_OPTIONS: u8 = 0;
pub(crate) const NO_OP: u8 = 1;
pub(crate) const MAXIMUM_SEGMENT_SIZE: u8 = 2;
pub(crate) const WINDOW_SCALE: u8 = 3;
pub(crate) const SELECTIVE_ACK_PERMITTED: u8 = 4;
pub(crate) const SELECTIVE_ACK: u8 = 5;
pub(crate) const TIMESTAMPS: u8 = 8;

/// Option bytes emitted with a SYN-ACK: MSS (4), window scale (3),
/// SACK permitted (2), padded with end-of-options to a 4-byte boundary.
pub(crate) const SYN_REPLY_OPTIONS_LEN: usize = 12;

/// A SACK option fits at most four blocks next to nothing else: the data
/// offset caps the option area at 40 bytes and each block takes 8.
pub(crate) const MAX_SACK_BLOCKS: usize = 4;

/// One parsed TCP option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TcpOption {
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    /// (left edge, right edge) pairs.
    Sack(Vec<(u32, u32)>),
    /// Parsed for wire compatibility, never acted on.
    Timestamps { value: u32, echo: u32 },
    Unknown { kind: u8, len: u8 },
}

fn malformed(kind: u8) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed TCP option, kind {kind}"),
    )
}

fn be32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Parse the option area of a TCP header.
///
/// Stops at end-of-options. A length byte that is shorter than two or runs
/// past the buffer makes the whole area invalid.
pub(crate) fn parse(mut opts: &[u8]) -> io::Result<Vec<TcpOption>> {
    let mut parsed = Vec::new();
    while let Some(&kind) = opts.first() {
        if kind == END_OF_OPTIONS {
            break;
        }
        if kind == NO_OP {
            opts = &opts[1..];
            continue;
        }
        let len = *opts.get(1).ok_or_else(|| malformed(kind))? as usize;
        if len < 2 || len > opts.len() {
            return Err(malformed(kind));
        }
        let data = &opts[2..len];
        let opt = match kind {
            MAXIMUM_SEGMENT_SIZE => {
                if data.len() != 2 {
                    return Err(malformed(kind));
                }
                TcpOption::MaxSegmentSize(u16::from_be_bytes([data[0], data[1]]))
            }
            WINDOW_SCALE => {
                if data.len() != 1 {
                    return Err(malformed(kind));
                }
                TcpOption::WindowScale(data[0])
            }
            SELECTIVE_ACK_PERMITTED => {
                if !data.is_empty() {
                    return Err(malformed(kind));
                }
                TcpOption::SackPermitted
            }
            SELECTIVE_ACK => {
                if data.is_empty() || data.len() % 8 != 0 {
                    return Err(malformed(kind));
                }
                let blocks = data
                    .chunks_exact(8)
                    .map(|c| (be32(&c[..4]), be32(&c[4..])))
                    .collect();
                TcpOption::Sack(blocks)
            }
            TIMESTAMPS => {
                if data.len() != 8 {
                    return Err(malformed(kind));
                }
                TcpOption::Timestamps {
                    value: be32(&data[..4]),
                    echo: be32(&data[4..]),
                }
            }
            _ => TcpOption::Unknown {
                kind,
                len: len as u8,
            },
        };
        parsed.push(opt);
        opts = &opts[len..];
    }
    Ok(parsed)
}

/// Fill the SYN-ACK option area: MSS, window scale, SACK permitted.
///
/// `opts` must be [`SYN_REPLY_OPTIONS_LEN`] bytes; the trailing padding is
/// left as end-of-options.
pub(crate) fn write_syn_reply(opts: &mut [u8], mss: u16, window_scale: u8) {
    opts[0] = MAXIMUM_SEGMENT_SIZE;
    opts[1] = 4;
    opts[2..4].copy_from_slice(&mss.to_be_bytes());

    opts[4] = WINDOW_SCALE;
    opts[5] = 3;
    opts[6] = window_scale;

    opts[7] = SELECTIVE_ACK_PERMITTED;
    opts[8] = 2;
}

/// Number of option-area bytes a SACK with `blocks` blocks occupies,
/// including padding to a 4-byte boundary.
pub(crate) fn sack_area_len(blocks: usize) -> usize {
    4 + blocks * 8
}

/// Fill the option area with a SACK carrying `blocks` (left, right) pairs.
pub(crate) fn write_sack(opts: &mut [u8], blocks: &[(u32, u32)]) {
    opts[0] = SELECTIVE_ACK;
    opts[1] = (2 + blocks.len() * 8) as u8;
    let mut at = 2;
    for &(left, right) in blocks {
        opts[at..at + 4].copy_from_slice(&left.to_be_bytes());
        opts[at + 4..at + 8].copy_from_slice(&right.to_be_bytes());
        at += 8;
    }
}
