//! LZ codec for compressed blocks.
//!
//! A block is laid out as
//!
//! ```text
//! [u16 body length][body][control]([u16 end offset][addendum body][control])*
//! ```
//!
//! The body is a run of packets: a header byte followed by one command per
//! header bit, LSB first. A clear bit copies one literal byte; a set bit is a
//! little-endian word holding a back-reference distance in its low 12 bits
//! (11 in the narrow mode) and the copy length minus 3 in the remaining bits.
//!
//! Bit 0x40 of the first control byte selects the narrow mode for the whole
//! block. The low 6 bits of a control byte are zero at the end of the block;
//! otherwise they give the command count of the next packet and the following
//! word is the offset, relative to the block start, of the next control byte.

use crate::{read_le, write_le, Result, RomError};

const MODE_NARROW: u8 = 0x40;
const MODE_MASK: u8 = 0xC0;
const COUNT_MASK: u8 = 0x3F;
const MIN_MATCH: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    offset_mask: u16,
    length_shift: u32,
    mode_bits: u8,
}

impl Window {
    const WIDE: Window = Window {
        offset_mask: 0x0FFF,
        length_shift: 12,
        mode_bits: 0x00,
    };
    const NARROW: Window = Window {
        offset_mask: 0x07FF,
        length_shift: 11,
        mode_bits: MODE_NARROW,
    };

    fn from_control(control: u8) -> Window {
        if control & MODE_MASK != 0 {
            Window::NARROW
        } else {
            Window::WIDE
        }
    }

    fn max_distance(self) -> usize {
        self.offset_mask as usize
    }

    fn max_length(self) -> usize {
        (0xFFFF_usize >> self.length_shift) + MIN_MATCH
    }

    fn unpack(self, word: u16) -> (usize, usize) {
        let distance = (word & self.offset_mask) as usize;
        let length = (word >> self.length_shift) as usize + MIN_MATCH;
        (distance, length)
    }

    fn pack(self, distance: usize, length: usize) -> u16 {
        (distance as u16 & self.offset_mask) | (((length - MIN_MATCH) as u16) << self.length_shift)
    }
}

fn malformed(offset: usize, reason: impl Into<String>) -> RomError {
    RomError::Compression {
        offset,
        reason: reason.into(),
    }
}

/// Decodes the block beginning at `start`.
pub fn decompress(buf: &[u8], start: usize) -> Result<Vec<u8>> {
    let body_len = read_le(buf, start, 2).ok_or_else(|| malformed(start, "truncated header"))?;
    let mut pos = start + 2;
    let mut end = pos + body_len;

    let first_control = *buf
        .get(end)
        .ok_or_else(|| malformed(start, "body runs past end of image"))?;
    let window = Window::from_control(first_control);

    let mut out: Vec<u8> = Vec::with_capacity(body_len * 2);
    let mut commands = 8usize;

    loop {
        while pos < end {
            let header = buf[pos];
            pos += 1;

            for bit in 0..commands {
                if header & (1 << bit) == 0 {
                    if pos >= end {
                        return Err(malformed(start, format!("literal at {:#X} overruns body", pos)));
                    }
                    out.push(buf[pos]);
                    pos += 1;
                } else {
                    if pos + 2 > end {
                        return Err(malformed(start, format!("reference at {:#X} overruns body", pos)));
                    }
                    let word = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
                    pos += 2;

                    let (distance, length) = window.unpack(word);
                    if distance == 0 || distance > out.len() {
                        return Err(malformed(
                            start,
                            format!("reference distance {} with {} bytes decoded", distance, out.len()),
                        ));
                    }
                    // Byte by byte: the source may overlap the bytes being produced.
                    for _ in 0..length {
                        let b = out[out.len() - distance];
                        out.push(b);
                    }
                }
            }
            commands = 8;
        }

        let control = *buf
            .get(end)
            .ok_or_else(|| malformed(start, "missing control byte"))?;
        let count = (control & COUNT_MASK) as usize;
        if count == 0 {
            return Ok(out);
        }
        if count > 8 {
            return Err(malformed(start, format!("addendum command count {}", count)));
        }

        let next_end = read_le(buf, end + 1, 2)
            .ok_or_else(|| malformed(start, "truncated addendum"))?
            + start;
        pos = end + 3;
        if next_end <= pos {
            return Err(malformed(start, "addendum end does not advance"));
        }
        if next_end > buf.len() {
            return Err(malformed(start, "addendum runs past end of image"));
        }
        end = next_end;
        commands = count;
    }
}

/// Number of image bytes occupied by the block beginning at `start`.
pub fn compressed_length(buf: &[u8], start: usize) -> Result<usize> {
    let body_len = read_le(buf, start, 2).ok_or_else(|| malformed(start, "truncated header"))?;
    let mut end = start + 2 + body_len;

    loop {
        let control = *buf
            .get(end)
            .ok_or_else(|| malformed(start, "missing control byte"))?;
        if control & COUNT_MASK == 0 {
            return Ok(end + 1 - start);
        }
        let next_end = read_le(buf, end + 1, 2)
            .ok_or_else(|| malformed(start, "truncated addendum"))?
            + start;
        if next_end <= end + 3 {
            return Err(malformed(start, "addendum end does not advance"));
        }
        end = next_end;
    }
}

/// Encodes `data`, trying both window layouts and keeping the shorter one.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let wide = encode(data, Window::WIDE)?;
    let narrow = encode(data, Window::NARROW)?;
    Ok(if narrow.len() < wide.len() { narrow } else { wide })
}

/// Longest match for `data[pos..]` inside the window, earliest start on ties.
fn find_match(data: &[u8], pos: usize, window: Window) -> Option<(usize, usize)> {
    let limit = window.max_length().min(data.len() - pos);
    if limit < MIN_MATCH {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for source in pos.saturating_sub(window.max_distance())..pos {
        let mut n = 0;
        while n < limit && data[source + n] == data[pos + n] {
            n += 1;
        }
        if n >= MIN_MATCH && best.map_or(true, |(_, len)| n > len) {
            best = Some((pos - source, n));
            if n == limit {
                break;
            }
        }
    }
    best
}

fn encode(data: &[u8], window: Window) -> Result<Vec<u8>> {
    let mut out = vec![0u8, 0u8];
    let mut packet: Vec<u8> = Vec::with_capacity(16);
    let mut header = 0u8;
    let mut count = 0usize;
    let mut pos = 0usize;

    while pos < data.len() {
        match find_match(data, pos, window) {
            Some((distance, length)) => {
                header |= 1 << count;
                packet.extend_from_slice(&window.pack(distance, length).to_le_bytes());
                pos += length;
            }
            None => {
                packet.push(data[pos]);
                pos += 1;
            }
        }

        count += 1;
        if count == 8 {
            out.push(header);
            out.append(&mut packet);
            header = 0;
            count = 0;
        }
    }

    let body_len = out.len() - 2;
    if body_len > 0xFFFF {
        return Err(RomError::InvalidArgument(format!(
            "{} bytes compress to a body of {} bytes",
            data.len(),
            body_len
        )));
    }
    write_le(&mut out, 0, 2, body_len);

    if count == 0 {
        out.push(window.mode_bits);
        return Ok(out);
    }

    // The unfinished packet becomes an addendum after the control byte.
    let next_end = out.len() + 3 + 1 + packet.len();
    if next_end > 0xFFFF {
        return Err(RomError::InvalidArgument(format!(
            "addendum offset {:#X} does not fit in 16 bits",
            next_end
        )));
    }
    out.push(window.mode_bits | count as u8);
    out.extend_from_slice(&(next_end as u16).to_le_bytes());
    out.push(header);
    out.append(&mut packet);
    out.push(window.mode_bits);
    Ok(out)
}
