//! Page codec: transforms one guest page into one framed chunk on the
//! stream, and the symmetric load-side decoder.
//!
//! The on-wire form stays the tagged `offset | flags` word the source uses;
//! the in-memory form is the `PageRecord` enum below, matching each other
//! through a single `match` rather than scattered flag tests (design note
//! "tagged dispatch").

use crate::stream::MigrationStream;
use crate::PAGE_SIZE;
use std::io::{Read, Write};

pub const FLAG_ZERO_RUN: u64 = 0x02;
pub const FLAG_MEM_SIZE: u64 = 0x04;
pub const FLAG_RAW_PAGE: u64 = 0x08;
pub const FLAG_EOS: u64 = 0x10;
pub const FLAG_CONT_BLOCK: u64 = 0x20;
pub const FLAG_XBZRLE: u64 = 0x40;

const XBZRLE_SUB_FLAG: u8 = 0x01;

const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// In-memory counterpart of the wire's tagged page record.
pub enum PageRecord {
    ZeroRun { value: u8 },
    Raw { bytes: Vec<u8> },
    Xbzrle { encoded: Vec<u8> },
}

impl PageRecord {
    fn type_flag(&self) -> u64 {
        match self {
            PageRecord::ZeroRun { .. } => FLAG_ZERO_RUN,
            PageRecord::Raw { .. } => FLAG_RAW_PAGE,
            PageRecord::Xbzrle { .. } => FLAG_XBZRLE,
        }
    }
}

/// Writes page records to a stream, tracking the last-seen block so the
/// id preamble can be elided via `FLAG_CONT_BLOCK`.
#[derive(Default)]
pub struct PageEncoder {
    last_block: Option<String>,
}

impl PageEncoder {
    pub fn new() -> Self {
        Self { last_block: None }
    }

    pub fn encode<W: Write>(
        &mut self,
        stream: &mut MigrationStream<W>,
        block_id: &str,
        offset: u64,
        record: &PageRecord,
    ) {
        let cont = self.last_block.as_deref() == Some(block_id);
        let header = (offset & PAGE_MASK)
            | record.type_flag()
            | if cont { FLAG_CONT_BLOCK } else { 0 };
        stream.put_be64(header);
        if !cont {
            stream.put_u8(block_id.len() as u8);
            stream.put_bytes(block_id.as_bytes());
        }
        match record {
            PageRecord::ZeroRun { value } => stream.put_u8(*value),
            PageRecord::Raw { bytes } => stream.put_bytes(bytes),
            PageRecord::Xbzrle { encoded } => {
                stream.put_u8(XBZRLE_SUB_FLAG);
                stream.put_be16(encoded.len() as u16);
                stream.put_bytes(encoded);
            }
        }
        self.last_block = Some(block_id.to_string());
    }

    pub fn encode_eos<W: Write>(&mut self, stream: &mut MigrationStream<W>) {
        stream.put_be64(FLAG_EOS);
    }
}

/// One decoded page header plus whatever payload the flag bits call for.
pub enum DecodedRecord {
    MemSize { total_bytes: u64 },
    Page {
        block_id: String,
        offset: u64,
        record: PageRecord,
    },
    Eos,
}

/// Reads page records from a stream, tracking the last-seen block the same
/// way the encoder does, so `FLAG_CONT_BLOCK` resolves to the right id.
#[derive(Default)]
pub struct PageDecoder {
    last_block: Option<String>,
}

impl PageDecoder {
    pub fn new() -> Self {
        Self { last_block: None }
    }

    pub fn decode<R: Read>(
        &mut self,
        stream: &mut MigrationStream<R>,
    ) -> Result<DecodedRecord, crate::error::MigrationError> {
        let header = stream.get_be64();
        if let Some(err) = stream.error() {
            return Err(crate::error::MigrationError::StreamIo(err.to_string()));
        }
        if header == FLAG_EOS {
            return Ok(DecodedRecord::Eos);
        }
        if header & FLAG_MEM_SIZE != 0 {
            return Ok(DecodedRecord::MemSize {
                total_bytes: header & !FLAG_MEM_SIZE,
            });
        }

        let offset = header & PAGE_MASK;
        let cont = header & FLAG_CONT_BLOCK != 0;
        let type_flag = header & !(PAGE_MASK | FLAG_CONT_BLOCK);

        let block_id = if cont {
            self.last_block.clone().ok_or_else(|| {
                crate::error::MigrationError::InvalidStream(
                    "continuation flag set with no prior block".to_string(),
                )
            })?
        } else {
            let len = stream.get_u8() as usize;
            let bytes = stream.get_bytes(len);
            String::from_utf8(bytes).map_err(|_| {
                crate::error::MigrationError::InvalidStream("block id is not valid UTF-8".to_string())
            })?
        };

        let record = match type_flag {
            FLAG_ZERO_RUN => PageRecord::ZeroRun {
                value: stream.get_u8(),
            },
            FLAG_RAW_PAGE => PageRecord::Raw {
                bytes: stream.get_bytes(PAGE_SIZE),
            },
            FLAG_XBZRLE => {
                let sub_flag = stream.get_u8();
                if sub_flag != XBZRLE_SUB_FLAG {
                    return Err(crate::error::MigrationError::InvalidStream(format!(
                        "bad xbzrle sub-flag: {sub_flag:#x}"
                    )));
                }
                let len = stream.get_be16() as usize;
                if len > PAGE_SIZE {
                    return Err(crate::error::MigrationError::InvalidStream(format!(
                        "xbzrle encoded length {len} exceeds page size {PAGE_SIZE}"
                    )));
                }
                PageRecord::Xbzrle {
                    encoded: stream.get_bytes(len),
                }
            }
            other => {
                return Err(crate::error::MigrationError::InvalidStream(format!(
                    "unrecognized page type flag: {other:#x}"
                )))
            }
        };

        // A read inside the preamble/payload above may have silently run out
        // of bytes (`get_*` on a drained stream returns zero-filled data
        // rather than erroring); catch that here instead of returning a
        // malformed record as if it were real data.
        if let Some(err) = stream.error() {
            return Err(crate::error::MigrationError::StreamIo(err.to_string()));
        }

        self.last_block = Some(block_id.clone());
        Ok(DecodedRecord::Page {
            block_id,
            offset,
            record,
        })
    }
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn get_varint(buf: &[u8], mut pos: usize) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(pos)?;
        pos += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, pos));
        }
        shift += 7;
    }
}

/// Result of encoding an XBZRLE delta. Named variants stand
/// in for the source's `0`/`-1`/`n` sentinel return value.
pub enum XbzrleEncodeResult {
    /// `old == new`; nothing to send.
    Identical,
    /// The delta would exceed `out_cap` bytes.
    Overflow,
    Encoded(Vec<u8>),
}

/// Computes a zero-run/literal-run delta of `new` against `old`, bounded to
/// `out_cap` bytes. `old` and `new` must be the same length.
pub fn xbzrle_encode(old: &[u8], new: &[u8], out_cap: usize) -> XbzrleEncodeResult {
    debug_assert_eq!(old.len(), new.len());
    let len = old.len();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < len {
        let zero_start = i;
        while i < len && old[i] == new[i] {
            i += 1;
        }
        let zeros = i - zero_start;

        let nz_start = i;
        while i < len && old[i] != new[i] {
            i += 1;
        }
        let nonzeros = i - nz_start;

        if nonzeros == 0 {
            // Trailing all-equal tail: elided, no final zero-only record.
            break;
        }

        put_varint(&mut out, zeros as u64);
        put_varint(&mut out, nonzeros as u64);
        out.extend_from_slice(&new[nz_start..nz_start + nonzeros]);

        if out.len() > out_cap {
            return XbzrleEncodeResult::Overflow;
        }
    }

    if out.is_empty() {
        XbzrleEncodeResult::Identical
    } else {
        XbzrleEncodeResult::Encoded(out)
    }
}

/// Applies an XBZRLE delta in place: `dest` must already hold `old`'s
/// content on entry. Zero-runs are skipped (left untouched); literal runs
/// overwrite `dest`. A delta that would write past `dest`'s length is a
/// fatal decode overflow.
pub fn xbzrle_decode(encoded: &[u8], dest: &mut [u8]) -> Result<(), crate::error::MigrationError> {
    let page_size = dest.len();
    let mut in_pos = 0usize;
    let mut out_pos = 0usize;

    let overflow = |decoded: usize| crate::error::MigrationError::DecodeOverflow {
        decoded,
        page_size,
    };
    let truncated = || {
        crate::error::MigrationError::InvalidStream("truncated xbzrle record".to_string())
    };

    while in_pos < encoded.len() {
        let (zeros, next) = get_varint(encoded, in_pos).ok_or_else(truncated)?;
        in_pos = next;
        out_pos = out_pos
            .checked_add(zeros as usize)
            .filter(|&p| p <= page_size)
            .ok_or_else(|| overflow(out_pos + zeros as usize))?;

        let (nonzeros, next) = get_varint(encoded, in_pos).ok_or_else(truncated)?;
        in_pos = next;
        let nonzeros = nonzeros as usize;

        let new_out_pos = out_pos
            .checked_add(nonzeros)
            .filter(|&p| p <= page_size)
            .ok_or_else(|| overflow(out_pos + nonzeros))?;
        let literal_end = in_pos.checked_add(nonzeros).ok_or_else(truncated)?;
        if literal_end > encoded.len() {
            return Err(truncated());
        }

        dest[out_pos..new_out_pos].copy_from_slice(&encoded[in_pos..literal_end]);
        out_pos = new_out_pos;
        in_pos = literal_end;
    }

    Ok(())
}

/// Returns `true` iff every byte in `page` equals its first byte. Left as a
/// scalar loop the optimizer can auto-vectorize; the contract (not the
/// implementation) is the part that's load-bearing (design note
/// "vectorized duplicate-page detection").
pub fn is_single_repeated_byte(page: &[u8]) -> Option<u8> {
    let first = *page.first()?;
    if page.iter().all(|&b| b == first) {
        Some(first)
    } else {
        None
    }
}
