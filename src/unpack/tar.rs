//! POSIX ustar archive extraction.
//!
//! Walks 512-byte headers, validates each header checksum, and returns the
//! regular files. Directories, links, and device entries are skipped.

use super::{ExtractedFile, Unpacker};
use anyhow::{bail, Context};

const BLOCK: usize = 512;
const MAGIC_OFFSET: usize = 257;
const MAX_ENTRIES: usize = 100_000;

fn is_ustar(data: &[u8]) -> bool {
    data.len() >= BLOCK && &data[MAGIC_OFFSET..MAGIC_OFFSET + 5] == b"ustar"
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parse_octal(field: &[u8]) -> anyhow::Result<u64> {
    let text = field_str(field);
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8).with_context(|| format!("bad octal field {:?}", text))
}

fn header_checksum(header: &[u8]) -> u64 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' as u64 } else { b as u64 })
        .sum()
}

fn entry_name(header: &[u8]) -> String {
    let name = field_str(&header[0..100]);
    let prefix = field_str(&header[345..500]);
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[derive(Debug, Default)]
pub struct TarUnpacker;

impl TarUnpacker {
    pub fn new() -> Self {
        Self
    }
}

impl Unpacker for TarUnpacker {
    fn name(&self) -> &str {
        "tar"
    }

    fn accepts(&self, data: &[u8]) -> bool {
        is_ustar(data)
    }

    fn extract(&self, data: &[u8]) -> anyhow::Result<Vec<ExtractedFile>> {
        if !is_ustar(data) {
            bail!("not a ustar archive");
        }
        let mut files = Vec::new();
        let mut off = 0usize;
        for _ in 0..MAX_ENTRIES {
            if off + BLOCK > data.len() {
                break;
            }
            let header = &data[off..off + BLOCK];
            if header.iter().all(|&b| b == 0) {
                break;
            }
            let expected = parse_octal(&header[148..156])?;
            if expected != header_checksum(header) {
                bail!("header checksum mismatch at offset {:#x}", off);
            }
            let size = parse_octal(&header[124..136])? as usize;
            let body = off + BLOCK;
            let typeflag = header[156];
            if typeflag == b'0' || typeflag == 0 {
                let end = body
                    .checked_add(size)
                    .filter(|&end| end <= data.len())
                    .with_context(|| format!("truncated entry at offset {:#x}", off))?;
                files.push(ExtractedFile::new(
                    entry_name(header),
                    data[body..end].to_vec(),
                ));
            }
            let padded = size.div_ceil(BLOCK) * BLOCK;
            off = body.saturating_add(padded);
        }
        Ok(files)
    }
}

/// Pack regular files into a ustar archive.
pub fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, content) in entries {
        let mut header = [0u8; BLOCK];
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(100);
        header[..n].copy_from_slice(&name_bytes[..n]);
        header[100..108].copy_from_slice(b"0000644\0");
        header[108..116].copy_from_slice(b"0000000\0");
        header[116..124].copy_from_slice(b"0000000\0");
        header[124..136].copy_from_slice(format!("{:011o}\0", content.len()).as_bytes());
        header[136..148].copy_from_slice(b"00000000000\0");
        header[156] = b'0';
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        let checksum = header_checksum(&header);
        header[148..156].copy_from_slice(format!("{:06o}\0 ", checksum).as_bytes());

        out.extend_from_slice(&header);
        out.extend_from_slice(content);
        let pad = content.len().div_ceil(BLOCK) * BLOCK - content.len();
        out.resize(out.len() + pad, 0);
    }
    out.resize(out.len() + 2 * BLOCK, 0);
    out
}
