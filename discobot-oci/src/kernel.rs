//! Guest kernel image recognition and normalisation.
//!
//! Registry-delivered kernels arrive in several shapes: a raw ELF vmlinux
//! (x86_64), a raw ARM64 `Image`, a whole-file compressed blob, or a PE/EFI
//! bzImage whose boot-protocol header points at a compressed payload. The
//! Virtualization framework boot loader only accepts the first two, so the
//! extracted `vmlinuz` is rewritten in place until it starts with a
//! recognised kernel magic.
//!
//! Resolution order:
//! 1. accept as-is if already a recognised kernel;
//! 2. if the file starts with a known compression magic, decompress the
//!    whole file and accept a recognised result;
//! 3. if the file carries the x86 boot-protocol header (`HdrS`), slice out
//!    the payload at `(setup_sects + 1) * 512 + payload_offset` and
//!    decompress it;
//! 4. scan the whole file for every known compression magic and accept the
//!    first offset that decompresses to a recognised kernel.

use std::io::Read;
use std::path::Path;

use crate::error::{OciError, Result};

/// ELF magic, start of file (x86_64 vmlinux).
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ARM64 `Image` magic "ARM\x64", at a fixed offset in the header.
const ARM64_MAGIC: [u8; 4] = [0x41, 0x52, 0x4d, 0x64];
const ARM64_MAGIC_OFFSET: usize = 56;

// x86 Linux boot protocol header offsets.
const BOOT_SETUP_SECTS: usize = 0x1f1;
const BOOT_HDRS_OFFSET: usize = 0x202;
const BOOT_PAYLOAD_OFFSET: usize = 0x248;
const BOOT_PAYLOAD_LENGTH: usize = 0x24c;
const BOOT_HDRS_MAGIC: [u8; 4] = *b"HdrS";

/// Compression container formats a kernel payload may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Gzip,
    Zstd,
    Xz,
    Lzma,
}

const COMPRESSION_KINDS: [Compression; 4] = [
    Compression::Gzip,
    Compression::Zstd,
    Compression::Xz,
    Compression::Lzma,
];

impl Compression {
    fn magic(self) -> &'static [u8] {
        match self {
            Compression::Gzip => &[0x1f, 0x8b],
            Compression::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
            Compression::Xz => &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
            Compression::Lzma => &[0x5d, 0x00, 0x00],
        }
    }
}

/// Returns `true` when `data` starts with a bootable kernel image: an ELF
/// vmlinux or an ARM64 `Image`.
pub fn is_kernel_image(data: &[u8]) -> bool {
    if data.len() >= ELF_MAGIC.len() && data[..ELF_MAGIC.len()] == ELF_MAGIC {
        return true;
    }
    if data.len() >= ARM64_MAGIC_OFFSET + ARM64_MAGIC.len()
        && data[ARM64_MAGIC_OFFSET..ARM64_MAGIC_OFFSET + ARM64_MAGIC.len()] == ARM64_MAGIC
    {
        return true;
    }
    false
}

/// Detect a compression magic at `offset`.
fn compression_at(data: &[u8], offset: usize) -> Option<Compression> {
    COMPRESSION_KINDS.into_iter().find(|kind| {
        let magic = kind.magic();
        data.len() >= offset + magic.len() && &data[offset..offset + magic.len()] == magic
    })
}

/// Decompress `data` with the given container format.
///
/// Zstd payloads embedded in kernels routinely carry trailing bytes after
/// the first frame; decoding stops at the frame boundary and the trailing
/// bytes are ignored. Gzip likewise stops at the end of the first member.
fn decompress(data: &[u8], kind: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match kind {
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| OciError::Kernel(format!("gzip decompression: {}", e)))?;
        }
        Compression::Zstd => {
            zstd::stream::read::Decoder::new(data)
                .map_err(|e| OciError::Kernel(format!("zstd init: {}", e)))?
                .single_frame()
                .read_to_end(&mut out)
                .map_err(|e| OciError::Kernel(format!("zstd decompression: {}", e)))?;
        }
        Compression::Xz => {
            xz2::read::XzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| OciError::Kernel(format!("xz decompression: {}", e)))?;
        }
        Compression::Lzma => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| OciError::Kernel(format!("lzma init: {}", e)))?;
            xz2::read::XzDecoder::new_stream(data, stream)
                .read_to_end(&mut out)
                .map_err(|e| OciError::Kernel(format!("lzma decompression: {}", e)))?;
        }
    }
    Ok(out)
}

/// Slice out the compressed payload of an x86 boot-protocol image.
///
/// The payload starts at `(setup_sects + 1) * 512 + payload_offset` and runs
/// for `payload_length` bytes. A `setup_sects` of zero means the historical
/// default of four sectors.
fn boot_protocol_payload(data: &[u8]) -> Option<&[u8]> {
    if data.len() < BOOT_PAYLOAD_LENGTH + 4 {
        return None;
    }
    if data[BOOT_HDRS_OFFSET..BOOT_HDRS_OFFSET + 4] != BOOT_HDRS_MAGIC {
        return None;
    }

    let mut setup_sects = data[BOOT_SETUP_SECTS] as usize;
    if setup_sects == 0 {
        setup_sects = 4;
    }
    let payload_offset = u32::from_le_bytes(
        data[BOOT_PAYLOAD_OFFSET..BOOT_PAYLOAD_OFFSET + 4]
            .try_into()
            .ok()?,
    ) as usize;
    let payload_length = u32::from_le_bytes(
        data[BOOT_PAYLOAD_LENGTH..BOOT_PAYLOAD_LENGTH + 4]
            .try_into()
            .ok()?,
    ) as usize;

    let start = (setup_sects + 1) * 512 + payload_offset;
    let end = start.checked_add(payload_length)?;
    if payload_length == 0 || end > data.len() {
        return None;
    }
    Some(&data[start..end])
}

/// Produce an uncompressed kernel image from `data`.
///
/// Returns `Ok(None)` when `data` already is a recognised kernel (the
/// caller leaves the file untouched), `Ok(Some(bytes))` with the image to
/// write otherwise.
pub fn uncompress_kernel(data: &[u8]) -> Result<Option<Vec<u8>>> {
    // 1. Already bootable.
    if is_kernel_image(data) {
        return Ok(None);
    }

    // 2. Whole-file compression.
    if let Some(kind) = compression_at(data, 0) {
        if let Ok(out) = decompress(data, kind) {
            if is_kernel_image(&out) {
                return Ok(Some(out));
            }
        }
    }

    // 3. Boot-protocol payload slice.
    if let Some(payload) = boot_protocol_payload(data) {
        if let Some(kind) = compression_at(payload, 0) {
            if let Ok(out) = decompress(payload, kind) {
                if is_kernel_image(&out) {
                    return Ok(Some(out));
                }
            }
        }
    }

    // 4. Brute-force scan for an embedded compressed image.
    for offset in 0..data.len() {
        if let Some(kind) = compression_at(data, offset) {
            if let Ok(out) = decompress(&data[offset..], kind) {
                if is_kernel_image(&out) {
                    return Ok(Some(out));
                }
            }
        }
    }

    Err(OciError::Kernel(
        "file is not a recognisable kernel image and no decompression strategy produced one"
            .to_string(),
    ))
}

/// Rewrite `path` in place with an uncompressed kernel image.
///
/// Returns `true` when the file was rewritten, `false` when it already held
/// a recognised kernel (the bytes are untouched). The replacement is staged
/// in a sibling file and renamed over the original.
pub fn normalize_file(path: &Path) -> Result<bool> {
    let data = std::fs::read(path)?;
    match uncompress_kernel(&data)? {
        None => Ok(false),
        Some(image) => {
            let staged = path.with_extension("decompress-tmp");
            std::fs::write(&staged, &image)?;
            std::fs::rename(&staged, path)?;
            Ok(true)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
