//! Temp-file segment writes and the temp-to-target move on completion.
//!
//! Grounded on the teacher's `disk/io.rs` `TorrentFile::write_vectored_at`:
//! a positioned write via `nix`'s raw-fd syscalls, looped until the whole
//! buffer is confirmed written, since a single `pwrite` is not guaranteed
//! to write everything in one call. Generalized from the teacher's
//! vectored multi-block write to a single-segment `pwrite`, since a
//! download here writes one contiguous byte range per call rather than a
//! scatter/gather set of block buffers.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::uio::pwrite;

/// A download's temp file, opened for positioned writes.
pub struct TempFile {
    path: PathBuf,
    handle: File,
}

impl TempFile {
    pub fn create_or_open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new().write(true).create(true).open(&path)?;
        Ok(Self { path, handle })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` at `offset`, retrying until every byte is confirmed
    /// written to disk "IO syscalls are not guaranteed to write
    /// the whole input buffer in one go".
    pub fn write_at(&self, offset: u64, mut data: &[u8]) -> io::Result<()> {
        let mut pos = offset as i64;
        while !data.is_empty() {
            let written = pwrite(self.handle.as_raw_fd(), data, pos).map_err(|e| {
                log::warn!("temp file {:?} write error at offset {}: {}", self.path, pos, e);
                io::Error::new(io::ErrorKind::Other, e)
            })?;
            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "pwrite wrote zero bytes"));
            }
            data = &data[written..];
            pos += written as i64;
        }
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.handle.sync_all()
    }
}

/// Moves `temp` to `target` atomically; if `target` already exists,
/// appends " (N)" (the lowest `N` not already taken) and logs the
/// collision "if destination exists, append \" (N)\" and log".
pub fn finalize_move(temp: &Path, target: &Path) -> io::Result<PathBuf> {
    let final_target = if target.exists() {
        let deduped = dedup_path(target);
        log::info!("{:?} already exists, moving finished download to {:?} instead", target, deduped);
        deduped
    } else {
        target.to_path_buf()
    };
    if let Some(parent) = final_target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(temp, &final_target)?;
    Ok(final_target)
}

fn dedup_path(target: &Path) -> PathBuf {
    let stem = target.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = target.extension().map(|s| s.to_string_lossy().into_owned());
    let parent = target.parent().unwrap_or_else(|| Path::new(""));
    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Formats a TTH/CRC mismatch message the way the teacher logs a hash
/// failure, with the expected digest rendered as hex for the log line
/// "hex::encode(&expected_hash)" rather than base32, since this is a
/// debug/log surface, not wire format.
pub fn format_mismatch(what: &str, expected: &[u8], got: &[u8]) -> String {
    format!("{} mismatch: expected {}, got {}", what, hex::encode(expected), hex::encode(got))
}

/// Deletes a completed-but-failed temp file, the cleanup half of a CRC
/// mismatch "on mismatch, delete the temp".
pub fn delete_temp(temp: &Path) -> io::Result<()> {
    match fs::remove_file(temp) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            log::warn!("failed to delete temp file {:?} after CRC mismatch: {}", temp, e);
            Err(e)
        }
    }
}

/// Computes the CRC-32 (the `.sfv` checksum variant, same polynomial as
/// zip/gzip) of a finished file, for the post-download `.sfv` check.
pub fn compute_crc32(path: &Path) -> io::Result<u32> {
    use std::io::Read;
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Parses one `.sfv` line (`filename CRC32HEX`, `;`-prefixed comments and
/// blank lines ignored) looking for `filename`, matched case-insensitively
/// against the basename.
fn parse_sfv_line(line: &str, filename: &str) -> Option<u32> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(';') {
        return None;
    }
    let (name, crc) = line.rsplit_once(char::is_whitespace)?;
    if !name.trim().eq_ignore_ascii_case(filename) {
        return None;
    }
    u32::from_str_radix(crc.trim(), 16).ok()
}

/// Scans every `*.sfv` file in `dir` for an entry naming `filename`,
/// returning its expected CRC-32 if found "CRC-check against an
/// `.sfv` sibling".
pub fn find_sfv_crc(dir: &Path, filename: &str) -> io::Result<Option<u32>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("sfv")) != Some(true) {
            continue;
        }
        let contents = fs::read_to_string(&path)?;
        for line in contents.lines() {
            if let Some(crc) = parse_sfv_line(line, filename) {
                return Ok(Some(crc));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_at_places_bytes_at_the_requested_offset() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("segment.tmp");
        let file = TempFile::create_or_open(&path).unwrap();
        file.write_at(0, b"AAAA").unwrap();
        file.write_at(4, b"BBBB").unwrap();
        file.sync().unwrap();
        let contents = fs::read(&path).unwrap();
        assert_eq!(&contents, b"AAAABBBB");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn finalize_move_dedups_an_existing_target() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-move-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let temp = dir.join("file.bin.part");
        let target = dir.join("file.bin");
        fs::write(&temp, b"new").unwrap();
        fs::write(&target, b"existing").unwrap();

        let moved = finalize_move(&temp, &target).unwrap();
        assert_eq!(moved, dir.join("file (1).bin"));
        assert_eq!(fs::read(&moved).unwrap(), b"new");
        assert_eq!(fs::read(&target).unwrap(), b"existing");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn finalize_move_is_direct_when_target_is_free() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-move2-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let temp = dir.join("file.bin.part");
        let target = dir.join("file.bin");
        fs::write(&temp, b"data").unwrap();

        let moved = finalize_move(&temp, &target).unwrap();
        assert_eq!(moved, target);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn format_mismatch_renders_hex_digests() {
        let msg = format_mismatch("tth", &[0xAB, 0xCD], &[0x12, 0x34]);
        assert_eq!(msg, "tth mismatch: expected abcd, got 1234");
    }

    #[test]
    fn compute_crc32_matches_a_known_vector() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-crc-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.bin");
        fs::write(&path, b"123456789").unwrap();
        // CRC-32/ISO-HDLC of the ASCII check string "123456789" is the
        // well-known 0xCBF43926.
        assert_eq!(compute_crc32(&path).unwrap(), 0xCBF4_3926);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn find_sfv_crc_matches_case_insensitively_and_ignores_comments() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-sfv-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("checksums.sfv"),
            "; generated by some tool\r\nOTHER.bin deadbeef\r\nFile.BIN cbf43926\r\n",
        )
        .unwrap();
        assert_eq!(find_sfv_crc(&dir, "file.bin").unwrap(), Some(0xCBF4_3926));
        assert_eq!(find_sfv_crc(&dir, "missing.bin").unwrap(), None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn find_sfv_crc_is_none_without_a_sibling_sfv_file() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-nosfv-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(find_sfv_crc(&dir, "file.bin").unwrap(), None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_temp_is_idempotent_when_already_gone() {
        let dir = std::env::temp_dir().join(format!("dctp-core-test-del-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let temp = dir.join("gone.part");
        assert!(delete_temp(&temp).is_ok());
        fs::remove_dir_all(&dir).ok();
    }
}
