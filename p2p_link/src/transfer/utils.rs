use crate::transfer::constants::MAX_FILENAME_LENGTH;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Name used when the sender's name has nothing usable left after sanitizing.
pub const FALLBACK_FILE_NAME: &str = "received_file";

/// Windows device names that cannot be used as file names on any drive.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Fill `buf` from `reader`, stopping early only at end-of-stream.
///
/// Returns the number of bytes read; less than `buf.len()` means EOF was hit.
pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Create (truncating) a destination file readable only by the owner on Unix.
pub async fn create_output_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Turn a peer-supplied name into a single safe path component.
///
/// Directory parts (either separator) are dropped, control characters
/// removed, and `.`/`..`/device names replaced by [`FALLBACK_FILE_NAME`].
/// Overlong names are cut on a char boundary, keeping a short extension.
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();

    let trimmed = cleaned.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || RESERVED_NAMES
            .iter()
            .any(|r| trimmed.eq_ignore_ascii_case(r))
    {
        return FALLBACK_FILE_NAME.to_string();
    }

    truncate_keeping_extension(cleaned, MAX_FILENAME_LENGTH)
}

fn truncate_keeping_extension(mut name: String, max: usize) -> String {
    if name.len() <= max {
        return name;
    }

    let ext = name
        .rfind('.')
        .map(|idx| name[idx..].to_string())
        .filter(|ext| ext.len() < 20 && ext.len() < max);

    match ext {
        Some(ext) => {
            let stem_len = name.len() - ext.len();
            name.truncate(floor_char_boundary(&name[..stem_len], max - ext.len()));
            name.push_str(&ext);
        }
        None => {
            let cut = floor_char_boundary(&name, max);
            name.truncate(cut);
        }
    }
    name
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Human readable throughput for log lines.
pub fn format_transfer_speed(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return "n/a".to_string();
    }

    let bps = bytes as f64 / secs;
    if bps > 1_000_000.0 {
        format!("{:.2} MB/s", bps / 1_000_000.0)
    } else if bps > 1_000.0 {
        format!("{:.1} KB/s", bps / 1_000.0)
    } else {
        format!("{:.0} B/s", bps)
    }
}
