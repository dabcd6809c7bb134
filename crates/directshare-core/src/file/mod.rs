//! File helpers: checksums, received-name sanitization and size formatting.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Compute the CRC-32 of a file by streaming it in `chunk_size` pieces.
///
/// # Errors
///
/// Returns `Error::FileNotFound` if the file does not exist, or an I/O error
/// if it cannot be read.
pub async fn crc32_file(path: &Path, chunk_size: usize) -> Result<u32> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::FileNotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Reduce a received file name to its final path component.
///
/// Both `/` and `\` count as separators, since the sender's platform is
/// unknown. The result never escapes the download directory.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_matches(char::from(0));

    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return Err(Error::InvalidInput(format!("unusable file name: {name:?}")));
    }

    Ok(last.to_string())
}

/// Join a sanitized received name onto the download directory.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the name cannot be sanitized.
pub fn output_path(save_dir: &Path, name: &str) -> Result<PathBuf> {
    Ok(save_dir.join(sanitize_file_name(name)?))
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Format a transfer rate for display.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}
