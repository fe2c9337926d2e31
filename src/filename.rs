//! Filename resolution from response headers, URL and sniffed bytes.
//!
//! Priority order: `Content-Disposition`, `filename`/`file` query
//! parameters, URL path basename, ZIP local-file-header name, magic-byte
//! extension, `download.bin`. The caller keeps the sniffed prefix and
//! replays it ahead of the remaining body stream.

use reqwest::header::{CONTENT_DISPOSITION, HeaderMap};
use url::Url;

/// Name used when every heuristic comes up empty.
pub const FALLBACK_FILENAME: &str = "download.bin";

/// ZIP local file header signature.
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Magic-byte signatures used to recover a missing extension.
/// `(offset, signature, extension)`.
const MAGIC_TYPES: &[(usize, &[u8], &str)] = &[
    (0, &[0x50, 0x4B, 0x03, 0x04], "zip"),
    (0, &[0x1F, 0x8B], "gz"),
    (0, &[0x42, 0x5A, 0x68], "bz2"),
    (0, &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], "xz"),
    (0, &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], "7z"),
    (0, b"Rar!\x1a\x07", "rar"),
    (0, &[0x89, 0x50, 0x4E, 0x47], "png"),
    (0, &[0xFF, 0xD8, 0xFF], "jpg"),
    (0, b"GIF8", "gif"),
    (0, b"%PDF", "pdf"),
    (0, &[0x7F, 0x45, 0x4C, 0x46], "elf"),
    (4, b"ftyp", "mp4"),
    (257, b"ustar", "tar"),
];

/// Chooses a filename for the resource behind `url`, given the response
/// headers and up to 512 sniffed body bytes.
#[must_use]
pub fn determine_filename(url: &Url, headers: &HeaderMap, sniffed: &[u8]) -> String {
    let mut candidate = content_disposition_filename(headers)
        .or_else(|| query_filename(url))
        .unwrap_or_else(|| path_basename(url));

    let mut filename = sanitize_filename(&candidate);

    // A bare "." candidate with ZIP bytes: recover the name the archive
    // records for its first entry.
    if candidate == "." {
        if let Some(zip_name) = zip_entry_name(sniffed) {
            candidate = zip_name;
            filename = sanitize_filename(&candidate);
        }
    }

    if !filename.contains('.') || filename.ends_with('.') {
        let stem = filename.trim_end_matches('.');
        if !stem.is_empty() {
            if let Some(ext) = detect_extension(sniffed) {
                filename = format!("{stem}.{ext}");
            }
        }
    }

    if filename.is_empty() || filename == "." || filename == "_" {
        filename = FALLBACK_FILENAME.to_string();
    }

    filename
}

/// Extracts the `filename` parameter from `Content-Disposition`, preferring
/// the RFC 5987 `filename*` form.
fn content_disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_DISPOSITION)?.to_str().ok()?;

    for part in value.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // charset'lang'percent-encoded-value
            let mut pieces = encoded.splitn(3, '\'');
            let _charset = pieces.next()?;
            let _lang = pieces.next()?;
            let name = percent_decode(pieces.next()?);
            if !name.is_empty() {
                return Some(name);
            }
        }
    }

    for part in value.split(';').map(str::trim) {
        if let Some(raw) = part.strip_prefix("filename=") {
            let name = raw.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    None
}

fn query_filename(url: &Url) -> Option<String> {
    for key in ["filename", "file"] {
        if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == key) {
            if !v.is_empty() {
                return Some(v.into_owned());
            }
        }
    }
    None
}

fn path_basename(url: &Url) -> String {
    let path = url.path();
    let base = path.rsplit('/').next().unwrap_or("");
    let decoded = percent_decode(base);
    if decoded.is_empty() {
        ".".to_string()
    } else {
        decoded
    }
}

/// Reads the first entry name out of a ZIP local file header.
fn zip_entry_name(sniffed: &[u8]) -> Option<String> {
    if sniffed.len() < 30 || !sniffed.starts_with(&ZIP_MAGIC) {
        return None;
    }
    let name_len = usize::from(u16::from_le_bytes([sniffed[26], sniffed[27]]));
    let end = 30 + name_len;
    if name_len == 0 || end > sniffed.len() {
        return None;
    }
    let name = String::from_utf8_lossy(&sniffed[30..end]).into_owned();
    // Entries may carry directory paths; keep only the basename.
    let base = name.rsplit('/').next().unwrap_or("").to_string();
    (!base.is_empty()).then_some(base)
}

fn detect_extension(sniffed: &[u8]) -> Option<&'static str> {
    MAGIC_TYPES.iter().find_map(|(offset, sig, ext)| {
        sniffed
            .get(*offset..offset + sig.len())
            .filter(|window| window == sig)
            .map(|_| *ext)
    })
}

/// Collapses a candidate to a safe basename: path separators, control
/// characters and the characters Windows forbids all become underscores.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let name = name.replace('\\', "/");
    let base = name.rsplit('/').next().unwrap_or("");
    if base == "." {
        return ".".to_string();
    }

    let cleaned: String = base
        .trim()
        .chars()
        .map(|c| match c {
            '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() && !base.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
