//! Content-type detection from the leading bytes of a file.
//!
//! Implements the WHATWG MIME sniffing table in the same order and with the
//! same results as the classifier shipped with Go's `net/http`, so objects
//! uploaded by either tool carry identical content types.

/// Bytes considered by [`detect_content_type`]
pub const SNIFF_LEN: usize = 512;

const OCTET_STREAM: &str = "application/octet-stream";
const TEXT_HTML: &str = "text/html; charset=utf-8";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

enum Signature {
    /// Case-insensitive tag after leading whitespace, followed by ' ' or '>'
    Html(&'static [u8]),
    /// Prefix match; `mask` bytes of 0x00 are wildcards
    Masked {
        mask: &'static [u8],
        pattern: &'static [u8],
        skip_ws: bool,
        content_type: &'static str,
    },
    Exact(&'static [u8], &'static str),
    Mp4,
    Text,
}

const fn masked(mask: &'static [u8], pattern: &'static [u8], content_type: &'static str) -> Signature {
    Signature::Masked {
        mask,
        pattern,
        skip_ws: false,
        content_type,
    }
}

const RIFF_MASK: &[u8] = b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF";

const EOT_MASK: &[u8] = b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\xFF\xFF";
const EOT_PATTERN: &[u8] = b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\
\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00LP";

static SIGNATURES: &[Signature] = &[
    Signature::Html(b"<!DOCTYPE HTML"),
    Signature::Html(b"<HTML"),
    Signature::Html(b"<HEAD"),
    Signature::Html(b"<SCRIPT"),
    Signature::Html(b"<IFRAME"),
    Signature::Html(b"<H1"),
    Signature::Html(b"<DIV"),
    Signature::Html(b"<FONT"),
    Signature::Html(b"<TABLE"),
    Signature::Html(b"<A"),
    Signature::Html(b"<STYLE"),
    Signature::Html(b"<TITLE"),
    Signature::Html(b"<B"),
    Signature::Html(b"<BODY"),
    Signature::Html(b"<BR"),
    Signature::Html(b"<P"),
    Signature::Html(b"<!--"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\xFF",
        pattern: b"<?xml",
        skip_ws: true,
        content_type: "text/xml; charset=utf-8",
    },
    Signature::Exact(b"%PDF-", "application/pdf"),
    Signature::Exact(b"%!PS-Adobe-", "application/postscript"),
    // Byte order marks
    masked(b"\xFF\xFF\x00\x00", b"\xFE\xFF\x00\x00", "text/plain; charset=utf-16be"),
    masked(b"\xFF\xFF\x00\x00", b"\xFF\xFE\x00\x00", "text/plain; charset=utf-16le"),
    masked(b"\xFF\xFF\xFF\x00", b"\xEF\xBB\xBF\x00", TEXT_PLAIN),
    // Images
    Signature::Exact(b"\x00\x00\x01\x00", "image/x-icon"),
    Signature::Exact(b"\x00\x00\x02\x00", "image/x-icon"),
    Signature::Exact(b"BM", "image/bmp"),
    Signature::Exact(b"GIF87a", "image/gif"),
    Signature::Exact(b"GIF89a", "image/gif"),
    masked(
        b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        b"RIFF\x00\x00\x00\x00WEBPVP",
        "image/webp",
    ),
    Signature::Exact(b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    Signature::Exact(b"\xFF\xD8\xFF", "image/jpeg"),
    // Audio and video
    masked(RIFF_MASK, b"FORM\x00\x00\x00\x00AIFF", "audio/aiff"),
    masked(b"\xFF\xFF\xFF", b"ID3", "audio/mpeg"),
    masked(b"\xFF\xFF\xFF\xFF\xFF", b"OggS\x00", "application/ogg"),
    masked(
        b"\xFF\xFF\xFF\xFF\xFF\xFF\xFF\xFF",
        b"MThd\x00\x00\x00\x06",
        "audio/midi",
    ),
    masked(RIFF_MASK, b"RIFF\x00\x00\x00\x00AVI ", "video/avi"),
    masked(RIFF_MASK, b"RIFF\x00\x00\x00\x00WAVE", "audio/wave"),
    Signature::Mp4,
    Signature::Exact(b"\x1A\x45\xDF\xA3", "video/webm"),
    // Fonts
    masked(EOT_MASK, EOT_PATTERN, "application/vnd.ms-fontobject"),
    Signature::Exact(b"\x00\x01\x00\x00", "font/ttf"),
    Signature::Exact(b"OTTO", "font/otf"),
    Signature::Exact(b"ttcf", "font/collection"),
    Signature::Exact(b"wOFF", "font/woff"),
    Signature::Exact(b"wOF2", "font/woff2"),
    // Archives
    Signature::Exact(b"\x1F\x8B\x08", "application/x-gzip"),
    Signature::Exact(b"PK\x03\x04", "application/zip"),
    Signature::Exact(b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    Signature::Exact(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    Signature::Exact(b"\x00\x61\x73\x6D", "application/wasm"),
    Signature::Text,
];

fn is_ws(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' ')
}

fn is_tag_terminator(b: u8) -> bool {
    b == b' ' || b == b'>'
}

fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

impl Signature {
    fn matches(&self, data: &[u8], first_non_ws: usize) -> Option<&'static str> {
        match *self {
            Signature::Html(tag) => {
                let data = &data[first_non_ws..];
                if data.len() < tag.len() + 1 {
                    return None;
                }
                let same = tag.iter().zip(data).all(|(&t, &d)| {
                    let d = if t.is_ascii_uppercase() { d & 0xDF } else { d };
                    t == d
                });
                (same && is_tag_terminator(data[tag.len()])).then_some(TEXT_HTML)
            }
            Signature::Masked {
                mask,
                pattern,
                skip_ws,
                content_type,
            } => {
                let data = if skip_ws { &data[first_non_ws..] } else { data };
                if data.len() < pattern.len() {
                    return None;
                }
                pattern
                    .iter()
                    .zip(mask)
                    .zip(data)
                    .all(|((&p, &m), &d)| d & m == p)
                    .then_some(content_type)
            }
            Signature::Exact(prefix, content_type) => {
                data.starts_with(prefix).then_some(content_type)
            }
            Signature::Mp4 => is_mp4(data).then_some("video/mp4"),
            Signature::Text => {
                (!data[first_non_ws..].iter().any(|&b| is_binary(b))).then_some(TEXT_PLAIN)
            }
        }
    }
}

/// ISO base media file with an `mp4` brand in its `ftyp` box
fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < box_size || box_size % 4 != 0 || &data[4..8] != b"ftyp" {
        return false;
    }
    // Offset 12 holds the minor version, not a brand
    (8..box_size)
        .step_by(4)
        .filter(|&st| st != 12)
        .any(|st| &data[st..st + 3] == b"mp4")
}

/// Classify `data`, looking at no more than the first [`SNIFF_LEN`] bytes.
///
/// Always returns a valid MIME type, falling back to
/// `application/octet-stream`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];
    let first_non_ws = data.iter().position(|&b| !is_ws(b)).unwrap_or(data.len());

    SIGNATURES
        .iter()
        .find_map(|sig| sig.matches(data, first_non_ws))
        .unwrap_or(OCTET_STREAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_plain_text() {
        assert_eq!(detect_content_type(b""), TEXT_PLAIN);
    }

    #[test]
    fn test_text_and_html() {
        assert_eq!(detect_content_type(b"Hello world!"), TEXT_PLAIN);
        assert_eq!(detect_content_type(b"\n  <html><body>"), TEXT_HTML);
        assert_eq!(detect_content_type(b"<!doctype html>"), TEXT_HTML);
        assert_eq!(detect_content_type(b"<p class=x>"), TEXT_HTML);
        // Tag must be terminated
        assert_eq!(detect_content_type(b"<pre>"), TEXT_PLAIN);
        assert_eq!(detect_content_type(b"<?xml version=\"1.0\"?>"), "text/xml; charset=utf-8");
    }

    #[test]
    fn test_binary_formats() {
        assert_eq!(detect_content_type(b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(detect_content_type(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"), "image/png");
        assert_eq!(detect_content_type(b"\xFF\xD8\xFF\xE0"), "image/jpeg");
        assert_eq!(detect_content_type(b"GIF89a\x01\x00"), "image/gif");
        assert_eq!(detect_content_type(b"RIFF\x10\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(detect_content_type(b"RIFF\x10\x00\x00\x00WAVEfmt "), "audio/wave");
        assert_eq!(detect_content_type(b"\x1F\x8B\x08\x00"), "application/x-gzip");
        assert_eq!(detect_content_type(b"PK\x03\x04\x14\x00"), "application/zip");
        assert_eq!(detect_content_type(b"\0asm\x01\0\0\0"), "application/wasm");
        assert_eq!(detect_content_type(b"wOF2\0\x01"), "font/woff2");
    }

    #[test]
    fn test_byte_order_marks() {
        assert_eq!(detect_content_type(b"\xEF\xBB\xBFhi"), TEXT_PLAIN);
        assert_eq!(detect_content_type(b"\xFE\xFF\x00h"), "text/plain; charset=utf-16be");
        assert_eq!(detect_content_type(b"\xFF\xFEh\x00"), "text/plain; charset=utf-16le");
    }

    #[test]
    fn test_mp4_brand() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 0x18]);
        data.extend_from_slice(b"ftypisom\0\0\x02\0isomiso2mp41");
        assert_eq!(detect_content_type(&data), "video/mp4");
    }

    #[test]
    fn test_unknown_binary_falls_back() {
        assert_eq!(detect_content_type(b"\x01\x02\x03\x04"), OCTET_STREAM);
    }

    #[test]
    fn test_only_first_512_bytes_count() {
        let mut data = vec![b'a'; SNIFF_LEN];
        data.push(0x00);
        assert_eq!(detect_content_type(&data), TEXT_PLAIN);
    }
}
