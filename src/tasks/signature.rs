use memchr::memmem;

use crate::item::EvidenceItem;
use crate::stream::{SeekableStream, read_full};

use super::{ProcessingContext, ProcessingTask, TaskCapabilities, TaskError, TaskOutcome};

pub const ID: &str = "signature";

/// Bytes peeked from the start of the item.
const HEADER_PEEK: usize = 4096;

struct Magic {
    offset: usize,
    bytes: &'static [u8],
    content_type: &'static str,
    extensions: &'static [&'static str],
}

const fn magic(
    offset: usize,
    bytes: &'static [u8],
    content_type: &'static str,
    extensions: &'static [&'static str],
) -> Magic {
    Magic {
        offset,
        bytes,
        content_type,
        extensions,
    }
}

const MAGICS: &[Magic] = &[
    magic(0, b"\xFF\xD8\xFF", "image/jpeg", &["jpg", "jpeg"]),
    magic(0, b"\x89PNG\r\n\x1A\n", "image/png", &["png"]),
    magic(0, b"GIF87a", "image/gif", &["gif"]),
    magic(0, b"GIF89a", "image/gif", &["gif"]),
    magic(0, b"%PDF-", "application/pdf", &["pdf"]),
    magic(0, b"PK\x03\x04", "application/zip", &["zip", "jar", "apk"]),
    magic(
        0,
        b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1",
        "application/x-ole-storage",
        &["doc", "xls", "ppt", "msg"],
    ),
    magic(
        0,
        b"SQLite format 3\0",
        "application/vnd.sqlite3",
        &["sqlite", "db", "sqlite3"],
    ),
    magic(0, b"\x1F\x8B", "application/gzip", &["gz", "tgz"]),
    magic(
        0,
        b"7z\xBC\xAF\x27\x1C",
        "application/x-7z-compressed",
        &["7z"],
    ),
    magic(0, b"Rar!\x1A\x07", "application/vnd.rar", &["rar"]),
    magic(0, b"\x7FELF", "application/x-elf", &["so", "o", "elf"]),
    magic(0, b"MZ", "application/x-msdownload", &["exe", "dll", "sys"]),
    magic(0, b"{\\rtf", "application/rtf", &["rtf"]),
    magic(8, b"WEBP", "image/webp", &["webp"]),
    magic(4, b"ftyp", "video/mp4", &["mp4", "m4v", "mov", "m4a"]),
];

const MAIL_HEADERS: &[&[u8]] = &[
    b"Return-Path:",
    b"Received:",
    b"From:",
    b"Message-ID:",
    b"Subject:",
];

/// Classifies content by its leading bytes.
///
/// The header is peeked under a mark and the stream is rewound, so later
/// tasks start from the same position this task saw.
pub struct SignatureTask;

impl ProcessingTask for SignatureTask {
    fn id(&self) -> &str {
        ID
    }

    fn capabilities(&self) -> TaskCapabilities {
        TaskCapabilities {
            reads_content: true,
            heavy: false,
        }
    }

    fn apply(
        &self,
        item: &EvidenceItem,
        stream: &mut dyn SeekableStream,
        ctx: &mut ProcessingContext,
    ) -> Result<TaskOutcome, TaskError> {
        stream.seek(0)?;
        stream.mark(HEADER_PEEK as u64)?;
        let mut header = vec![0u8; HEADER_PEEK];
        let n = read_full(stream, &mut header)?;
        header.truncate(n);
        stream.reset()?;

        let (content_type, extensions) = classify(&header);
        ctx.insert("content_type", content_type);
        if let Some(ext) = item.extension()
            && !extensions.is_empty()
        {
            ctx.insert("extension_mismatch", !extensions.contains(&ext.as_str()));
        }
        Ok(TaskOutcome::Continue)
    }
}

fn classify(header: &[u8]) -> (&'static str, &'static [&'static str]) {
    if header.is_empty() {
        return ("application/x-empty", &[]);
    }
    for magic in MAGICS {
        let end = magic.offset + magic.bytes.len();
        if header.len() >= end && &header[magic.offset..end] == magic.bytes {
            if magic.bytes == b"PK\x03\x04" {
                return classify_zip(header).unwrap_or((magic.content_type, magic.extensions));
            }
            return (magic.content_type, magic.extensions);
        }
    }
    if MAIL_HEADERS.iter().any(|h| header.starts_with(h)) {
        return ("message/rfc822", &["eml"]);
    }
    if looks_like_text(header) {
        let lower = header.to_ascii_lowercase();
        if memmem::find(&lower, b"<html").is_some()
            || memmem::find(&lower, b"<!doctype html").is_some()
        {
            return ("text/html", &["html", "htm"]);
        }
        return ("text/plain", &[]);
    }
    ("application/octet-stream", &[])
}

/// Office Open XML and EPUB are zip files with a recognisable first entry.
fn classify_zip(header: &[u8]) -> Option<(&'static str, &'static [&'static str])> {
    if memmem::find(header, b"mimetypeapplication/epub+zip").is_some() {
        return Some(("application/epub+zip", &["epub"]));
    }
    if memmem::find(header, b"[Content_Types].xml").is_some() {
        if memmem::find(header, b"word/").is_some() {
            return Some((
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                &["docx"],
            ));
        }
        if memmem::find(header, b"xl/").is_some() {
            return Some((
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                &["xlsx"],
            ));
        }
        if memmem::find(header, b"ppt/").is_some() {
            return Some((
                "application/vnd.openxmlformats-officedocument.presentationml.presentation",
                &["pptx"],
            ));
        }
    }
    None
}

fn looks_like_text(header: &[u8]) -> bool {
    let sample = &header[..header.len().min(512)];
    let printable = sample
        .iter()
        .filter(|&&b| matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7E) || b >= 0x80)
        .count();
    !sample.contains(&0) && printable * 100 >= sample.len() * 95
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EvidenceStream;
    use crate::tasks::tests::{context, item_named};

    fn run(name: &str, data: &[u8]) -> (ProcessingContext, EvidenceStream) {
        let item = item_named(name, data.len() as u64);
        let mut stream = EvidenceStream::from_bytes(data.to_vec());
        let mut ctx = context();
        SignatureTask
            .apply(&item, &mut stream, &mut ctx)
            .expect("signature");
        (ctx, stream)
    }

    #[test]
    fn detects_png_and_rewinds() {
        let mut data = b"\x89PNG\r\n\x1A\n".to_vec();
        data.extend(vec![0u8; 10_000]);
        let (ctx, stream) = run("photo.png", &data);
        assert_eq!(ctx.get("content_type"), Some(&serde_json::json!("image/png")));
        assert_eq!(ctx.get("extension_mismatch"), Some(&serde_json::json!(false)));
        assert_eq!(stream.position().expect("pos"), 0);
    }

    #[test]
    fn flags_renamed_files() {
        let (ctx, _) = run("invoice.txt", b"%PDF-1.7\n...");
        assert_eq!(ctx.get("content_type"), Some(&serde_json::json!("application/pdf")));
        assert_eq!(ctx.get("extension_mismatch"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn recognises_mail_and_html() {
        let (ctx, _) = run("m.eml", b"Received: from mx\r\nSubject: x\r\n\r\nbody");
        assert_eq!(ctx.get("content_type"), Some(&serde_json::json!("message/rfc822")));
        let (ctx, _) = run("index", b"<!DOCTYPE HTML><html><body>hi</body></html>");
        assert_eq!(ctx.get("content_type"), Some(&serde_json::json!("text/html")));
    }

    #[test]
    fn binary_noise_is_octet_stream() {
        let (ctx, _) = run("blob", &[0u8, 1, 2, 3, 250, 251, 0, 9]);
        assert_eq!(
            ctx.get("content_type"),
            Some(&serde_json::json!("application/octet-stream"))
        );
    }
}
