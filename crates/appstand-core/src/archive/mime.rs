//! MIME type inference for archive attachments.
//!
//! Filename extension first, then a short content sniff over the leading
//! bytes. Falls back to `application/octet-stream`.

/// Infers the MIME type of an attachment from its filename and content.
#[must_use]
pub fn mime_type(filename: &str, content: &[u8]) -> &'static str {
    if let Some(by_ext) = by_extension(filename) {
        return by_ext;
    }
    if let Some(by_magic) = by_magic(content) {
        return by_magic;
    }
    "application/octet-stream"
}

fn by_extension(filename: &str) -> Option<&'static str> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return Some("application/gzip");
    }
    let ext = lower.rsplit('.').next()?;
    match ext {
        "svg" => Some("image/svg+xml"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "ico" => Some("image/x-icon"),
        "json" | "webapp" | "konnector" => Some("application/json"),
        "html" | "htm" => Some("text/html"),
        "css" => Some("text/css"),
        "js" => Some("text/javascript"),
        "txt" | "md" => Some("text/plain"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

fn by_magic(content: &[u8]) -> Option<&'static str> {
    if content.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if content.starts_with(b"\xff\xd8\xff") {
        Some("image/jpeg")
    } else if content.starts_with(b"GIF87a") || content.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if content.starts_with(b"\x1f\x8b") {
        Some("application/gzip")
    } else if content.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if sniff_svg(content) {
        Some("image/svg+xml")
    } else {
        None
    }
}

fn sniff_svg(content: &[u8]) -> bool {
    let head = &content[..content.len().min(512)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    let trimmed = text.trim_start();
    trimmed.starts_with("<svg") || (trimmed.starts_with("<?xml") && text.contains("<svg"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_wins_over_content() {
        assert_eq!(mime_type("icon.svg", b"\x89PNG\r\n\x1a\nrest"), "image/svg+xml");
        assert_eq!(mime_type("shot.png", b""), "image/png");
        assert_eq!(mime_type("app.tar.gz", b""), "application/gzip");
    }

    #[test]
    fn content_sniff_covers_unknown_extensions() {
        assert_eq!(mime_type("icon", b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(mime_type("icon", b"<svg xmlns='x'/>"), "image/svg+xml");
        assert_eq!(mime_type("blob", b"\x00\x01\x02"), "application/octet-stream");
    }
}
