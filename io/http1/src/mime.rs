//! Content types by file extension.

/// Map a path to a `Content-Type` by its extension. Unknown extensions
/// are served as `application/octet-stream`.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => ext,
        _ => return "application/octet-stream",
    };
    match ext.to_ascii_lowercase().as_str() {
        "css" => "text/css",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "js" | "mjs" => "text/javascript",
        "txt" => "text/plain",
        "vtt" => "text/vtt",
        "apng" => "image/apng",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "tif" | "tiff" => "image/tiff",
        "jpg" | "jpeg" => "image/jpeg",
        "mp4" => "video/mp4",
        "mpeg" => "video/mpeg",
        "webm" => "video/webm",
        "mp3" => "audio/mp3",
        "mpga" => "audio/mpeg",
        "weba" => "audio/webm",
        "wav" => "audio/wave",
        "otf" => "font/otf",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "7z" => "application/x-7z-compressed",
        "atom" => "application/atom+xml",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "rss" => "application/rss+xml",
        "tar" => "application/x-tar",
        "xht" | "xhtml" => "application/xhtml+xml",
        "xslt" => "application/xslt+xml",
        "xml" => "application/xml",
        "gz" => "application/gzip",
        "zip" => "application/zip",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
