//! Static file resolution, index fallback, autoindex generation and MIME
//! typing (§4.4). Consumes an already-sanitized, root-relative target from
//! the router — this module never sees `..` or absolute paths from the
//! client unvalidated.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::http::response::rfc1123;

#[derive(Debug)]
pub enum Resolved {
    File(PathBuf),
    Autoindex(String),
    NotFound,
    AutoindexFailed,
}

/// Joins `root` and the sanitized `target`, then resolves directories
/// against `index` candidates before falling back to a listing.
pub fn resolve(root: &str, target: &str, index: &[String], autoindex: bool) -> Resolved {
    let rel = target.trim_start_matches('/');
    let path = if rel.is_empty() {
        PathBuf::from(root)
    } else {
        Path::new(root).join(rel)
    };

    let meta = match fs::metadata(&path) {
        Ok(m) => m,
        Err(_) => return Resolved::NotFound,
    };

    if meta.is_file() {
        return Resolved::File(path);
    }

    if meta.is_dir() {
        for candidate in index {
            let candidate_path = path.join(candidate);
            if candidate_path.is_file() {
                return Resolved::File(candidate_path);
            }
        }
        if autoindex {
            return match generate_autoindex(&path, target) {
                Ok(html) => Resolved::Autoindex(html),
                Err(_) => Resolved::AutoindexFailed,
            };
        }
        return Resolved::NotFound;
    }

    Resolved::NotFound
}

/// Builds an HTML directory listing. Hidden entries (dotfiles) are
/// omitted; directories get a trailing slash so clients can tell them
/// apart from files without a second round trip.
pub fn generate_autoindex(dir: &Path, display_path: &str) -> std::io::Result<String> {
    let mut entries: Vec<(String, bool)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        entries.push((name, is_dir));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head><title>Index of ");
    html.push_str(&escape_html(display_path));
    html.push_str("</title></head>\n<body>\n<h1>Index of ");
    html.push_str(&escape_html(display_path));
    html.push_str("</h1>\n<hr>\n<ul>\n");
    if display_path != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for (name, is_dir) in entries {
        let href = if is_dir {
            format!("{}/", name)
        } else {
            name.clone()
        };
        let label = if is_dir { format!("{}/", name) } else { name };
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape_html(&href),
            escape_html(&label)
        ));
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    Ok(html)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Maps a file extension to a MIME type. Unknown extensions fall back to
/// `application/octet-stream` rather than guessing from content.
pub fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// `Last-Modified` value for a file, if its mtime is readable.
pub fn last_modified(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(rfc1123(UNIX_EPOCH + since_epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn resolves_plain_file() {
        let dir = tempdir();
        let file_path = dir.path().join("hello.txt");
        fs::File::create(&file_path)
            .unwrap()
            .write_all(b"hi")
            .unwrap();
        let root = dir.path().to_str().unwrap();
        match resolve(root, "/hello.txt", &[], false) {
            Resolved::File(p) => assert_eq!(p, file_path),
            other => panic!("expected File, got {:?}", other),
        }
    }

    #[test]
    fn falls_back_to_index_file() {
        let dir = tempdir();
        fs::File::create(dir.path().join("index.html")).unwrap();
        let root = dir.path().to_str().unwrap();
        match resolve(root, "/", &["index.html".to_string()], false) {
            Resolved::File(p) => assert!(p.ends_with("index.html")),
            other => panic!("expected File, got {:?}", other),
        }
    }

    #[test]
    fn missing_index_without_autoindex_is_not_found() {
        let dir = tempdir();
        let root = dir.path().to_str().unwrap();
        match resolve(root, "/", &["index.html".to_string()], false) {
            Resolved::NotFound => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn autoindex_lists_entries_and_skips_dotfiles() {
        let dir = tempdir();
        fs::File::create(dir.path().join("a.txt")).unwrap();
        fs::File::create(dir.path().join(".hidden")).unwrap();
        let root = dir.path().to_str().unwrap();
        match resolve(root, "/", &[], true) {
            Resolved::Autoindex(html) => {
                assert!(html.contains("a.txt"));
                assert!(!html.contains(".hidden"));
            }
            other => panic!("expected Autoindex, got {:?}", other),
        }
    }

    #[test]
    fn unknown_path_is_not_found() {
        let dir = tempdir();
        let root = dir.path().to_str().unwrap();
        assert!(matches!(
            resolve(root, "/nope.txt", &[], false),
            Resolved::NotFound
        ));
    }

    #[test]
    fn mime_type_lookup() {
        assert_eq!(mime_type(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(mime_type(Path::new("a.bin")), "application/octet-stream");
    }
}
