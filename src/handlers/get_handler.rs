//! GET/HEAD handler (§4.4, §4.6 step 4). Resolves the sanitized target
//! under the effective root and turns the result into a response plus,
//! for plain files, the open `File` the connection streams from.

use std::fs::File;
use std::path::PathBuf;

use crate::http::HttpResponse;
use crate::static_file::{self, Resolved};

pub enum GetOutcome {
    /// Status/headers are ready; body is either already attached (autoindex,
    /// HEAD) or must be streamed from `file` for `remaining` bytes.
    Ready {
        response: HttpResponse,
        file: Option<(File, usize)>,
    },
    NotFound,
    ReadError,
}

pub fn handle_get(root: &str, target: &str, index: &[String], autoindex: bool, head_only: bool) -> GetOutcome {
    match static_file::resolve(root, target, index, autoindex) {
        Resolved::File(path) => serve_file(&path, head_only),
        Resolved::Autoindex(html) => {
            let mut response = HttpResponse::new(200);
            if head_only {
                response.header("Content-Type", "text/html; charset=utf-8");
                response.header("Content-Length", &html.len().to_string());
            } else {
                response.set_body(html.into_bytes(), "text/html; charset=utf-8");
            }
            GetOutcome::Ready { response, file: None }
        }
        Resolved::NotFound => GetOutcome::NotFound,
        Resolved::AutoindexFailed => GetOutcome::ReadError,
    }
}

fn serve_file(path: &PathBuf, head_only: bool) -> GetOutcome {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            return match e.kind() {
                std::io::ErrorKind::NotFound => GetOutcome::NotFound,
                _ => GetOutcome::ReadError,
            };
        }
    };
    let size = match file.metadata() {
        Ok(m) => m.len() as usize,
        Err(_) => return GetOutcome::ReadError,
    };

    let mut response = HttpResponse::new(200);
    response.header("Content-Type", static_file::mime_type(path));
    response.header("Content-Length", &size.to_string());
    if let Some(lm) = static_file::last_modified(path) {
        response.header("Last-Modified", &lm);
    }

    if head_only {
        GetOutcome::Ready { response, file: None }
    } else {
        GetOutcome::Ready {
            response,
            file: Some((file, size)),
        }
    }
}
