//! Centralized error-body resolution (§4.6 "Failure semantics", §9).
//! Every error-producing site goes through `render`, which tries, in
//! order: a per-server mapped error page, a file on disk at the
//! well-known `www/error/<code>.html` path, then a minimal synthesized
//! body. No error path is allowed to invent its own HTML.

use std::fs;
use std::path::Path;

use crate::config::ServerConfig;
use crate::http::HttpResponse;

pub fn render(status: u16, server: Option<&ServerConfig>) -> HttpResponse {
    let mut response = HttpResponse::new(status);

    if let Some(server) = server {
        if let Some(mapped) = server.error_pages.get(&status) {
            let resolved = Path::new(&server.root).join(mapped.trim_start_matches('/'));
            if let Ok(body) = fs::read(&resolved).or_else(|_| fs::read(mapped)) {
                response.set_body(body, "text/html; charset=utf-8");
                return response;
            }
        }
    }

    let well_known = format!("www/error/{}.html", status);
    if let Ok(body) = fs::read(&well_known) {
        response.set_body(body, "text/html; charset=utf-8");
        return response;
    }

    let body = synthesize(status);
    response.set_body(body.into_bytes(), "text/html; charset=utf-8");
    response
}

fn synthesize(status: u16) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{} {}</title></head>\n<body>\n<h1>{} {}</h1>\n</body>\n</html>\n",
        status,
        HttpResponse::status_text(status),
        status,
        HttpResponse::status_text(status)
    )
}
