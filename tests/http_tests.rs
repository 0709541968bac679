use webserv::http::request::{ParseErrorKind, ParseOutcome, RequestParser};
use webserv::http::response::HttpResponse;
use webserv::router::{normalize_target, Router};
use webserv::config::Location;

fn parser() -> RequestParser {
    RequestParser {
        max_request_line: 8192,
        max_header_bytes: 8192,
        max_header_lines: 100,
    }
}

#[test]
fn parses_get_request_in_one_shot() {
    let raw = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    match parser().parse(raw) {
        ParseOutcome::Complete { request, consumed } => {
            assert_eq!(request.method, "GET");
            assert_eq!(request.path(), "/index.html");
            assert_eq!(consumed, raw.len());
            assert_eq!(request.headers.get("host"), Some("localhost"));
        }
        _ => panic!("expected Complete"),
    }
}

#[test]
fn reassembles_headers_delivered_across_multiple_reads() {
    let p = parser();
    let mut buf = Vec::new();

    buf.extend_from_slice(b"GET /path ");
    assert!(matches!(p.parse(&buf), ParseOutcome::NeedMore));

    buf.extend_from_slice(b"HTTP/1.1\r\n");
    assert!(matches!(p.parse(&buf), ParseOutcome::NeedMore));

    buf.extend_from_slice(b"User-Agent: test\r\n\r\n");
    match p.parse(&buf) {
        ParseOutcome::Complete { request, consumed } => {
            assert_eq!(request.target, "/path");
            assert_eq!(consumed, buf.len());
        }
        _ => panic!("expected Complete once headers terminate"),
    }
}

#[test]
fn rejects_request_line_over_limit() {
    let p = RequestParser {
        max_request_line: 16,
        max_header_bytes: 64,
        max_header_lines: 4,
    };
    let raw = b"GET /a/very/long/path/that/is/too/long HTTP/1.1\r\n\r\n";
    assert!(matches!(
        p.parse(raw),
        ParseOutcome::Error(ParseErrorKind::RequestLineTooLong)
    ));
}

#[test]
fn rejects_unsupported_version() {
    let raw = b"GET / HTTP/2.0\r\n\r\n";
    assert!(matches!(
        parser().parse(raw),
        ParseOutcome::Error(ParseErrorKind::BadVersion)
    ));
}

#[test]
fn query_string_is_split_from_path() {
    let raw = b"GET /cgi-bin/report.cgi?user=alice&page=2 HTTP/1.1\r\n\r\n";
    match parser().parse(raw) {
        ParseOutcome::Complete { request, .. } => {
            assert_eq!(request.path(), "/cgi-bin/report.cgi");
            assert_eq!(request.query(), "user=alice&page=2");
        }
        _ => panic!("expected Complete"),
    }
}

#[test]
fn response_serializes_status_headers_and_body() {
    let mut res = HttpResponse::new(200);
    res.set_body(b"Hello Rust".to_vec(), "text/plain");
    let bytes = res.serialize();
    let text = String::from_utf8(bytes).unwrap();

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Type: text/plain\r\n"));
    assert!(text.contains("Content-Length: 10\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.ends_with("\r\n\r\nHello Rust"));
}

#[test]
fn response_omits_content_length_when_chunked() {
    let mut res = HttpResponse::new(200);
    res.header("Transfer-Encoding", "chunked");
    let bytes = res.serialize();
    let text = String::from_utf8(bytes).unwrap();
    assert!(!text.contains("Content-Length"));
}

#[test]
fn router_resolves_matched_request_target() {
    let locations = vec![
        Location { path: "/".to_string(), ..Default::default() },
        Location { path: "/cgi-bin".to_string(), ..Default::default() },
    ];
    let router = Router::new(&locations);

    let target = normalize_target("/cgi-bin/report.cgi");
    assert_eq!(router.resolve(&target).unwrap().path, "/cgi-bin");

    let target = normalize_target("/static/logo.png");
    assert_eq!(router.resolve(&target).unwrap().path, "/");
}

#[test]
fn router_falls_back_to_root_target_before_matching_on_traversal() {
    assert_eq!(normalize_target("/../../etc/passwd"), "/");
}
