//! End-to-end tests driving a real `EventLoop` over a `TcpStream`: one
//! chunked upload round-trip and one static-file GET, each against its own
//! port so the two tests can run concurrently.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use webserv::config;
use webserv::server::EventLoop;

fn spawn_server(text: String) {
    thread::spawn(move || {
        let parsed = config::parse(&text).expect("test config should parse");
        config::validate(&parsed).expect("test config should validate");
        let mut event_loop = EventLoop::new(&parsed).expect("event loop should start");
        event_loop.run().expect("event loop should run cleanly");
    });
    thread::sleep(Duration::from_millis(200));
}

fn read_response(stream: &mut TcpStream) -> String {
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn chunked_upload_round_trips_to_disk() {
    let root = tempfile::tempdir().unwrap();
    let uploads = tempfile::tempdir().unwrap();

    let text = format!(
        r#"
        server {{
            listen 18080;
            host 127.0.0.1;
            root {root};

            location /upload {{
                upload_store {uploads};
                allowed_methods GET POST;
            }}
        }}
    "#,
        root = root.path().to_str().unwrap(),
        uploads = uploads.path().to_str().unwrap(),
    );
    spawn_server(text);

    let mut stream = TcpStream::connect("127.0.0.1:18080").expect("connect");
    let headers = "POST /upload/greeting.txt HTTP/1.1\r\n\
                   Host: 127.0.0.1\r\n\
                   Transfer-Encoding: chunked\r\n\
                   Content-Type: text/plain\r\n\r\n";
    stream.write_all(headers.as_bytes()).unwrap();
    stream.write_all(b"5\r\nHello\r\n").unwrap();
    stream.write_all(b"7\r\n World!\r\n").unwrap();
    stream.write_all(b"0\r\n\r\n").unwrap();
    stream.flush().unwrap();

    let response = read_response(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 201 Created"),
        "unexpected response: {response}"
    );
    assert!(response.contains("Connection: close"));

    let written = std::fs::read_to_string(uploads.path().join("greeting.txt")).expect("uploaded file");
    assert_eq!(written, "Hello World!");
}

#[test]
fn static_file_get_serves_index_and_404s_missing_paths() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), "hello from disk").unwrap();

    let text = format!(
        r#"
        server {{
            listen 18081;
            host 127.0.0.1;
            root {root};
            index index.html;
        }}
    "#,
        root = root.path().to_str().unwrap(),
    );
    spawn_server(text);

    let mut stream = TcpStream::connect("127.0.0.1:18081").expect("connect");
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "unexpected response: {response}");
    assert!(response.ends_with("hello from disk"));

    let mut stream = TcpStream::connect("127.0.0.1:18081").expect("second connect");
    stream
        .write_all(b"GET /missing.html HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 404"), "unexpected response: {response}");
}

#[test]
fn disallowed_method_reports_405_with_implicit_head() {
    let root = tempfile::tempdir().unwrap();

    let text = format!(
        r#"
        server {{
            listen 18082;
            host 127.0.0.1;
            root {root};

            location /only-get {{
                allowed_methods GET;
            }}
        }}
    "#,
        root = root.path().to_str().unwrap(),
    );
    spawn_server(text);

    let mut stream = TcpStream::connect("127.0.0.1:18082").expect("connect");
    stream
        .write_all(b"POST /only-get HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 405"), "unexpected response: {response}");
    assert!(response.contains("Allow: GET, HEAD"), "unexpected response: {response}");
}

#[test]
fn location_redirect_preserves_suffix_path() {
    let root = tempfile::tempdir().unwrap();

    let text = format!(
        r#"
        server {{
            listen 18083;
            host 127.0.0.1;
            root {root};

            location /old {{
                return 301 /new;
            }}
        }}
    "#,
        root = root.path().to_str().unwrap(),
    );
    spawn_server(text);

    let mut stream = TcpStream::connect("127.0.0.1:18083").expect("connect");
    stream
        .write_all(b"GET /old/path HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 301"), "unexpected response: {response}");
    assert!(response.contains("Location: /new/path"), "unexpected response: {response}");
}

#[test]
fn cgi_script_runs_with_basename_argv_and_streams_response() {
    let root = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\necho \"Status: 200\"\necho \"Content-Type: text/plain\"\necho \"\"\necho \"name=$0\"\n";
    std::fs::write(root.path().join("echo.cgi"), script).unwrap();

    let text = format!(
        r#"
        server {{
            listen 18085;
            host 127.0.0.1;
            root {root};

            location /echo.cgi {{
                cgi_pass /bin/sh;
            }}
        }}
    "#,
        root = root.path().to_str().unwrap(),
    );
    spawn_server(text);

    let mut stream = TcpStream::connect("127.0.0.1:18085").expect("connect");
    stream
        .write_all(b"GET /echo.cgi HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 0\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(
        response.contains("name=echo.cgi") && !response.contains("name=/"),
        "script ran with the wrong argv[1], got: {response}"
    );
}

#[test]
fn body_over_ceiling_gets_413_and_connection_closes() {
    let root = tempfile::tempdir().unwrap();

    let text = format!(
        r#"
        server {{
            listen 18084;
            host 127.0.0.1;
            root {root};
            client_max_body_size 4;
        }}
    "#,
        root = root.path().to_str().unwrap(),
    );
    spawn_server(text);

    let mut stream = TcpStream::connect("127.0.0.1:18084").expect("connect");
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 413"), "unexpected response: {response}");
    assert!(response.contains("Connection: close"), "unexpected response: {response}");
}
