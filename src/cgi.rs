//! CGI/1.1 gateway (§4.5). Spawns the interpreter against the requested
//! script, feeds it the request body over a non-blocking pipe, and parses
//! its stdout into an HTTP response. The child's pipes are registered with
//! the event loop through `mio::unix::SourceFd` — CGI never blocks the
//! reactor, and never gets its own thread.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::config::{Location, ServerConfig};
use crate::http::HttpRequest;

pub const MAX_CGI_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_CGI_BODY_BYTES: usize = 8 * 1024 * 1024;
pub const CGI_DEADLINE_SECS: u64 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum CgiParseState {
    ReadingHeaders,
    StreamingBody,
}

/// Everything needed to exec the interpreter with the right CGI
/// environment for one request. `script_path` is the on-disk file;
/// `path_info` is whatever of the target came after it.
pub struct CgiEnvInput<'a> {
    pub request: &'a HttpRequest,
    pub script_path: &'a Path,
    pub script_name: &'a str,
    pub path_info: &'a str,
    pub server: &'a ServerConfig,
    pub remote_addr: String,
    pub remote_port: u16,
    pub content_length: Option<usize>,
}

/// Builds the CGI/1.1 environment per RFC 3875: fixed meta-variables plus
/// one `HTTP_*` entry per request header.
pub fn build_env(input: &CgiEnvInput) -> HashMap<String, String> {
    let req = input.request;
    let mut env = HashMap::new();

    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
    env.insert("SERVER_SOFTWARE".to_string(), "webserv".to_string());
    env.insert("REQUEST_METHOD".to_string(), req.method.clone());
    env.insert("SCRIPT_NAME".to_string(), input.script_name.to_string());
    env.insert(
        "SCRIPT_FILENAME".to_string(),
        input.script_path.to_string_lossy().into_owned(),
    );
    env.insert("PATH_INFO".to_string(), input.path_info.to_string());
    env.insert("QUERY_STRING".to_string(), req.query().to_string());
    env.insert("SERVER_NAME".to_string(), input.server.host.clone());
    env.insert("SERVER_PORT".to_string(), input.server.port.to_string());
    env.insert("REMOTE_ADDR".to_string(), input.remote_addr.clone());
    env.insert("REMOTE_PORT".to_string(), input.remote_port.to_string());

    if let Some(ct) = req.headers.get("content-type") {
        env.insert("CONTENT_TYPE".to_string(), ct.to_string());
    }
    if let Some(len) = input.content_length {
        env.insert("CONTENT_LENGTH".to_string(), len.to_string());
    }

    for (name, value) in req.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == "content-type" || lower == "content-length" {
            continue;
        }
        let key = format!("HTTP_{}", lower.to_ascii_uppercase().replace('-', "_"));
        env.insert(key, value.to_string());
    }

    env
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A spawned CGI child plus the plumbing to drive it from the event loop.
pub struct CgiProcess {
    pub child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub parse_state: CgiParseState,
    pub header_buf: Vec<u8>,
    pub started_at: Instant,
    stdin_closed: bool,
}

impl CgiProcess {
    pub fn spawn(
        interpreter: &str,
        script_path: &Path,
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> io::Result<CgiProcess> {
        let mut cmd = Command::new(interpreter);
        cmd.arg(path_as_arg(script_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .env_clear();
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        if let Some(ref s) = stdin {
            set_nonblocking(s.as_raw_fd())?;
        }
        if let Some(ref s) = stdout {
            set_nonblocking(s.as_raw_fd())?;
        }

        Ok(CgiProcess {
            child,
            stdin,
            stdout,
            parse_state: CgiParseState::ReadingHeaders,
            header_buf: Vec::new(),
            started_at: Instant::now(),
            stdin_closed: false,
        })
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn register(
        &mut self,
        registry: &Registry,
        stdin_token: Token,
        stdout_token: Token,
    ) -> io::Result<()> {
        if let Some(fd) = self.stdin_fd() {
            registry.register(&mut SourceFd(&fd), stdin_token, Interest::WRITABLE)?;
        }
        if let Some(fd) = self.stdout_fd() {
            registry.register(&mut SourceFd(&fd), stdout_token, Interest::READABLE)?;
        }
        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Some(fd) = self.stdin_fd() {
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        if let Some(fd) = self.stdout_fd() {
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
    }

    /// Writes as much of `body` as the pipe will currently accept,
    /// returning the number of bytes consumed. Closes stdin once the
    /// caller signals there's nothing left to send.
    pub fn write_stdin(&mut self, body: &[u8], body_exhausted: bool) -> io::Result<usize> {
        let mut written = 0;
        if let Some(stdin) = self.stdin.as_mut() {
            match stdin.write(body) {
                Ok(n) => written = n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if body_exhausted && written == body.len() {
            self.close_stdin();
        }
        Ok(written)
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
        self.stdin_closed = true;
    }

    pub fn stdin_open(&self) -> bool {
        !self.stdin_closed
    }

    /// Reads a chunk of stdout into `out`, returning `Ok(0)` on EOF.
    pub fn read_stdout(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(s) => s.read(out),
            None => Ok(0),
        }
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.started_at.elapsed().as_secs() >= CGI_DEADLINE_SECS
    }

    /// SIGKILL plus a blocking reap. Called on timeout or connection
    /// teardown; a CGI child left behind would become a zombie.
    pub fn kill_and_reap(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    pub fn try_reap(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }
}

/// Parsed result of feeding stdout bytes through the header/body state
/// machine: zero or more header lines once the blank-line boundary is
/// seen, plus any body bytes that followed it in the same read.
pub struct CgiOutcome {
    pub headers_ready: Option<(u16, Vec<(String, String)>)>,
    pub body_chunk: Vec<u8>,
}

/// Feeds `data` (newly read stdout bytes) through `state`, accumulating
/// header bytes in `header_buf` until the `\r\n\r\n` (or bare `\n\n`)
/// boundary is found. Enforces `MAX_CGI_HEADER_BYTES` while still in the
/// header phase.
pub fn feed_stdout(
    state: &mut CgiParseState,
    header_buf: &mut Vec<u8>,
    data: &[u8],
) -> Result<CgiOutcome, &'static str> {
    match state {
        CgiParseState::StreamingBody => Ok(CgiOutcome {
            headers_ready: None,
            body_chunk: data.to_vec(),
        }),
        CgiParseState::ReadingHeaders => {
            header_buf.extend_from_slice(data);
            if header_buf.len() > MAX_CGI_HEADER_BYTES {
                return Err("cgi response headers exceeded size limit");
            }
            let boundary = find_subsequence(header_buf, b"\r\n\r\n")
                .map(|p| (p, 4))
                .or_else(|| find_subsequence(header_buf, b"\n\n").map(|p| (p, 2)));

            match boundary {
                Some((pos, len)) => {
                    let header_bytes = header_buf[..pos].to_vec();
                    let body_start = header_buf[pos + len..].to_vec();
                    let (status, headers) = parse_header_block(&header_bytes);
                    *state = CgiParseState::StreamingBody;
                    Ok(CgiOutcome {
                        headers_ready: Some((status, headers)),
                        body_chunk: body_start,
                    })
                }
                None => Ok(CgiOutcome {
                    headers_ready: None,
                    body_chunk: Vec::new(),
                }),
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses a CGI header block into a status code (default 200, taken from
/// the `Status:` pseudo-header if present) and the remaining headers,
/// which get forwarded to the client verbatim.
fn parse_header_block(bytes: &[u8]) -> (u16, Vec<(String, String)>) {
    let mut status = 200;
    let mut headers = Vec::new();
    let text = String::from_utf8_lossy(bytes);

    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("status") {
            status = value
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(200);
        } else {
            headers.push((name.to_string(), value));
        }
    }
    (status, headers)
}

/// The child is `chdir`'d into the script's directory (see `spawn`'s `cwd`
/// argument), so argv[1] is just the script's basename, not its full path.
fn path_as_arg(script_path: &Path) -> &OsStr {
    script_path.file_name().unwrap_or_else(|| script_path.as_os_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_pseudo_header() {
        let (status, headers) = parse_header_block(b"Status: 404 Not Found\r\nContent-Type: text/plain");
        assert_eq!(status, 404);
        assert_eq!(headers, vec![("Content-Type".to_string(), "text/plain".to_string())]);
    }

    #[test]
    fn defaults_to_200_without_status_header() {
        let (status, _) = parse_header_block(b"Content-Type: text/html");
        assert_eq!(status, 200);
    }

    #[test]
    fn feed_stdout_splits_headers_from_body_in_one_read() {
        let mut state = CgiParseState::ReadingHeaders;
        let mut buf = Vec::new();
        let data = b"Content-Type: text/plain\r\n\r\nhello";
        let outcome = feed_stdout(&mut state, &mut buf, data).unwrap();
        let (status, headers) = outcome.headers_ready.unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers[0].0, "Content-Type");
        assert_eq!(outcome.body_chunk, b"hello");
        assert_eq!(state, CgiParseState::StreamingBody);
    }

    #[test]
    fn feed_stdout_needs_more_until_boundary_seen() {
        let mut state = CgiParseState::ReadingHeaders;
        let mut buf = Vec::new();
        let outcome = feed_stdout(&mut state, &mut buf, b"Content-Type: text/plain\r\n").unwrap();
        assert!(outcome.headers_ready.is_none());
        assert_eq!(state, CgiParseState::ReadingHeaders);
    }

    #[test]
    fn feed_stdout_rejects_oversized_headers() {
        let mut state = CgiParseState::ReadingHeaders;
        let mut buf = Vec::new();
        let data = vec![b'a'; MAX_CGI_HEADER_BYTES + 1];
        assert!(feed_stdout(&mut state, &mut buf, &data).is_err());
    }

    #[test]
    fn path_as_arg_strips_directory_component() {
        let arg = path_as_arg(Path::new("/var/www/cgi-bin/report.cgi"));
        assert_eq!(arg, OsStr::new("report.cgi"));
    }

    #[test]
    fn env_includes_http_prefixed_headers() {
        use crate::config::ServerConfig;
        use crate::http::{HeaderMap, HttpRequest};

        let mut headers = HeaderMap::new();
        headers.insert_first("Host".to_string(), "example.com".to_string());
        headers.insert_first("X-Custom".to_string(), "yes".to_string());
        let request = HttpRequest {
            method: "GET".to_string(),
            target: "/cgi-bin/test.cgi?x=1".to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
        };
        let server = ServerConfig::default();
        let input = CgiEnvInput {
            request: &request,
            script_path: Path::new("/var/www/cgi-bin/test.cgi"),
            script_name: "/cgi-bin/test.cgi",
            path_info: "",
            server: &server,
            remote_addr: "127.0.0.1".to_string(),
            remote_port: 5000,
            content_length: None,
        };
        let env = build_env(&input);
        assert_eq!(env.get("HTTP_X_CUSTOM").unwrap(), "yes");
        assert_eq!(env.get("QUERY_STRING").unwrap(), "x=1");
        assert_eq!(env.get("REQUEST_METHOD").unwrap(), "GET");
    }
}
