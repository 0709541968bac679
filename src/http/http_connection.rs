//! Per-client state machine (§4.6). One `Connection` is created on accept
//! and destroyed after exactly one request/response — there is no
//! keep-alive or pipelining. The state tag says what the connection is
//! doing right now; everything else about it is quiescent.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::cgi::{self, CgiEnvInput, CgiProcess, MAX_CGI_BODY_BYTES};
use crate::config::{BindGroup, Location, Method, ServerConfig};
use crate::error_page;
use crate::handlers::{delete_handler, get_handler, upload_handler};
use crate::http::request::{HttpRequest, ParseOutcome, RequestParser};
use crate::http::response::HttpResponse;
use crate::router::{normalize_target, Router};
use crate::static_file;

const IDLE_TIMEOUT: Duration = Duration::from_secs(15);
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 8192;
const MAX_CHUNK_LINE: usize = 8 * 1024;

#[derive(Debug)]
pub enum ReadState {
    Headers,
    FixedBody { remaining: u64 },
    ChunkedBody { chunk_remaining: u64, in_trailers: bool },
    AwaitingHandler,
    StreamingCgi,
    Writing,
    Closed,
}

pub enum ConnAction {
    Continue,
    Remove,
}

/// The subset of a matched `Location`'s directives a request actually
/// needs once routing is done, cloned out so the connection doesn't have
/// to keep borrowing from `self.server.locations` for the rest of its life.
struct RouteDecision {
    matched_path: String,
    effective_root: String,
    effective_index: Vec<String>,
    autoindex: bool,
    allowed_methods: Option<Vec<Method>>,
    redirect: Option<(u16, String)>,
    cgi_pass: Option<String>,
    cgi_path: Option<String>,
    upload_store: Option<String>,
    body_ceiling: Option<u64>,
}

impl RouteDecision {
    fn from_location(loc: &Location, server: &ServerConfig) -> RouteDecision {
        RouteDecision {
            matched_path: loc.path.clone(),
            effective_root: loc.root.clone().unwrap_or_else(|| server.root.clone()),
            effective_index: loc.index.clone().unwrap_or_else(|| server.index.clone()),
            autoindex: loc.autoindex.unwrap_or(false),
            allowed_methods: loc.allowed_methods.clone(),
            redirect: loc.redirect.as_ref().map(|r| (r.code, r.target.clone())),
            cgi_pass: loc.cgi_pass.clone(),
            cgi_path: loc.cgi_path.clone(),
            upload_store: loc.upload_store.clone(),
            body_ceiling: loc.client_max_body_size,
        }
    }

    fn no_match(server: &ServerConfig) -> RouteDecision {
        RouteDecision {
            matched_path: "/".to_string(),
            effective_root: server.root.clone(),
            effective_index: server.index.clone(),
            autoindex: false,
            allowed_methods: None,
            redirect: None,
            cgi_pass: None,
            cgi_path: None,
            upload_store: None,
            body_ceiling: None,
        }
    }

    fn cgi_enabled(&self) -> bool {
        self.cgi_pass.is_some()
    }
}

pub struct Connection {
    pub stream: TcpStream,
    pub peer_addr: String,
    pub bind_group: Arc<BindGroup>,
    pub server: Arc<ServerConfig>,

    state: ReadState,
    draining: bool,

    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
    write_pos: usize,

    request: Option<HttpRequest>,
    route: Option<RouteDecision>,
    body: Vec<u8>,

    file_download: Option<(File, usize)>,

    cgi: Option<CgiProcess>,
    pub cgi_stdin_token: Option<Token>,
    pub cgi_stdout_token: Option<Token>,
    cgi_stdin_fd: Option<RawFd>,
    cgi_stdout_fd: Option<RawFd>,
    cgi_stdin_pos: usize,
    cgi_chunked_out: bool,
    cgi_headers_sent: bool,
    cgi_body_bytes: u64,

    created_at: Instant,
    last_active: Instant,
    headers_deadline: Instant,
    write_deadline: Option<Instant>,

    status: u16,
    bytes_sent: u64,
    logged: bool,
    request_line: String,
    vhost_reselected: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, bind_group: Arc<BindGroup>) -> Connection {
        let server = bind_group.default_server();
        let now = Instant::now();
        let header_timeout = Duration::from_millis(server.header_timeout_ms);
        Connection {
            stream,
            peer_addr: peer_addr.to_string(),
            bind_group,
            server,
            state: ReadState::Headers,
            draining: false,
            read_buf: Vec::new(),
            read_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            request: None,
            route: None,
            body: Vec::new(),
            file_download: None,
            cgi: None,
            cgi_stdin_token: None,
            cgi_stdout_token: None,
            cgi_stdin_fd: None,
            cgi_stdout_fd: None,
            cgi_stdin_pos: 0,
            cgi_chunked_out: false,
            cgi_headers_sent: false,
            cgi_body_bytes: 0,
            created_at: now,
            last_active: now,
            headers_deadline: now + header_timeout,
            write_deadline: None,
            status: 0,
            bytes_sent: 0,
            logged: false,
            request_line: String::new(),
            vhost_reselected: false,
        }
    }

    /// `wantRead`/`wantWrite` for the event loop to register before each
    /// dispatch; `None` means the connection is done and can be dropped.
    pub fn interest(&self) -> Option<Interest> {
        if matches!(self.state, ReadState::Closed) {
            return None;
        }
        let want_write = self.write_pos < self.write_buf.len() || self.file_download.is_some();
        if want_write && self.draining {
            return Some(Interest::READABLE | Interest::WRITABLE);
        }
        if want_write {
            return Some(Interest::WRITABLE);
        }
        Some(Interest::READABLE)
    }

    pub fn has_cgi(&self) -> bool {
        self.cgi.is_some()
    }

    pub fn register_cgi(&mut self, registry: &Registry, stdin_token: Token, stdout_token: Token) {
        if let Some(cgi) = self.cgi.as_mut() {
            if cgi.register(registry, stdin_token, stdout_token).is_ok() {
                self.cgi_stdin_fd = cgi.stdin_fd();
                self.cgi_stdout_fd = cgi.stdout_fd();
                self.cgi_stdin_token = self.cgi_stdin_fd.map(|_| stdin_token);
                self.cgi_stdout_token = self.cgi_stdout_fd.map(|_| stdout_token);
            }
        }
    }

    /// Unconditional: safe to call whether or not the CGI child is still
    /// alive, since the fds were cached at registration time rather than
    /// read back off a possibly-already-dropped `CgiProcess`.
    pub fn deregister_cgi(&mut self, registry: &Registry) {
        if let Some(fd) = self.cgi_stdin_fd.take() {
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        if let Some(fd) = self.cgi_stdout_fd.take() {
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        self.cgi_stdin_token = None;
        self.cgi_stdout_token = None;
    }

    /// Called by the event loop after dispatching any CGI-related event.
    /// A half of the pipe that has logically finished (stdin closed once
    /// the body was fully written, or the CGI process gone entirely) is
    /// deregistered here so its token can be freed and never routed to
    /// again. Returns the aux tokens that are now free.
    pub fn reap_finished_cgi(&mut self, registry: &Registry) -> Vec<Token> {
        let mut freed = Vec::new();
        let stdin_done = match &self.cgi {
            Some(cgi) => !cgi.stdin_open(),
            None => self.cgi_stdin_fd.is_some(),
        };
        if stdin_done {
            if let Some(token) = self.cgi_stdin_token.take() {
                if let Some(fd) = self.cgi_stdin_fd.take() {
                    let _ = registry.deregister(&mut SourceFd(&fd));
                }
                freed.push(token);
            }
        }
        if self.cgi.is_none() {
            if let Some(token) = self.cgi_stdout_token.take() {
                if let Some(fd) = self.cgi_stdout_fd.take() {
                    let _ = registry.deregister(&mut SourceFd(&fd));
                }
                freed.push(token);
            }
        }
        freed
    }

    /// Whether this connection has a CGI child that hasn't yet been
    /// wired into the event loop with aux tokens.
    pub fn cgi_needs_registration(&self) -> bool {
        self.cgi.is_some() && self.cgi_stdin_token.is_none()
    }

    // ---------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------

    pub fn on_readable(&mut self) -> ConnAction {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.state = ReadState::Closed;
                    return self.post_io_action();
                }
                Ok(n) => {
                    self.last_active = Instant::now();
                    if !self.draining {
                        self.read_buf.extend_from_slice(&buf[..n]);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.state = ReadState::Closed;
                    return self.post_io_action();
                }
            }
        }
        if !self.draining {
            self.process_read_buf();
        }
        self.post_io_action()
    }

    fn process_read_buf(&mut self) {
        loop {
            let made_progress = match self.state {
                ReadState::Headers => self.try_parse_headers(),
                ReadState::FixedBody { .. } => self.feed_fixed_body(),
                ReadState::ChunkedBody { .. } => self.feed_chunked_body(),
                _ => false,
            };
            if !made_progress
                || self.draining
                || matches!(
                    self.state,
                    ReadState::Writing | ReadState::Closed | ReadState::StreamingCgi | ReadState::AwaitingHandler
                )
            {
                break;
            }
        }
        if self.read_pos > 0 {
            self.read_buf.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    fn try_parse_headers(&mut self) -> bool {
        let parser = RequestParser {
            max_request_line: self.server.max_request_line,
            max_header_bytes: self.server.max_header_bytes,
            max_header_lines: self.server.max_header_lines,
        };
        match parser.parse(&self.read_buf[self.read_pos..]) {
            ParseOutcome::NeedMore => false,
            ParseOutcome::Error(kind) => {
                self.respond_error(kind.status());
                false
            }
            ParseOutcome::Complete { request, consumed } => {
                self.read_pos += consumed;
                self.request_line = format!("{} {} {}", request.method, request.target, request.version);
                self.request = Some(request);
                self.dispatch_request();
                true
            }
        }
    }

    fn dispatch_request(&mut self) {
        self.select_vhost();
        let target = {
            let req = self.request.as_ref().unwrap();
            normalize_target(req.path())
        };

        let location = {
            let router = Router::new(&self.server.locations);
            router.resolve(&target).cloned()
        };
        let route = match location {
            Some(loc) => RouteDecision::from_location(&loc, &self.server),
            None => RouteDecision::no_match(&self.server),
        };
        self.route = Some(route);
        self.apply_policy(target);
    }

    fn select_vhost(&mut self) {
        if self.vhost_reselected {
            return;
        }
        let host_header = self
            .request
            .as_ref()
            .and_then(|r| r.headers.get("host"))
            .map(|s| s.to_string());
        if let Some(host) = host_header {
            self.server = self.bind_group.select(Some(&host));
        }
        self.vhost_reselected = true;
    }

    fn apply_policy(&mut self, target: String) {
        let route = self.route.as_ref().unwrap();
        let method_token = self.request.as_ref().unwrap().method.clone();

        if let Some((code, dest)) = route.redirect.clone() {
            let matched = route.matched_path.clone();
            let suffix = target.strip_prefix(&matched).unwrap_or("").to_string();
            let mut response = HttpResponse::new(code);
            response.header("Location", &format!("{}{}", dest, suffix));
            self.enqueue_response(response);
            return;
        }

        let Some(method) = Method::from_token(&method_token) else {
            self.respond_error(501);
            return;
        };

        let check_method = if method == Method::Head { Method::Get } else { method };
        if let Some(allowed) = &route.allowed_methods {
            if !allowed.contains(&check_method) {
                let mut response = error_page::render(405, Some(&self.server));
                let mut names: Vec<&str> = allowed.iter().map(|m| m.as_str()).collect();
                if allowed.contains(&Method::Get) && !allowed.contains(&Method::Head) {
                    names.push("HEAD");
                }
                response.header("Allow", &names.join(", "));
                self.enqueue_response(response);
                return;
            }
        }

        match method {
            Method::Delete => self.do_delete(&target),
            Method::Get | Method::Head => {
                if route.cgi_enabled() {
                    self.start_cgi(&target);
                } else {
                    self.do_get(&target, method == Method::Head);
                }
            }
            Method::Post => self.start_body_phase(),
        }
    }

    fn do_delete(&mut self, target: &str) {
        let route = self.route.as_ref().unwrap();
        let base = route.upload_store.clone().unwrap_or_else(|| route.effective_root.clone());
        let relative = target.strip_prefix(&route.matched_path).unwrap_or(target);
        match delete_handler::handle_delete(&base, relative) {
            delete_handler::DeleteOutcome::Deleted => {
                self.enqueue_response(HttpResponse::new(204));
            }
            delete_handler::DeleteOutcome::NotFound => self.respond_error(404),
            delete_handler::DeleteOutcome::IoError => self.respond_error(500),
        }
    }

    fn do_get(&mut self, target: &str, head_only: bool) {
        let route = self.route.as_ref().unwrap();
        let relative = target.strip_prefix(&route.matched_path).unwrap_or(target);
        let relative = if relative.is_empty() { "/" } else { relative };
        match get_handler::handle_get(&route.effective_root, relative, &route.effective_index, route.autoindex, head_only) {
            get_handler::GetOutcome::Ready { response, file } => match file {
                Some((file, size)) => self.enqueue_headers_then_stream(response, file, size),
                None => self.enqueue_response(response),
            },
            get_handler::GetOutcome::NotFound => self.respond_error(404),
            get_handler::GetOutcome::ReadError => self.respond_error(500),
        }
    }

    fn start_body_phase(&mut self) {
        let req = self.request.as_ref().unwrap();
        let chunked = req
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let ceiling = self.route.as_ref().unwrap().body_ceiling.or(self.server.client_max_body_size);

        if chunked {
            self.state = ReadState::ChunkedBody {
                chunk_remaining: 0,
                in_trailers: false,
            };
            self.process_read_buf();
            return;
        }

        let Some(len_str) = req.headers.get("content-length").map(|v| v.to_string()) else {
            self.respond_error(411);
            return;
        };
        let Ok(len) = len_str.trim().parse::<i64>() else {
            self.respond_error(400);
            return;
        };
        if len < 0 {
            self.respond_error(400);
            return;
        }
        if let Some(ceiling) = ceiling {
            if len as u64 > ceiling {
                self.draining = true;
                self.respond_error(413);
                return;
            }
        }
        self.state = ReadState::FixedBody { remaining: len as u64 };
        self.process_read_buf();
    }

    fn feed_fixed_body(&mut self) -> bool {
        let ReadState::FixedBody { remaining } = self.state else {
            return false;
        };
        let available = self.read_buf.len() - self.read_pos;
        if available == 0 && remaining > 0 {
            return false;
        }
        let take = available.min(remaining as usize);
        self.body.extend_from_slice(&self.read_buf[self.read_pos..self.read_pos + take]);
        self.read_pos += take;
        let left = remaining - take as u64;
        if left == 0 {
            self.finish_body();
        } else {
            self.state = ReadState::FixedBody { remaining: left };
        }
        true
    }

    fn feed_chunked_body(&mut self) -> bool {
        let ceiling = self.route.as_ref().unwrap().body_ceiling.or(self.server.client_max_body_size);

        loop {
            let ReadState::ChunkedBody { chunk_remaining, in_trailers } = self.state else {
                return true;
            };

            if in_trailers {
                let Some(pos) = find_crlf(&self.read_buf, self.read_pos) else {
                    return false;
                };
                let line_len = pos - self.read_pos;
                self.read_pos = pos + 2;
                if line_len == 0 {
                    self.finish_body();
                    return true;
                }
                continue;
            }

            if chunk_remaining == 0 {
                let Some(pos) = find_crlf(&self.read_buf, self.read_pos) else {
                    if self.read_buf.len() - self.read_pos > MAX_CHUNK_LINE {
                        self.respond_error(400);
                        return false;
                    }
                    return false;
                };
                let line = &self.read_buf[self.read_pos..pos];
                if line.len() > MAX_CHUNK_LINE {
                    self.respond_error(400);
                    return false;
                }
                let size_token = std::str::from_utf8(line).ok().and_then(|s| s.split(';').next()).map(|s| s.trim());
                let Some(size) = size_token.and_then(|s| u64::from_str_radix(s, 16).ok()) else {
                    self.respond_error(400);
                    return false;
                };
                self.read_pos = pos + 2;
                if size == 0 {
                    self.state = ReadState::ChunkedBody { chunk_remaining: 0, in_trailers: true };
                    continue;
                }
                if let Some(ceiling) = ceiling {
                    if self.body.len() as u64 + size > ceiling {
                        self.draining = true;
                        self.respond_error(413);
                        return false;
                    }
                }
                self.state = ReadState::ChunkedBody { chunk_remaining: size, in_trailers: false };
                continue;
            }

            let available = self.read_buf.len() - self.read_pos;
            if available == 0 {
                return false;
            }
            let take = available.min(chunk_remaining as usize);
            self.body.extend_from_slice(&self.read_buf[self.read_pos..self.read_pos + take]);
            self.read_pos += take;
            let left = chunk_remaining - take as u64;
            if left > 0 {
                self.state = ReadState::ChunkedBody { chunk_remaining: left, in_trailers: false };
                return false;
            }
            if self.read_buf.len() - self.read_pos < 2 {
                self.state = ReadState::ChunkedBody { chunk_remaining: 0, in_trailers: false };
                return false;
            }
            self.read_pos += 2;
            self.state = ReadState::ChunkedBody { chunk_remaining: 0, in_trailers: false };
        }
    }

    fn finish_body(&mut self) {
        self.state = ReadState::AwaitingHandler;
        let route = self.route.as_ref().unwrap();
        if route.cgi_enabled() {
            let target = {
                let req = self.request.as_ref().unwrap();
                normalize_target(req.path())
            };
            self.start_cgi(&target);
            return;
        }
        if let Some(store) = route.upload_store.clone() {
            let target = {
                let req = self.request.as_ref().unwrap();
                normalize_target(req.path())
            };
            let relative = target.strip_prefix(&route.matched_path).unwrap_or(&target).to_string();
            match upload_handler::write_upload(&store, &relative, &self.body) {
                upload_handler::UploadOutcome::Created { filename } => {
                    let mut response = HttpResponse::new(201);
                    response.header("Location", &format!("{}/{}", route.matched_path.trim_end_matches('/'), filename));
                    self.enqueue_response(response);
                }
                upload_handler::UploadOutcome::Overwritten { filename } => {
                    let mut response = HttpResponse::new(200);
                    response.header("Location", &format!("{}/{}", route.matched_path.trim_end_matches('/'), filename));
                    response.set_body(b"overwritten".to_vec(), "text/plain; charset=utf-8");
                    self.enqueue_response(response);
                }
                upload_handler::UploadOutcome::IoError => self.respond_error(500),
            }
            return;
        }
        let mut response = HttpResponse::new(200);
        response.set_body(b"received".to_vec(), "text/plain; charset=utf-8");
        self.enqueue_response(response);
    }

    fn start_cgi(&mut self, target: &str) {
        let route = self.route.as_ref().unwrap();
        let interpreter = route.cgi_pass.clone().unwrap();
        let script_path = match &route.cgi_path {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(&route.effective_root).join(target.trim_start_matches('/')),
        };
        let path_info = target.strip_prefix(&route.matched_path).unwrap_or("").to_string();
        let script_name = route.matched_path.clone();

        let (remote_addr, remote_port) = match self.stream.peer_addr() {
            Ok(addr) => (addr.ip().to_string(), addr.port()),
            Err(_) => ("0.0.0.0".to_string(), 0),
        };

        let env = {
            let request = self.request.as_ref().unwrap();
            let input = CgiEnvInput {
                request,
                script_path: &script_path,
                script_name: &script_name,
                path_info: &path_info,
                server: &self.server,
                remote_addr,
                remote_port,
                content_length: Some(self.body.len()),
            };
            cgi::build_env(&input)
        };

        let cwd = script_path.parent().map(|p| p.to_path_buf());
        match CgiProcess::spawn(&interpreter, &script_path, &env, cwd.as_deref()) {
            Ok(process) => {
                self.cgi = Some(process);
                self.cgi_stdin_pos = 0;
                self.cgi_chunked_out = false;
                self.cgi_headers_sent = false;
                self.cgi_body_bytes = 0;
                self.state = ReadState::StreamingCgi;
            }
            Err(_) => self.respond_error(502),
        }
    }

    // ---------------------------------------------------------------
    // CGI auxiliary descriptors
    // ---------------------------------------------------------------

    pub fn on_cgi_stdin_writable(&mut self) {
        let body = self.body.clone();
        let pos = self.cgi_stdin_pos.min(body.len());
        if let Some(cgi) = self.cgi.as_mut() {
            if !cgi.stdin_open() {
                return;
            }
            if let Ok(n) = cgi.write_stdin(&body[pos..], true) {
                self.cgi_stdin_pos += n;
            }
        }
    }

    pub fn on_cgi_stdout_readable(&mut self) -> ConnAction {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if self.cgi.is_none() {
                break;
            }
            let read_result = self.cgi.as_mut().unwrap().read_stdout(&mut buf);
            match read_result {
                Ok(0) => {
                    self.finish_cgi_stream(true);
                    break;
                }
                Ok(n) => {
                    let outcome = {
                        let cgi = self.cgi.as_mut().unwrap();
                        cgi::feed_stdout(&mut cgi.parse_state, &mut cgi.header_buf, &buf[..n])
                    };
                    match outcome {
                        Ok(o) => {
                            if let Some((status, headers)) = o.headers_ready {
                                self.flush_cgi_headers(status, headers);
                            }
                            if !o.body_chunk.is_empty() {
                                self.cgi_body_bytes += o.body_chunk.len() as u64;
                                if self.cgi_body_bytes > MAX_CGI_BODY_BYTES as u64 {
                                    self.abort_cgi(502);
                                    return self.post_io_action();
                                }
                                let chunked = self.cgi_chunked_out;
                                self.push_cgi_body(&o.body_chunk, chunked);
                            }
                        }
                        Err(_) => {
                            self.abort_cgi(502);
                            return self.post_io_action();
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.finish_cgi_stream(false);
                    break;
                }
            }
        }
        self.post_io_action()
    }

    fn flush_cgi_headers(&mut self, status: u16, headers: Vec<(String, String)>) {
        self.status = status;
        let mut response = HttpResponse::new(status);
        let had_content_length = headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        for (k, v) in headers {
            response.header(&k, &v);
        }
        self.cgi_chunked_out = !had_content_length;
        if self.cgi_chunked_out {
            response.header("Transfer-Encoding", "chunked");
        }
        let head = response.head_bytes();
        self.bytes_sent += head.len() as u64;
        self.write_buf.extend_from_slice(&head);
        self.cgi_headers_sent = true;
    }

    fn push_cgi_body(&mut self, data: &[u8], chunked: bool) {
        self.bytes_sent += data.len() as u64;
        if chunked {
            self.write_buf.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
            self.write_buf.extend_from_slice(data);
            self.write_buf.extend_from_slice(b"\r\n");
        } else {
            self.write_buf.extend_from_slice(data);
        }
    }

    fn finish_cgi_stream(&mut self, graceful: bool) {
        if graceful && !self.cgi_headers_sent {
            self.abort_cgi(502);
            return;
        }
        if graceful && self.cgi_chunked_out {
            self.write_buf.extend_from_slice(b"0\r\n\r\n");
        }
        if let Some(cgi) = self.cgi.as_mut() {
            let _ = cgi.try_reap();
        }
        self.cgi = None;
        self.state = ReadState::Writing;
        self.write_deadline = Some(Instant::now() + WRITE_DRAIN_TIMEOUT);
    }

    fn abort_cgi(&mut self, status: u16) {
        if let Some(mut cgi) = self.cgi.take() {
            cgi.kill_and_reap();
        }
        if !self.cgi_headers_sent {
            self.respond_error(status);
        } else {
            self.state = ReadState::Writing;
            self.write_deadline = Some(Instant::now() + WRITE_DRAIN_TIMEOUT);
        }
    }

    // ---------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------

    pub fn on_writable(&mut self) -> ConnAction {
        loop {
            if self.write_pos >= self.write_buf.len() && !self.pull_file_chunk() {
                break;
            }
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => break,
                Ok(n) => self.write_pos += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.state = ReadState::Closed;
                    return self.post_io_action();
                }
            }
        }
        if self.write_pos > 0 && self.write_pos == self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
        }
        self.post_io_action()
    }

    fn pull_file_chunk(&mut self) -> bool {
        let Some((file, remaining)) = self.file_download.as_mut() else {
            return false;
        };
        if *remaining == 0 {
            self.file_download = None;
            return false;
        }
        let mut chunk = vec![0u8; (*remaining).min(64 * 1024)];
        match file.read(&mut chunk) {
            Ok(0) => {
                self.file_download = None;
                false
            }
            Ok(n) => {
                chunk.truncate(n);
                *remaining -= n;
                self.write_buf.extend_from_slice(&chunk);
                true
            }
            Err(_) => {
                self.file_download = None;
                self.state = ReadState::Closed;
                false
            }
        }
    }

    // ---------------------------------------------------------------
    // Shared bookkeeping
    // ---------------------------------------------------------------

    fn enqueue_response(&mut self, mut response: HttpResponse) {
        self.status = response.status;
        let bytes = response.serialize();
        self.bytes_sent += bytes.len() as u64;
        self.write_buf.extend_from_slice(&bytes);
        self.state = ReadState::Writing;
        self.write_deadline = Some(Instant::now() + WRITE_DRAIN_TIMEOUT);
    }

    fn enqueue_headers_then_stream(&mut self, mut response: HttpResponse, file: File, size: usize) {
        self.status = response.status;
        let head = response.head_bytes();
        self.bytes_sent += head.len() as u64;
        self.write_buf.extend_from_slice(&head);
        if size > 0 {
            self.file_download = Some((file, size));
        }
        self.state = ReadState::Writing;
        self.write_deadline = Some(Instant::now() + WRITE_DRAIN_TIMEOUT);
    }

    fn respond_error(&mut self, status: u16) {
        if let Some(mut cgi) = self.cgi.take() {
            cgi.kill_and_reap();
        }
        let response = error_page::render(status, Some(&self.server));
        self.enqueue_response(response);
    }

    fn post_io_action(&mut self) -> ConnAction {
        let write_pending = self.write_pos < self.write_buf.len() || self.file_download.is_some();
        if matches!(self.state, ReadState::Closed) {
            self.finalize_close();
            return ConnAction::Remove;
        }
        if matches!(self.state, ReadState::Writing) && !write_pending {
            self.finalize_close();
            return ConnAction::Remove;
        }
        ConnAction::Continue
    }

    fn finalize_close(&mut self) {
        if !self.logged && self.status != 0 {
            let vhost = self.server.server_names.first().map(|s| s.as_str()).unwrap_or("-");
            let duration = self.created_at.elapsed().as_millis();
            weblog::access!(
                &self.peer_addr,
                &self.server.bind_key(),
                vhost,
                &self.request_line,
                self.status,
                self.bytes_sent,
                duration
            );
            self.logged = true;
        }
        self.state = ReadState::Closed;
    }

    /// Invoked once per tick by the timeout sweeper (§5, §9).
    pub fn sweep(&mut self, now: Instant) -> ConnAction {
        if matches!(self.state, ReadState::Closed) {
            return ConnAction::Remove;
        }

        if let Some(cgi) = &self.cgi {
            if cgi.deadline_exceeded() {
                self.abort_cgi(504);
            }
        }

        let write_pending = self.write_pos < self.write_buf.len() || self.file_download.is_some() || self.cgi.is_some();

        if !write_pending && now.duration_since(self.last_active) >= IDLE_TIMEOUT {
            self.respond_error(408);
        } else if matches!(self.state, ReadState::Writing | ReadState::StreamingCgi) {
            if let Some(deadline) = self.write_deadline {
                if now >= deadline {
                    self.state = ReadState::Closed;
                    return self.post_io_action();
                }
            }
        }

        if matches!(self.state, ReadState::Headers) && now >= self.headers_deadline {
            self.respond_error(408);
        }

        self.post_io_action()
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| from + p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_decision_inherits_server_defaults_when_no_location_matches() {
        let server = ServerConfig::default();
        let route = RouteDecision::no_match(&server);
        assert_eq!(route.effective_root, "./www");
        assert!(!route.cgi_enabled());
    }

    #[test]
    fn find_crlf_locates_boundary() {
        assert_eq!(find_crlf(b"abc\r\ndef", 0), Some(3));
        assert_eq!(find_crlf(b"abc", 0), None);
    }
}
