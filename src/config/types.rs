use std::collections::HashMap;
use std::fmt;

/// One of the four methods the core understands. Anything else parses fine
/// as a request but is rejected with 501 at the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A `return <code> <url>;` directive.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub code: u16,
    pub target: String,
}

/// URL path prefix with directives that override server defaults for
/// matching requests. `None` on an override field means "inherit the
/// server's value"; see `Location::effective_*` helpers in `router.rs`.
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub path: String,
    pub root: Option<String>,
    pub index: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    pub allowed_methods: Option<Vec<Method>>,
    pub redirect: Option<Redirect>,
    pub cgi_pass: Option<String>,
    pub cgi_path: Option<String>,
    pub upload_store: Option<String>,
    pub client_max_body_size: Option<u64>,
}

impl Location {
    pub fn cgi_enabled(&self) -> bool {
        self.cgi_pass.is_some()
    }
}

/// One `server { ... }` block. Immutable once parsed; consulted through
/// `Arc<ServerConfig>` references that outlive any single connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_names: Vec<String>,
    pub root: String,
    pub index: Vec<String>,
    pub error_pages: HashMap<u16, String>,
    pub client_max_body_size: Option<u64>,
    pub max_request_line: usize,
    pub max_header_bytes: usize,
    pub max_header_lines: usize,
    pub header_timeout_ms: u64,
    pub access_log: Option<String>,
    pub error_log: Option<String>,
    pub locations: Vec<Location>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            server_names: Vec::new(),
            root: "./www".to_string(),
            index: vec!["index.html".to_string()],
            error_pages: HashMap::new(),
            client_max_body_size: Some(1024 * 1024),
            max_request_line: 8192,
            max_header_bytes: 16384,
            max_header_lines: 100,
            header_timeout_ms: 5000,
            access_log: None,
            error_log: None,
            locations: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host-header match, case-insensitive, ignoring a `:port` suffix.
    pub fn matches_host(&self, host_header: &str) -> bool {
        let hostname = host_header.split(':').next().unwrap_or("");
        self.server_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(hostname))
    }
}

/// The top-level parsed document: an ordered list of server blocks exactly
/// as declared in the file. Grouping into `BindGroup`s happens at bootstrap,
/// not in the grammar.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub servers: Vec<ServerConfig>,
}

/// A set of servers sharing one `host:port` listener. `servers[0]` is the
/// default, selected when no `Host` header matches any declared name.
#[derive(Debug, Clone)]
pub struct BindGroup {
    pub host: String,
    pub port: u16,
    pub servers: Vec<std::sync::Arc<ServerConfig>>,
}

impl BindGroup {
    pub fn bind_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn default_server(&self) -> std::sync::Arc<ServerConfig> {
        self.servers[0].clone()
    }

    pub fn select(&self, host_header: Option<&str>) -> std::sync::Arc<ServerConfig> {
        if let Some(h) = host_header {
            if let Some(s) = self.servers.iter().find(|s| s.matches_host(h)) {
                return s.clone();
            }
        }
        self.default_server()
    }
}

/// Groups an `AppConfig`'s servers by `host:port`. The grouping order follows
/// first appearance in the file; within a group, declaration order is kept
/// so `servers[0]` is always the first-declared (default) server.
pub fn group_by_bind(config: &AppConfig) -> Vec<BindGroup> {
    let mut groups: Vec<BindGroup> = Vec::new();
    for server in &config.servers {
        let arc = std::sync::Arc::new(server.clone());
        if let Some(g) = groups
            .iter_mut()
            .find(|g| g.host == server.host && g.port == server.port)
        {
            g.servers.push(arc);
        } else {
            groups.push(BindGroup {
                host: server.host.clone(),
                port: server.port,
                servers: vec![arc],
            });
        }
    }
    groups
}
