//! Post-parse validation. Runs once at bootstrap, after `parse` and before
//! the event loop starts. Unlike parsing, validation collects every problem
//! it finds instead of stopping at the first one, so a misconfigured file
//! reports everything wrong in a single run (§4.10 of the spec).

use super::types::{group_by_bind, AppConfig};
use std::path::Path;

pub fn validate(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    for group in group_by_bind(config) {
        let mut seen_names: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut seen_default = false;
        for server in &group.servers {
            let key = server
                .server_names
                .iter()
                .map(|n| n.to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join(",");
            if server.server_names.is_empty() {
                if seen_default {
                    errors.push(format!(
                        "bind {} has more than one server with no server_name",
                        group.bind_key()
                    ));
                }
                seen_default = true;
            } else if !seen_names.insert(key.clone()) {
                errors.push(format!(
                    "bind {} declares duplicate server_name set '{}'",
                    group.bind_key(),
                    key
                ));
            }
        }
    }

    for server in &config.servers {
        if server.port == 0 {
            errors.push(format!(
                "server on {} has invalid listen port 0",
                server.host
            ));
        }
        if server.host.parse::<std::net::Ipv4Addr>().is_err() {
            errors.push(format!("server host '{}' is not a numeric IPv4 address", server.host));
        }

        if !Path::new(&server.root).is_dir() {
            errors.push(format!(
                "server root '{}' is not a directory",
                server.root
            ));
        }

        for (code, path) in &server.error_pages {
            if !(100..=599).contains(code) {
                errors.push(format!("error_page code {} is out of range", code));
            }
            let resolved = Path::new(&server.root).join(path.trim_start_matches('/'));
            if !resolved.is_file() && !Path::new(path).is_file() {
                errors.push(format!(
                    "error_page {} refers to missing file '{}'",
                    code, path
                ));
            }
        }

        for location in &server.locations {
            if !location.path.starts_with('/') {
                errors.push(format!("location '{}' must begin with '/'", location.path));
            }
            if let Some(root) = &location.root {
                if !Path::new(root).is_dir() {
                    errors.push(format!(
                        "location '{}' root '{}' is not a directory",
                        location.path, root
                    ));
                }
            }
            if let Some(store) = &location.upload_store {
                if !Path::new(store).is_dir() {
                    errors.push(format!(
                        "location '{}' upload_store '{}' is not a directory",
                        location.path, store
                    ));
                }
            }
            if let Some(interp) = &location.cgi_pass {
                if !Path::new(interp).exists() {
                    errors.push(format!(
                        "location '{}' cgi_pass '{}' does not exist",
                        location.path, interp
                    ));
                }
            }
            if let Some(redir) = &location.redirect {
                if redir.code != 301 && redir.code != 302 {
                    errors.push(format!(
                        "location '{}' return code {} must be 301 or 302",
                        location.path, redir.code
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Location, Redirect, ServerConfig};

    fn base_server(tmp: &std::path::Path) -> ServerConfig {
        let mut s = ServerConfig::default();
        s.root = tmp.to_str().unwrap().to_string();
        s.error_pages.clear();
        s
    }

    #[test]
    fn accepts_distinct_vhosts_on_same_bind() {
        let tmp = std::env::temp_dir();
        let mut a = base_server(&tmp);
        a.server_names = vec!["alpha".to_string()];
        let mut b = base_server(&tmp);
        b.server_names = vec!["beta".to_string()];
        let config = AppConfig {
            servers: vec![a, b],
        };
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn rejects_duplicate_server_name_on_same_bind() {
        let tmp = std::env::temp_dir();
        let mut a = base_server(&tmp);
        a.server_names = vec!["dup".to_string()];
        let mut b = base_server(&tmp);
        b.server_names = vec!["dup".to_string()];
        let config = AppConfig {
            servers: vec![a, b],
        };
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_missing_root() {
        let mut s = ServerConfig::default();
        s.root = "/no/such/directory/anywhere".to_string();
        let config = AppConfig { servers: vec![s] };
        let errs = validate(&config).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("is not a directory")));
    }

    #[test]
    fn rejects_bad_redirect_code() {
        let tmp = std::env::temp_dir();
        let mut s = base_server(&tmp);
        s.locations.push(Location {
            path: "/old".to_string(),
            redirect: Some(Redirect {
                code: 418,
                target: "/new".to_string(),
            }),
            ..Default::default()
        });
        let config = AppConfig { servers: vec![s] };
        let errs = validate(&config).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("301 or 302")));
    }
}
