//! A terminal dashboard printed once at startup so an operator can eyeball
//! what was actually parsed before the event loop starts accepting clients.
//! Purely cosmetic — never consulted by the core.

use super::types::{AppConfig, Location, ServerConfig};
use std::fmt;

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  \x1b[38;5;244m────────────────────────────────────────\x1b[0m")?;
        writeln!(
            f,
            "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mBind:\x1b[0m     \x1b[32m{}:{}\x1b[0m",
            self.host, self.port
        )?;
        writeln!(
            f,
            "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mNames:\x1b[0m    \x1b[36m{}\x1b[0m",
            if self.server_names.is_empty() {
                "(default)".to_string()
            } else {
                self.server_names.join(", ")
            }
        )?;
        writeln!(
            f,
            "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mRoot:\x1b[0m     \x1b[32m{}\x1b[0m",
            self.root
        )?;
        writeln!(
            f,
            "  \x1b[1;34m⦿\x1b[0m \x1b[1;37mBody cap:\x1b[0m \x1b[33m{}\x1b[0m",
            self.client_max_body_size
                .map(|n| format!("{} bytes", n))
                .unwrap_or_else(|| "unlimited".to_string())
        )?;
        writeln!(f, "  \x1b[1;37mLocations ({}):\x1b[0m", self.locations.len())?;
        for (idx, loc) in self.locations.iter().enumerate() {
            let is_last = idx + 1 == self.locations.len();
            let branch = if is_last { "  └──" } else { "  ├──" };
            writeln!(f, "  \x1b[38;5;244m{}\x1b[0m {}", branch, loc.path)?;
            loc.fmt_details(f)?;
        }
        Ok(())
    }
}

impl Location {
    fn fmt_details(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(methods) = &self.allowed_methods {
            let names: Vec<&str> = methods.iter().map(|m| m.as_str()).collect();
            writeln!(f, "       methods: {}", names.join(", "))?;
        }
        if let Some(cgi) = &self.cgi_pass {
            writeln!(f, "       cgi_pass: {}", cgi)?;
        }
        if let Some(store) = &self.upload_store {
            writeln!(f, "       upload_store: {}", store)?;
        }
        if let Some(redir) = &self.redirect {
            writeln!(f, "       return {} {}", redir.code, redir.target)?;
        }
        Ok(())
    }
}

pub fn display_config(config: &AppConfig) {
    println!("\n\x1b[1;35m 🌐 webserv configuration\x1b[0m");
    println!("\x1b[38;5;240m ════════════════════════════════════════\x1b[0m");
    for (i, server) in config.servers.iter().enumerate() {
        println!("\n  \x1b[1;37mserver block {:02}\x1b[0m", i + 1);
        print!("{}", server);
    }
    println!("\x1b[38;5;240m ════════════════════════════════════════\x1b[0m");
}
