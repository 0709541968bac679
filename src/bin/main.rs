use std::path::Path;
use std::process::ExitCode;

use webserv::config::{self, display};
use webserv::server::EventLoop;

const DEFAULT_CONFIG_PATH: &str = "conf/webserv.conf";

fn print_help() {
    println!("usage: webserv [--help] [config_path]");
    println!();
    println!("  config_path   path to the server config file (default: {})", DEFAULT_CONFIG_PATH);
}

fn run() -> ExitCode {
    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            other => config_path = other.to_string(),
        }
    }

    let text = match std::fs::read_to_string(&config_path) {
        Ok(t) => t,
        Err(e) => {
            weblog::errors!("reading {}: {}", config_path, e);
            return ExitCode::from(2);
        }
    };

    let parsed = match config::parse(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            weblog::errors!("{}: {}", config_path, e);
            return ExitCode::from(3);
        }
    };

    if let Err(errors) = config::validate(&parsed) {
        for e in &errors {
            weblog::errors!("{}", e);
        }
        return ExitCode::from(4);
    }

    display::display_config(&parsed);

    let error_log = parsed.servers.iter().find_map(|s| s.error_log.clone());
    let access_log = parsed.servers.iter().find_map(|s| s.access_log.clone());
    weblog::init(error_log.as_deref().map(Path::new), access_log.as_deref().map(Path::new));

    let mut event_loop = match EventLoop::new(&parsed) {
        Ok(el) => el,
        Err(e) => {
            weblog::errors!("{}", e);
            return ExitCode::from(2);
        }
    };

    match event_loop.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            weblog::errors!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn main() -> ExitCode {
    run()
}
