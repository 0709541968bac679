//! webserv: a single-threaded, non-blocking HTTP/1.1 origin server.
//!
//! The event loop (`server`) owns every listening and client socket and
//! drives them through `mio::Poll`; everything else in this crate is either
//! state a `Connection` carries between readiness events (`http`, `cgi`) or
//! pure, poll-independent logic it calls into (`router`, `static_file`,
//! `handlers`, `config`).

pub mod cgi;
pub mod config;
pub mod error;
pub mod error_page;
pub mod handlers;
pub mod http;
pub mod net;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod static_file;
pub mod timeouts;

pub use error::{CleanError, Result};
