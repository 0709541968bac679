//! The event loop (§4.7): single-threaded, readiness-driven, built on
//! `mio::Poll`. Grounded on the original implementation's `EventLoop` —
//! one `poll()`-equivalent wait per tick, a timeout sweep, a bulk interest
//! refresh, then dispatch over a snapshot of ready descriptors so that
//! mutating the connection table mid-dispatch can't invalidate what we're
//! iterating.
//!
//! Three kinds of `Token` share one namespace, handed out by a single
//! monotonic counter: one per listening socket (allocated up front), one
//! for the shutdown notifier's read end, and two per active CGI gateway
//! (stdin/stdout), allocated and freed as connections come and go.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::{group_by_bind, AppConfig, BindGroup};
use crate::error::Result;
use crate::http::http_connection::{ConnAction, Connection};
use crate::net;
use crate::shutdown::ShutdownNotifier;
use crate::timeouts;

const EVENTS_CAPACITY: usize = 1024;
const TICK: Duration = Duration::from_secs(1);

pub struct EventLoop {
    poll: Poll,
    listeners: HashMap<Token, (TcpListener, std::sync::Arc<BindGroup>)>,
    connections: HashMap<Token, Connection>,
    aux_owner: HashMap<Token, Token>,
    shutdown: ShutdownNotifier,
    shutdown_token: Token,
    shutting_down: bool,
    next_token_value: usize,
}

impl EventLoop {
    pub fn new(config: &AppConfig) -> Result<EventLoop> {
        let mut poll = Poll::new()?;
        let mut next_token_value = 0usize;
        let mut listeners = HashMap::new();

        for group in group_by_bind(config) {
            let mut listener = net::bind_listener(&group.host, group.port)?;
            let token = Token(next_token_value);
            next_token_value += 1;
            poll.registry().register(&mut listener, token, Interest::READABLE)?;
            weblog::info!("listening on {}", group.bind_key());
            listeners.insert(token, (listener, std::sync::Arc::new(group)));
        }

        if listeners.is_empty() {
            return Err("no server blocks to bind".into());
        }

        let shutdown = ShutdownNotifier::install()?;
        let shutdown_token = Token(next_token_value);
        next_token_value += 1;
        shutdown.register(poll.registry(), shutdown_token)?;

        Ok(EventLoop {
            poll,
            listeners,
            connections: HashMap::new(),
            aux_owner: HashMap::new(),
            shutdown,
            shutdown_token,
            shutting_down: false,
            next_token_value,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            match self.poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    weblog::errors!("eventloop: poll: {}", e);
                    return Err(e.into());
                }
            }

            timeouts::sweep(&self.poll, &mut self.connections);
            self.aux_owner.retain(|_, owner| self.connections.contains_key(owner));

            if self.shutting_down && self.connections.is_empty() {
                weblog::info!("shutdown complete — exiting event loop");
                return Ok(());
            }

            let ready: Vec<(Token, bool, bool)> =
                events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

            for (token, readable, writable) in ready {
                if token == self.shutdown_token {
                    self.handle_shutdown_readable();
                    continue;
                }
                if self.listeners.contains_key(&token) {
                    if !self.shutting_down {
                        self.handle_listen_readable(token);
                    }
                    continue;
                }
                if let Some(&owner) = self.aux_owner.get(&token) {
                    self.handle_aux_event(owner, token, readable, writable);
                    continue;
                }
                self.handle_conn_event(token, readable, writable);
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token_value);
        self.next_token_value += 1;
        t
    }

    fn handle_shutdown_readable(&mut self) {
        self.shutdown.drain();
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        weblog::info!(
            "shutdown signal received — stopping accept and draining {} connections",
            self.connections.len()
        );
        for (_, (listener, _)) in self.listeners.iter_mut() {
            let _ = self.poll.registry().deregister(listener);
        }
    }

    fn handle_listen_readable(&mut self, token: Token) {
        let group = match self.listeners.get(&token) {
            Some((_, group)) => group.clone(),
            None => return,
        };
        let mut accepted = Vec::new();
        {
            let (listener, _) = self.listeners.get(&token).unwrap();
            loop {
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e)
                        if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) =>
                    {
                        weblog::warn!("accept: {}, backing off", e);
                        std::thread::sleep(Duration::from_millis(20));
                        break;
                    }
                    Err(e) => {
                        weblog::errors!("accept: {}", e);
                        break;
                    }
                }
            }
        }
        for (stream, addr) in accepted {
            self.add_client(stream, addr, group.clone());
        }
    }

    fn add_client(
        &mut self,
        mut stream: mio::net::TcpStream,
        addr: std::net::SocketAddr,
        group: std::sync::Arc<BindGroup>,
    ) {
        let token = self.alloc_token();
        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            weblog::errors!("register client socket: {}", e);
            return;
        }
        let bind_key = group.bind_key();
        let conn = Connection::new(stream, addr, group);
        weblog::info!("accept {} on {} (clients={})", conn.peer_addr, bind_key, self.connections.len() + 1);
        self.connections.insert(token, conn);
    }

    fn handle_conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        let mut remove = false;
        if let Some(conn) = self.connections.get_mut(&token) {
            if readable {
                if matches!(conn.on_readable(), ConnAction::Remove) {
                    remove = true;
                }
            }
            if !remove && writable {
                if matches!(conn.on_writable(), ConnAction::Remove) {
                    remove = true;
                }
            }
        } else {
            return;
        }
        if remove {
            self.remove_connection(token);
            return;
        }
        self.sync_cgi(token);
        self.refresh_interest(token);
    }

    fn handle_aux_event(&mut self, owner: Token, aux_token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&owner) else {
            self.aux_owner.remove(&aux_token);
            return;
        };
        let is_stdin = conn.cgi_stdin_token == Some(aux_token);
        let is_stdout = conn.cgi_stdout_token == Some(aux_token);
        let mut remove = false;
        if is_stdin && writable {
            conn.on_cgi_stdin_writable();
        }
        if is_stdout && readable {
            if matches!(conn.on_cgi_stdout_readable(), ConnAction::Remove) {
                remove = true;
            }
        }
        if remove {
            self.remove_connection(owner);
            return;
        }
        self.sync_cgi(owner);
        self.refresh_interest(owner);
    }

    /// Registers a freshly spawned CGI process's pipes with fresh aux
    /// tokens, and frees the tokens of any half of a pipe that has
    /// finished (graceful stdin close, or the whole gateway being done).
    fn sync_cgi(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            if conn.cgi_needs_registration() {
                let stdin_token = Token(self.next_token_value);
                let stdout_token = Token(self.next_token_value + 1);
                self.next_token_value += 2;
                conn.register_cgi(self.poll.registry(), stdin_token, stdout_token);
                if let Some(t) = conn.cgi_stdin_token {
                    self.aux_owner.insert(t, token);
                }
                if let Some(t) = conn.cgi_stdout_token {
                    self.aux_owner.insert(t, token);
                }
            }
            let freed = conn.reap_finished_cgi(self.poll.registry());
            for t in freed {
                self.aux_owner.remove(&t);
            }
        }
    }

    fn refresh_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        match conn.interest() {
            Some(interest) => {
                let _ = self.poll.registry().reregister(&mut conn.stream, token, interest);
            }
            None => self.remove_connection(token),
        }
    }

    fn remove_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            conn.deregister_cgi(self.poll.registry());
        }
        self.aux_owner.retain(|_, owner| *owner != token);
    }
}
