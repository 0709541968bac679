//! Timeout sweep (§5, §9). Runs once per tick over every live connection,
//! checking absolute per-connection deadlines rather than computing a
//! next-wakeup value for the poll call. Four deadlines matter: idle (15s,
//! only while the write buffer is empty), header-read (configurable,
//! default 5s), write-drain (10s) and CGI (5s) — the last two are tracked
//! inside `Connection` itself and just get checked here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::{Poll, Token};

use crate::http::http_connection::{ConnAction, Connection};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sweeps every connection's deadlines, reregistering interest for the
/// ones that are still alive and dropping the ones that are done.
/// Returns the tokens removed so the caller can reclaim their slots.
pub fn sweep(poll: &Poll, connections: &mut HashMap<Token, Connection>) -> Vec<Token> {
    let now = Instant::now();
    let mut removed = Vec::new();

    connections.retain(|token, conn| match conn.sweep(now) {
        ConnAction::Continue => {
            if let Some(interest) = conn.interest() {
                let _ = poll.registry().reregister(&mut conn.stream, *token, interest);
            }
            true
        }
        ConnAction::Remove => {
            let _ = poll.registry().deregister(&mut conn.stream);
            conn.deregister_cgi(poll.registry());
            removed.push(*token);
            false
        }
    });

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_is_one_second() {
        assert_eq!(SWEEP_INTERVAL, Duration::from_secs(1));
    }
}
