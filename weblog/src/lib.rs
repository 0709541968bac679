use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn format_time(now: SystemTime) -> String {
    let duration = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = duration.as_secs();

    let year = 1970 + (secs / 31_557_600);
    let month = ((secs % 31_557_600) / 2_628_000) as u8 + 1;
    let day = ((secs % 2_628_000) / 86_400) as u8 + 1;
    let hour = ((secs % 86_400) / 3600) as u8;
    let minute = ((secs % 3600) / 60) as u8;
    let second = (secs % 60) as u8;

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year, month, day, hour, minute, second
    )
}

static ERROR_SINK: OnceLock<Mutex<Option<File>>> = OnceLock::new();
static ACCESS_SINK: OnceLock<Mutex<Option<File>>> = OnceLock::new();

fn open_sink(path: &Path) -> Option<File> {
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// Opens the optional error-log and access-log files configured for the process.
/// Safe to call more than once; the latest call wins. Never panics: a file that
/// can't be opened just means that sink stays stderr/stdout-only.
pub fn init(error_log: Option<&Path>, access_log: Option<&Path>) {
    let err_file = error_log.and_then(open_sink);
    let acc_file = access_log.and_then(open_sink);
    let _ = ERROR_SINK.set(Mutex::new(err_file));
    let _ = ACCESS_SINK.set(Mutex::new(acc_file));
}

#[doc(hidden)]
pub fn write_error_line(line: &str) {
    eprintln!("{}", line);
    if let Some(lock) = ERROR_SINK.get() {
        if let Ok(mut guard) = lock.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
}

/// Writes one access line. Fields, in fixed order: timestamp, peer, bind key,
/// vhost, request line, status, bytes sent, duration in ms. Never colorized.
pub fn write_access_line(
    peer: &str,
    bind_key: &str,
    vhost: &str,
    request_line: &str,
    status: u16,
    bytes_sent: u64,
    duration_ms: u128,
) {
    let line = format!(
        "[{}] {} {} {} \"{}\" {} {} {}ms",
        format_time(SystemTime::now()),
        peer,
        bind_key,
        vhost,
        request_line,
        status,
        bytes_sent,
        duration_ms
    );
    println!("{}", line);
    if let Some(lock) = ACCESS_SINK.get() {
        if let Ok(mut guard) = lock.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $color:expr, $($arg:tt)*) => {
        $crate::write_error_line(&format!(
            "[{}] \x1b[30m #|| webserv ||# \x1b[0m \x1b[{}m{}\x1b[0m: {}",
            $crate::format_time(std::time::SystemTime::now()),
            $color,
            $level,
            format!($($arg)*)
        ));
    };
}

#[macro_export]
macro_rules! info { ($($arg:tt)*) => { $crate::log!("INFO ", "32", $($arg)*); }; }
#[macro_export]
macro_rules! warn { ($($arg:tt)*) => { $crate::log!("WARN ", "33", $($arg)*); }; }
#[macro_export]
macro_rules! errors { ($($arg:tt)*) => { $crate::log!("ERROR", "31", $($arg)*); }; }
#[macro_export]
macro_rules! debug { ($($arg:tt)*) => { $crate::log!("DEBUG", "36", $($arg)*); }; }
#[macro_export]
macro_rules! trace { ($($arg:tt)*) => { $crate::log!("TRACE", "34", $($arg)*); }; }
#[macro_export]
macro_rules! access {
    ($peer:expr, $bind_key:expr, $vhost:expr, $request_line:expr, $status:expr, $bytes_sent:expr, $duration_ms:expr) => {
        $crate::write_access_line($peer, $bind_key, $vhost, $request_line, $status, $bytes_sent, $duration_ms)
    };
}
