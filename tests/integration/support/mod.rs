//! In-process stand-ins for the page and log services.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use nimbus::remote::wire::{decode_payload, LogRequest, LogResponse};
use nimbus::{Config, PoolConfig, PAGE_SIZE};
use parking_lot::{Mutex, MutexGuard};

/// Byte every page of `page_number` is filled with.
pub fn page_fill(page_number: u32) -> u8 {
    (page_number % 251) as u8
}

/// Ways the fake page service can misframe its replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyQuirk {
    /// Announce a `Content-Length` of `u64::MAX`, then close.
    HugeLength,
    /// Announce the full length, send 100 bytes, then close.
    Truncated,
    /// Use chunked transfer encoding.
    Chunked,
    /// Send no length and 100 bytes more than the payload, then close.
    Unframed,
}

#[derive(Default)]
pub struct PageState {
    pub timelines: HashMap<u64, u64>,
    pub page_reads: u64,
    pub health_checks: u64,
    pub connections: usize,
    pub short_pages: bool,
    pub fail_health: bool,
    pub drop_next: bool,
    pub close_each: bool,
    pub quirk: Option<ReplyQuirk>,
}

pub struct FakePageService {
    addr: SocketAddr,
    state: Arc<Mutex<PageState>>,
}

impl FakePageService {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind page service");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(Mutex::new(PageState::default()));
        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_state.lock().connections += 1;
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || serve_page_conn(stream, conn_state));
            }
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }
}

fn serve_page_conn(stream: TcpStream, state: Arc<Mutex<PageState>>) {
    let Ok(read_half) = stream.try_clone() else { return };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();
        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).is_err() {
            return;
        }

        let (status, payload, close, quirk) = {
            let mut state = state.lock();
            if std::mem::take(&mut state.drop_next) {
                return;
            }
            let (status, payload) = route_page(&mut state, &method, &path);
            (status, payload, state.close_each, state.quirk)
        };
        if let Some(quirk) = quirk {
            if !write_quirky(&mut writer, quirk, status, &payload) {
                return;
            }
            continue;
        }
        let head = format!(
            "HTTP/1.1 {status} {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
            if status < 300 { "OK" } else { "Error" },
            payload.len(),
            if close { "close" } else { "keep-alive" }
        );
        if writer.write_all(head.as_bytes()).is_err() || writer.write_all(&payload).is_err() {
            return;
        }
        if close {
            return;
        }
    }
}

/// Writes one misframed reply. Returns whether the connection stays open.
fn write_quirky(writer: &mut TcpStream, quirk: ReplyQuirk, status: u16, payload: &[u8]) -> bool {
    let mut reply = format!("HTTP/1.1 {status} OK\r\n").into_bytes();
    match quirk {
        ReplyQuirk::HugeLength => {
            reply.extend_from_slice(
                format!("Content-Length: {}\r\nConnection: close\r\n\r\n", u64::MAX).as_bytes(),
            );
            reply.extend_from_slice(&payload[..payload.len().min(100)]);
        }
        ReplyQuirk::Truncated => {
            reply.extend_from_slice(
                format!("Content-Length: {}\r\nConnection: close\r\n\r\n", payload.len())
                    .as_bytes(),
            );
            reply.extend_from_slice(&payload[..payload.len().min(100)]);
        }
        ReplyQuirk::Chunked => {
            reply.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
            for chunk in payload.chunks(4096) {
                reply.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                reply.extend_from_slice(chunk);
                reply.extend_from_slice(b"\r\n");
            }
            reply.extend_from_slice(b"0\r\n\r\n");
        }
        ReplyQuirk::Unframed => {
            reply.extend_from_slice(b"Connection: close\r\n\r\n");
            reply.extend_from_slice(payload);
            reply.extend_from_slice(&[0u8; 100]);
        }
    }
    writer.write_all(&reply).is_ok() && quirk == ReplyQuirk::Chunked
}

fn route_page(state: &mut PageState, method: &str, path: &str) -> (u16, Vec<u8>) {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        ("GET", ["health"]) => {
            state.health_checks += 1;
            if state.fail_health {
                (503, b"unhealthy".to_vec())
            } else {
                (200, b"ok".to_vec())
            }
        }
        ("GET", ["page", timeline, page]) => {
            let (Ok(timeline), Ok(page)) = (timeline.parse::<u64>(), page.parse::<u32>()) else {
                return (400, b"bad page address".to_vec());
            };
            if !state.timelines.contains_key(&timeline) {
                return (404, b"timeline not found".to_vec());
            }
            state.page_reads += 1;
            let len = if state.short_pages { 100 } else { PAGE_SIZE };
            (200, vec![page_fill(page); len])
        }
        ("POST", ["timeline", timeline]) => match timeline.parse::<u64>() {
            Ok(timeline) => {
                state.timelines.entry(timeline).or_insert(0);
                (201, Vec::new())
            }
            Err(_) => (400, Vec::new()),
        },
        ("DELETE", ["timeline", timeline]) => match timeline.parse::<u64>() {
            Ok(timeline) if state.timelines.remove(&timeline).is_some() => (200, Vec::new()),
            _ => (404, b"timeline not found".to_vec()),
        },
        ("GET", ["timeline", timeline]) => {
            match timeline.parse::<u64>().ok().and_then(|t| state.timelines.get(&t)) {
                Some(lsn) => (200, format!("{{\"latest_lsn\":{lsn}}}").into_bytes()),
                None => (404, b"timeline not found".to_vec()),
            }
        }
        _ => (404, b"no route".to_vec()),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Appended {
    pub timeline: u64,
    pub lsn: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct LogState {
    pub appended: Vec<Appended>,
    pub timelines: BTreeMap<u64, u64>,
    pub connections: usize,
    pub pings: u64,
    pub reject_appends: bool,
    pub drop_next: bool,
    /// Handle the next request, then close the stream without replying.
    pub drop_reply: bool,
}

pub struct FakeLogService {
    addr: SocketAddr,
    state: Arc<Mutex<LogState>>,
}

impl FakeLogService {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind log service");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(Mutex::new(LogState::default()));
        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_state.lock().connections += 1;
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || serve_log_conn(stream, conn_state));
            }
        });
        Self { addr, state }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock()
    }

    pub fn lsns(&self) -> Vec<u64> {
        self.state.lock().appended.iter().map(|a| a.lsn).collect()
    }
}

fn serve_log_conn(stream: TcpStream, state: Arc<Mutex<LogState>>) {
    let Ok(read_half) = stream.try_clone() else { return };
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let response = {
            let mut state = state.lock();
            if std::mem::take(&mut state.drop_next) {
                return;
            }
            let response = match serde_json::from_str::<LogRequest>(line.trim_end()) {
                Ok(request) => handle_log(&mut state, request),
                Err(err) => LogResponse::Error {
                    code: 400,
                    message: err.to_string(),
                },
            };
            if std::mem::take(&mut state.drop_reply) {
                return;
            }
            response
        };
        let mut reply = serde_json::to_vec(&response).expect("encode response");
        reply.push(b'\n');
        if writer.write_all(&reply).is_err() {
            return;
        }
    }
}

fn handle_log(state: &mut LogState, request: LogRequest) -> LogResponse {
    match request {
        LogRequest::Append {
            timeline_id,
            lsn,
            length,
            data,
        } => {
            if state.reject_appends {
                return LogResponse::Error {
                    code: 503,
                    message: "not accepting writes".into(),
                };
            }
            let data = match decode_payload(&data) {
                Ok(data) if data.len() == length as usize => data,
                _ => {
                    return LogResponse::Error {
                        code: 400,
                        message: "bad payload".into(),
                    }
                }
            };
            state.appended.push(Appended {
                timeline: timeline_id,
                lsn,
                data,
            });
            let committed = state.timelines.entry(timeline_id).or_insert(0);
            *committed = (*committed).max(lsn);
            LogResponse::Ok {
                committed_lsn: Some(lsn),
            }
        }
        LogRequest::CreateTimeline { timeline_id } => {
            state.timelines.entry(timeline_id).or_insert(0);
            LogResponse::Ok { committed_lsn: None }
        }
        LogRequest::DeleteTimeline { timeline_id } => {
            state.timelines.remove(&timeline_id);
            LogResponse::Ok { committed_lsn: None }
        }
        LogRequest::TimelineStatus { timeline_id } => match state.timelines.get(&timeline_id) {
            Some(lsn) => LogResponse::Ok {
                committed_lsn: Some(*lsn),
            },
            None => LogResponse::Error {
                code: 404,
                message: "timeline not found".into(),
            },
        },
        LogRequest::Ping => {
            state.pings += 1;
            LogResponse::Ok { committed_lsn: None }
        }
    }
}

/// Configuration pointing at both fakes with small pools and short timeouts.
pub fn test_config(pages: &FakePageService, log: &FakeLogService, pool: PoolConfig) -> Config {
    Config {
        page_service_url: pages.url(),
        log_service_addr: log.addr(),
        pool,
        acquire_timeout_ms: 200,
        health_check_interval_secs: 30,
        request_timeout_ms: 2_000,
        cache_pages: 16,
        ..Config::default()
    }
}
