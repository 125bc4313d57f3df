//! In-process RESP server for exercising the client end to end.
//!
//! Understands a small command set (PING, ECHO, SET, GET, DEL, INCR, HSET,
//! HGETALL, CLIENT ID, SLEEP) plus MULTI/EXEC/DISCARD queuing. `FLOOD n`
//! answers with a simple string line of `n` bytes that never terminates.

#![allow(dead_code)]

use respool::config::ClientConfig;
use respool::framer::LineFramer;
use respool::resp::{self, RespValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    Hash(Vec<(String, String)>),
}

type Store = Arc<Mutex<HashMap<String, Entry>>>;

#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicU64,
    pub commands: AtomicUsize,
    /// A second command arrived while a reply was still pending.
    pub overlap: AtomicBool,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

pub struct MockServer {
    pub port: u16,
    pub stats: Arc<Stats>,
    kill: Arc<Mutex<CancellationToken>>,
    clients: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_reply_delay(Duration::ZERO).await
    }

    /// Every reply is held back by `delay`, and any bytes that arrive in the
    /// meantime are recorded in `Stats::overlap`.
    pub async fn with_reply_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(Stats::default());
        let kill = Arc::new(Mutex::new(CancellationToken::new()));
        let clients = Arc::new(Mutex::new(HashMap::new()));
        let store: Store = Arc::new(Mutex::new(HashMap::new()));

        let accept_stats = stats.clone();
        let accept_kill = kill.clone();
        let accept_clients = clients.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_stats.connections.fetch_add(1, Ordering::SeqCst) + 1;
                let token = accept_kill.lock().unwrap().child_token();
                accept_clients.lock().unwrap().insert(id, token.clone());
                let session = Session {
                    id,
                    store: store.clone(),
                    stats: accept_stats.clone(),
                    queued: None,
                    dirty: false,
                };
                tokio::spawn(serve(stream, session, delay, token));
            }
        });

        MockServer {
            port,
            stats,
            kill,
            clients,
        }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.port)
    }

    /// Drop every open client socket. The listener keeps accepting.
    pub fn kill_connections(&self) {
        let mut kill = self.kill.lock().unwrap();
        kill.cancel();
        *kill = CancellationToken::new();
    }

    /// Drop the one socket whose session answers `CLIENT ID` with `id`.
    pub fn kill_client(&self, id: u64) {
        if let Some(token) = self.clients.lock().unwrap().remove(&id) {
            token.cancel();
        }
    }
}

async fn serve(mut stream: TcpStream, mut session: Session, delay: Duration, kill: CancellationToken) {
    let mut framer = LineFramer::new();
    loop {
        let mut commands = Vec::new();
        loop {
            let mut lines = framer.cursor();
            match resp::decode(&mut lines, false) {
                Ok(Some(value)) => {
                    let used = lines.position();
                    framer.consume(used);
                    commands.push(arguments(value));
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }

        if commands.is_empty() {
            tokio::select! {
                _ = kill.cancelled() => return,
                read = framer.fill(&mut stream) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                },
            }
        }

        let mut out = Vec::new();
        for args in commands {
            session.stats.commands.fetch_add(1, Ordering::SeqCst);
            if args.first().is_some_and(|verb| verb.eq_ignore_ascii_case("FLOOD")) {
                let n: usize = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(0);
                out.push(b'+');
                out.resize(out.len() + n, b'x');
                continue;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
                let mut peek = [0u8; 256];
                if let Ok(n) = stream.try_read(&mut peek) {
                    if n > 0 {
                        session.stats.overlap.store(true, Ordering::SeqCst);
                        framer.extend(&peek[..n]);
                    }
                }
            }
            write_reply(&session.execute(args).await, &mut out);
        }
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Server-side encoding of a reply. Maps go out as flat arrays.
fn write_reply(value: &RespValue, out: &mut Vec<u8>) {
    match value {
        RespValue::SimpleString(s) => out.extend_from_slice(format!("+{s}\r\n").as_bytes()),
        RespValue::Error(s) => out.extend_from_slice(format!("-{s}\r\n").as_bytes()),
        RespValue::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
        RespValue::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
        RespValue::BulkString(Some(s)) => {
            out.extend_from_slice(format!("${}\r\n{s}\r\n", s.len()).as_bytes())
        }
        RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        RespValue::Array(Some(items)) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            items.iter().for_each(|item| write_reply(item, out));
        }
        RespValue::Map(pairs) => {
            out.extend_from_slice(format!("*{}\r\n", pairs.len() * 2).as_bytes());
            for (key, value) in pairs {
                write_reply(key, out);
                write_reply(value, out);
            }
        }
    }
}

fn arguments(value: RespValue) -> Vec<String> {
    value
        .into_array()
        .unwrap_or_default()
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

struct Session {
    id: u64,
    store: Store,
    stats: Arc<Stats>,
    queued: Option<Vec<Vec<String>>>,
    dirty: bool,
}

const KNOWN: &[&str] = &[
    "PING", "ECHO", "SET", "GET", "DEL", "INCR", "HSET", "HGETALL", "CLIENT", "SLEEP",
];

impl Session {
    async fn execute(&mut self, args: Vec<String>) -> RespValue {
        let Some(verb) = args.first().map(|v| v.to_uppercase()) else {
            return error_reply("ERR empty command");
        };

        if let Some(queue) = self.queued.as_mut() {
            return match verb.as_str() {
                "MULTI" => error_reply("ERR MULTI calls can not be nested"),
                "DISCARD" => {
                    self.queued = None;
                    self.dirty = false;
                    RespValue::ok()
                }
                "EXEC" => {
                    let queue = self.queued.take().unwrap_or_default();
                    if std::mem::take(&mut self.dirty) {
                        return error_reply(
                            "EXECABORT Transaction discarded because of previous errors.",
                        );
                    }
                    RespValue::array(queue.iter().map(|cmd| self.run(cmd)).collect())
                }
                v if KNOWN.contains(&v) => {
                    queue.push(args);
                    RespValue::simple_string("QUEUED")
                }
                _ => {
                    self.dirty = true;
                    unknown(&args[0])
                }
            };
        }

        match verb.as_str() {
            "MULTI" => {
                self.queued = Some(Vec::new());
                RespValue::ok()
            }
            "EXEC" => error_reply("ERR EXEC without MULTI"),
            "DISCARD" => error_reply("ERR DISCARD without MULTI"),
            "SLEEP" => {
                let ms: u64 = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(0);
                let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.stats.max_active.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.stats.active.fetch_sub(1, Ordering::SeqCst);
                RespValue::Integer(self.id as i64)
            }
            _ => self.run(&args),
        }
    }

    fn run(&self, args: &[String]) -> RespValue {
        let mut store = self.store.lock().unwrap();
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        match args[0].to_uppercase().as_str() {
            "PING" if args.len() > 1 => RespValue::bulk_string(arg(1)),
            "PING" => RespValue::simple_string("PONG"),
            "ECHO" => RespValue::bulk_string(arg(1)),
            "SET" => {
                store.insert(arg(1), Entry::Str(arg(2)));
                RespValue::ok()
            }
            "GET" => match store.get(&arg(1)) {
                Some(Entry::Str(s)) => RespValue::bulk_string(s.clone()),
                Some(Entry::Hash(_)) => wrong_type(),
                None => RespValue::null_bulk_string(),
            },
            "DEL" => {
                let removed = args[1..].iter().filter(|k| store.remove(*k).is_some()).count();
                RespValue::Integer(removed as i64)
            }
            "INCR" => {
                let current = match store.get(&arg(1)) {
                    Some(Entry::Str(s)) => match s.parse::<i64>() {
                        Ok(n) => n,
                        Err(_) => {
                            return error_reply("ERR value is not an integer or out of range");
                        }
                    },
                    Some(Entry::Hash(_)) => return wrong_type(),
                    None => 0,
                };
                store.insert(arg(1), Entry::Str((current + 1).to_string()));
                RespValue::Integer(current + 1)
            }
            "HSET" => {
                let entry = store
                    .entry(arg(1))
                    .or_insert_with(|| Entry::Hash(Vec::new()));
                let Entry::Hash(fields) = entry else {
                    return wrong_type();
                };
                let mut added = 0;
                for pair in args[2..].chunks(2) {
                    let value = pair.get(1).cloned().unwrap_or_default();
                    match fields.iter_mut().find(|(f, _)| *f == pair[0]) {
                        Some((_, v)) => *v = value,
                        None => {
                            fields.push((pair[0].clone(), value));
                            added += 1;
                        }
                    }
                }
                RespValue::Integer(added)
            }
            "HGETALL" => match store.get(&arg(1)) {
                Some(Entry::Hash(fields)) => RespValue::array(
                    fields
                        .iter()
                        .flat_map(|(f, v)| [RespValue::bulk_string(f.clone()), RespValue::bulk_string(v.clone())])
                        .collect(),
                ),
                Some(Entry::Str(_)) => wrong_type(),
                None => RespValue::array(Vec::new()),
            },
            "CLIENT" if arg(1).eq_ignore_ascii_case("ID") => RespValue::Integer(self.id as i64),
            "SLEEP" => RespValue::Integer(self.id as i64),
            _ => unknown(&args[0]),
        }
    }
}

fn error_reply(message: impl Into<String>) -> RespValue {
    RespValue::Error(message.into())
}

fn unknown(verb: &str) -> RespValue {
    error_reply(format!("ERR unknown command '{verb}'"))
}

fn wrong_type() -> RespValue {
    error_reply("WRONGTYPE Operation against a key holding the wrong kind of value")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
