// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TCP request/reply wrapper around the allocation engine.
//!
//! A deliberately thin shell: one server-side allocator + pool, a
//! thread-per-connection accept loop, and a synchronous client. Nothing in
//! here is part of the engine proper.
//!
//! # Wire Protocol
//!
//! All messages use a length-prefixed binary format:
//!
//! ```text
//! ┌───────────────────┬───────────────────────┬──────────────────┐
//! │  OpCode (1 byte)  │  Length (4 bytes LE)  │  Payload (N)     │
//! └───────────────────┴───────────────────────┴──────────────────┘
//! ```
//!
//! ## OpCodes
//!
//! | Code | Name         | Direction | Payload                    |
//! |------|--------------|-----------|----------------------------|
//! | 0x01 | ALLOCATE     | C→S       | size (8 LE)                |
//! | 0x02 | FREE         | C→S       | addr (8 LE) + size (8 LE)  |
//! | 0x03 | USED_SIZE    | C→S       | —                          |
//! | 0x04 | TOTAL_SIZE   | C→S       | —                          |
//! | 0x05 | MEMORY_USAGE | C→S       | —                          |
//! | 0x06 | STATS        | C→S       | —                          |
//! | 0x07 | PING         | C→S       | —                          |
//! | 0x08 | CLOSE        | C→S       | —                          |
//! |------|--------------|-----------|----------------------------|
//! | 0x80 | OK           | S→C       | —                          |
//! | 0x81 | ERROR        | S→C       | utf-8 message              |
//! | 0x82 | ADDR         | S→C       | addr (8 LE)                |
//! | 0x83 | SIZE         | S→C       | bytes (8 LE)               |
//! | 0x84 | STATS_RESP   | S→C       | JSON                       |
//! | 0x85 | PONG         | S→C       | —                          |

use hsalloc_core::{HybridAllocator, HybridStatsSnapshot, MemoryPool, PoolStatsSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// Wire Protocol Constants
// ============================================================================

/// Request and response opcodes.
mod opcode {
    pub const ALLOCATE: u8 = 0x01;
    pub const FREE: u8 = 0x02;
    pub const USED_SIZE: u8 = 0x03;
    pub const TOTAL_SIZE: u8 = 0x04;
    pub const MEMORY_USAGE: u8 = 0x05;
    pub const STATS: u8 = 0x06;
    pub const PING: u8 = 0x07;
    pub const CLOSE: u8 = 0x08;

    pub const OK: u8 = 0x80;
    pub const ERROR: u8 = 0x81;
    pub const ADDR: u8 = 0x82;
    pub const SIZE: u8 = 0x83;
    pub const STATS_RESP: u8 = 0x84;
    pub const PONG: u8 = 0x85;
}

// Requests and non-stats responses are tiny; this bounds the JSON too.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("server already running")]
    AlreadyRunning,

    #[error("server error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;

// ============================================================================
// Wire Protocol Implementation
// ============================================================================

/// One frame on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    pub fn ok() -> Self {
        Self::new(opcode::OK, vec![])
    }

    pub fn error(msg: &str) -> Self {
        Self::new(opcode::ERROR, msg.as_bytes().to_vec())
    }

    pub fn addr(addr: u64) -> Self {
        Self::new(opcode::ADDR, addr.to_le_bytes().to_vec())
    }

    pub fn size(bytes: u64) -> Self {
        Self::new(opcode::SIZE, bytes.to_le_bytes().to_vec())
    }

    /// Read a message from a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut opcode_buf = [0u8; 1];
        match reader.read_exact(&mut opcode_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RpcError::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        }
        let opcode = opcode_buf[0];

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(RpcError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Self { opcode, payload })
    }

    /// Write a message to a stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.opcode])?;
        writer.write_all(&(self.payload.len() as u32).to_le_bytes())?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn decode_u64(payload: &[u8], at: usize, what: &str) -> Result<u64> {
    payload
        .get(at..at + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| RpcError::Protocol(format!("{what} truncated")))
}

// ============================================================================
// Server Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub start_time: Mutex<Option<Instant>>,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_error: self.requests_error.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            uptime_secs: self
                .start_time
                .lock()
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_error: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_secs: u64,
}

/// Everything the STATS op reports, as one JSON document.
#[derive(Debug, Clone, Serialize)]
pub struct StatsPayload {
    pub server: ServerStatsSnapshot,
    pub pool: PoolStatsSnapshot,
    pub engine: HybridStatsSnapshot,
}

// ============================================================================
// Client Connection Handler
// ============================================================================

struct ClientHandler {
    allocator: Arc<HybridAllocator>,
    pool: Arc<MemoryPool>,
    stream: TcpStream,
    stats: Arc<ServerStats>,
}

impl ClientHandler {
    fn handle(&mut self) -> Result<()> {
        let mut reader = BufReader::new(self.stream.try_clone()?);
        let mut writer = BufWriter::new(self.stream.try_clone()?);

        loop {
            let request = match Message::read_from(&mut reader) {
                Ok(msg) => msg,
                Err(RpcError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            self.stats.requests_total.fetch_add(1, Ordering::Relaxed);
            // 5 bytes of frame header (opcode + length) per message.
            self.stats
                .bytes_received
                .fetch_add((5 + request.payload.len()) as u64, Ordering::Relaxed);

            let response = self.process_request(&request);
            if response.opcode == opcode::ERROR {
                self.stats.requests_error.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.requests_success.fetch_add(1, Ordering::Relaxed);
            }

            self.stats
                .bytes_sent
                .fetch_add((5 + response.payload.len()) as u64, Ordering::Relaxed);
            response.write_to(&mut writer)?;
        }
    }

    fn process_request(&self, request: &Message) -> Message {
        match request.opcode {
            opcode::PING => Message::new(opcode::PONG, vec![]),

            opcode::ALLOCATE => match decode_u64(&request.payload, 0, "ALLOCATE size") {
                Ok(size) => match self.pool.allocate(size) {
                    Ok(addr) => Message::addr(addr),
                    Err(e) => Message::error(&e.to_string()),
                },
                Err(e) => Message::error(&e.to_string()),
            },

            opcode::FREE => {
                let parsed = decode_u64(&request.payload, 0, "FREE addr")
                    .and_then(|addr| decode_u64(&request.payload, 8, "FREE size").map(|s| (addr, s)));
                match parsed {
                    Ok((addr, size)) => match self.pool.free(addr, size) {
                        Ok(()) => Message::ok(),
                        Err(e) => Message::error(&e.to_string()),
                    },
                    Err(e) => Message::error(&e.to_string()),
                }
            }

            opcode::USED_SIZE => Message::size(self.allocator.used_size()),
            opcode::TOTAL_SIZE => Message::size(self.allocator.total_size()),
            opcode::MEMORY_USAGE => Message::size(self.allocator.memory_overhead()),

            opcode::STATS => {
                let payload = StatsPayload {
                    server: self.stats.snapshot(),
                    pool: self.pool.stats().snapshot(),
                    engine: self.allocator.stats(),
                };
                match serde_json::to_vec(&payload) {
                    Ok(json) => Message::new(opcode::STATS_RESP, json),
                    Err(e) => Message::error(&format!("failed to serialize stats: {e}")),
                }
            }

            // Release the server-side pool slots back to the engine.
            // Idempotent: a drained pool has nothing left to return.
            opcode::CLOSE => match self.pool.close() {
                Ok(()) => {
                    self.allocator.close();
                    Message::ok()
                }
                Err(e) => Message::error(&e.to_string()),
            },

            other => Message::error(&RpcError::InvalidOpcode(other).to_string()),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind; port 0 picks an ephemeral port.
    pub bind_addr: String,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4810".to_string(),
            max_connections: 100,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }
}

/// Thread-per-connection TCP server over one allocator + pool.
pub struct AllocServer {
    allocator: Arc<HybridAllocator>,
    pool: Arc<MemoryPool>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AllocServer {
    pub fn new(allocator: Arc<HybridAllocator>, pool: Arc<MemoryPool>, config: ServerConfig) -> Self {
        Self {
            allocator,
            pool,
            config,
            stats: Arc::new(ServerStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            listener_handle: Mutex::new(None),
        }
    }

    /// Bind the listener and flip the running flag; shared by run/start so
    /// the bound address is known before either returns.
    fn bind(&self) -> Result<TcpListener> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyRunning);
        }
        let listener = TcpListener::bind(&self.config.bind_addr)?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        *self.stats.start_time.lock() = Some(Instant::now());
        tracing::info!(addr = %local, "alloc server listening");
        Ok(listener)
    }

    /// Serve connections until stopped (blocking).
    pub fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        serve_loop(
            listener,
            Arc::clone(&self.allocator),
            Arc::clone(&self.pool),
            Arc::clone(&self.stats),
            Arc::clone(&self.running),
            self.config.max_connections,
        );
        Ok(())
    }

    /// Serve connections on a background thread.
    pub fn start(&self) -> Result<()> {
        let listener = self.bind()?;
        let allocator = Arc::clone(&self.allocator);
        let pool = Arc::clone(&self.pool);
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let max_connections = self.config.max_connections;

        let handle = thread::spawn(move || {
            serve_loop(listener, allocator, pool, stats, running, max_connections);
        });
        *self.listener_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the server and join the accept loop.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Wake a blocking accept().
        if let Some(addr) = *self.local_addr.lock() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }
        if let Some(handle) = self.listener_handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for AllocServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(
    listener: TcpListener,
    allocator: Arc<HybridAllocator>,
    pool: Arc<MemoryPool>,
    stats: Arc<ServerStats>,
    running: Arc<AtomicBool>,
    max_connections: usize,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let active = stats.connections_active.load(Ordering::Relaxed);
                if active >= max_connections as u64 {
                    tracing::warn!(%peer, "connection limit reached, rejecting");
                    continue;
                }

                stats.connections_total.fetch_add(1, Ordering::Relaxed);
                stats.connections_active.fetch_add(1, Ordering::Relaxed);

                let allocator = Arc::clone(&allocator);
                let pool = Arc::clone(&pool);
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    let mut handler = ClientHandler {
                        allocator,
                        pool,
                        stream,
                        stats: Arc::clone(&stats),
                    };
                    if let Err(e) = handler.handle() {
                        tracing::warn!(error = %e, "client connection error");
                    }
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "accept error");
                }
                break;
            }
        }
    }
    tracing::info!("alloc server stopped");
}

// ============================================================================
// Client
// ============================================================================

/// Synchronous client; keeps its own map of live allocations.
pub struct AllocClient {
    stream: TcpStream,
    allocated: HashMap<u64, u64>, // addr → size
}

impl AllocClient {
    pub fn connect(addr: impl std::net::ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            allocated: HashMap::new(),
        })
    }

    fn request(&mut self, msg: Message) -> Result<Message> {
        msg.write_to(&mut self.stream)?;
        Message::read_from(&mut self.stream)
    }

    fn expect_u64(&mut self, msg: Message, want: u8) -> Result<u64> {
        let resp = self.request(msg)?;
        match resp.opcode {
            code if code == want => decode_u64(&resp.payload, 0, "u64 response"),
            opcode::ERROR => Err(RpcError::Remote(
                String::from_utf8_lossy(&resp.payload).to_string(),
            )),
            other => Err(RpcError::Protocol(format!("unexpected opcode: {other:#x}"))),
        }
    }

    /// Allocate through the server; records the live range locally.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        let msg = Message::new(opcode::ALLOCATE, size.to_le_bytes().to_vec());
        let addr = self.expect_u64(msg, opcode::ADDR)?;
        self.allocated.insert(addr, size);
        Ok(addr)
    }

    /// Free through the server; drops the local record on success.
    pub fn free(&mut self, addr: u64, size: u64) -> Result<()> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        let resp = self.request(Message::new(opcode::FREE, payload))?;
        match resp.opcode {
            opcode::OK => {
                self.allocated.remove(&addr);
                Ok(())
            }
            opcode::ERROR => Err(RpcError::Remote(
                String::from_utf8_lossy(&resp.payload).to_string(),
            )),
            other => Err(RpcError::Protocol(format!("unexpected opcode: {other:#x}"))),
        }
    }

    pub fn used_size(&mut self) -> Result<u64> {
        self.expect_u64(Message::new(opcode::USED_SIZE, vec![]), opcode::SIZE)
    }

    pub fn total_size(&mut self) -> Result<u64> {
        self.expect_u64(Message::new(opcode::TOTAL_SIZE, vec![]), opcode::SIZE)
    }

    pub fn memory_usage(&mut self) -> Result<u64> {
        self.expect_u64(Message::new(opcode::MEMORY_USAGE, vec![]), opcode::SIZE)
    }

    /// Server-side stats as a JSON document.
    pub fn stats_json(&mut self) -> Result<String> {
        let resp = self.request(Message::new(opcode::STATS, vec![]))?;
        match resp.opcode {
            opcode::STATS_RESP => Ok(String::from_utf8_lossy(&resp.payload).to_string()),
            opcode::ERROR => Err(RpcError::Remote(
                String::from_utf8_lossy(&resp.payload).to_string(),
            )),
            other => Err(RpcError::Protocol(format!("unexpected opcode: {other:#x}"))),
        }
    }

    pub fn ping(&mut self) -> Result<Duration> {
        let start = Instant::now();
        let resp = self.request(Message::new(opcode::PING, vec![]))?;
        if resp.opcode != opcode::PONG {
            return Err(RpcError::Protocol("expected PONG".into()));
        }
        Ok(start.elapsed())
    }

    /// Release the server-side pool, returning every pre-reserved slot to
    /// the engine.
    pub fn close(&mut self) -> Result<()> {
        let resp = self.request(Message::new(opcode::CLOSE, vec![]))?;
        match resp.opcode {
            opcode::OK => Ok(()),
            opcode::ERROR => Err(RpcError::Remote(
                String::from_utf8_lossy(&resp.payload).to_string(),
            )),
            other => Err(RpcError::Protocol(format!("unexpected opcode: {other:#x}"))),
        }
    }

    /// Ranges this client allocated and has not yet freed.
    pub fn live(&self) -> &HashMap<u64, u64> {
        &self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsalloc_core::{AllocatorConfig, PoolConfig};

    fn test_server() -> AllocServer {
        let allocator = Arc::new(HybridAllocator::new(
            &AllocatorConfig::default().with_max_order(8).with_tracking(true),
        ));
        let pool = Arc::new(
            MemoryPool::new(
                Arc::clone(&allocator),
                &PoolConfig::default()
                    .with_slot_counts(64, 16, 4)
                    .with_seed(11),
            )
            .unwrap(),
        );
        AllocServer::new(allocator, pool, ServerConfig::default().with_bind_addr("127.0.0.1:0"))
    }

    #[test]
    fn test_message_round_trip() {
        let msg = Message::new(opcode::FREE, vec![1, 2, 3, 4]);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();

        let decoded = Message::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.opcode, opcode::FREE);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_allocate_free_over_rpc() {
        let server = test_server();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = AllocClient::connect(addr).unwrap();
        client.ping().unwrap();

        let total = client.total_size().unwrap();
        assert_eq!(total, 256 * 1024 * 1024);

        let a = client.allocate(8192).unwrap();
        assert_eq!(client.live().len(), 1);
        assert!(client.used_size().unwrap() > 0);

        client.free(a, 8192).unwrap();
        assert!(client.live().is_empty());

        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_remote_error_surfaces() {
        let server = test_server();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = AllocClient::connect(addr).unwrap();
        let err = client.free(0xdead_beef, 8192).unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)), "got {err:?}");

        server.stop();
    }

    #[test]
    fn test_stats_json() {
        let server = test_server();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = AllocClient::connect(addr).unwrap();
        let a = client.allocate(4096).unwrap();
        let json = client.stats_json().unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["pool"]["total_allocations"].as_u64().unwrap() >= 1);
        assert!(parsed["engine"]["used_bytes"].as_u64().unwrap() > 0);

        client.free(a, 4096).unwrap();
        server.stop();
    }

    #[test]
    fn test_concurrent_clients() {
        let server = test_server();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(thread::spawn(move || {
                let mut client = AllocClient::connect(addr).unwrap();
                for _ in 0..50 {
                    let a = client.allocate(4096).unwrap();
                    client.free(a, 4096).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = server.stats();
        assert_eq!(stats.connections_total, 4);
        assert_eq!(stats.requests_total, 400);
        // Every request is a 5-byte header plus an 8- or 16-byte payload.
        assert!(stats.bytes_received >= 400 * (5 + 8));
        assert!(stats.bytes_sent >= 400 * 5);

        server.stop();
    }

    #[test]
    fn test_close_releases_server_pool() {
        let server = test_server();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = AllocClient::connect(addr).unwrap();
        assert!(client.used_size().unwrap() > 0);

        client.close().unwrap();
        assert_eq!(client.used_size().unwrap(), 0);

        // The engine still serves requests; they just miss the drained pool.
        let a = client.allocate(8192).unwrap();
        client.free(a, 8192).unwrap();
        assert_eq!(client.used_size().unwrap(), 0);

        // Closing again is a no-op.
        client.close().unwrap();

        server.stop();
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let server = test_server();
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        Message::new(0x7F, vec![]).write_to(&mut stream).unwrap();
        let resp = Message::read_from(&mut stream).unwrap();

        assert_eq!(resp.opcode, opcode::ERROR);
        let msg = String::from_utf8_lossy(&resp.payload);
        assert!(msg.contains("invalid opcode"), "got {msg:?}");

        server.stop();
    }
}
