//! Shared integration-test harness: a real gateway serving `MemoryDb` on an
//! ephemeral port, plus a minimal WebSocket client good enough to exercise
//! the session protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use docgate::{Database, Gateway, GatewayConfig, MemoryDb};

/// A running gateway over a fresh in-memory database.
///
/// Shuts down on drop.
pub struct TestGateway {
    pub gateway: Gateway,
    pub db: Arc<MemoryDb>,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
}

impl TestGateway {
    /// Starts a gateway with the default test config after applying `tweak`.
    pub fn start(tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let mut config = GatewayConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..GatewayConfig::default()
        };
        tweak(&mut config);

        let db = Arc::new(MemoryDb::new());
        let gateway = Gateway::new(Arc::clone(&db) as Arc<dyn Database>, config)
            .expect("gateway must be enabled in tests");
        gateway.start().expect("gateway failed to start");
        let addr = gateway.local_addr().expect("no bound address after start");

        Self {
            gateway,
            db,
            addr,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.gateway.shutdown();
    }
}

// ============================================================================
// WebSocket test client
// ============================================================================

/// Hand-rolled WebSocket client: one masked text/binary/close frame at a
/// time, no fragmentation, no extensions. Enough to drive the session
/// protocol without pulling a client stack into the dev-dependencies.
pub struct WsClient {
    stream: TcpStream,
}

/// Fixed masking key; the mask only has to be present, not unpredictable,
/// for a test client.
const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

impl WsClient {
    /// Performs the upgrade handshake. Returns the client on a 101, or the
    /// HTTP status the gateway answered instead.
    pub async fn connect(
        addr: SocketAddr,
        path: &str,
        protocol: &str,
        token: Option<&str>,
    ) -> Result<Self, u16> {
        let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
        let token_header = token
            .map(|t| format!("X-Access-Token: {t}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Protocol: {protocol}\r\n\
             {token_header}\r\n"
        );
        stream.write_all(request.as_bytes()).await.expect("send upgrade");

        let head = read_response_head(&mut stream).await;
        let status: u16 = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status line");
        if status == 101 {
            Ok(Self { stream })
        } else {
            Err(status)
        }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send_frame(0x1, text.as_bytes()).await;
    }

    pub async fn send_binary(&mut self, payload: &[u8]) {
        self.send_frame(0x2, payload).await;
    }

    pub async fn send_close(&mut self) {
        self.send_frame(0x8, &[]).await;
    }

    async fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = vec![0x80 | opcode];
        match payload.len() {
            len @ 0..=125 => frame.push(0x80 | u8::try_from(len).unwrap()),
            len @ 126..=65535 => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&u16::try_from(len).unwrap().to_be_bytes());
            }
            len => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(&MASK);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ MASK[i % MASK.len()]),
        );
        self.stream.write_all(&frame).await.expect("send frame");
    }

    /// Reads the next text frame. `None` on a close frame or a dropped
    /// connection. Control frames other than close are skipped.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            let mut header = [0u8; 2];
            self.stream.read_exact(&mut header).await.ok()?;
            let opcode = header[0] & 0x0f;
            let len = match header[1] & 0x7f {
                126 => {
                    let mut ext = [0u8; 2];
                    self.stream.read_exact(&mut ext).await.ok()?;
                    u64::from(u16::from_be_bytes(ext))
                }
                127 => {
                    let mut ext = [0u8; 8];
                    self.stream.read_exact(&mut ext).await.ok()?;
                    u64::from_be_bytes(ext)
                }
                len => u64::from(len),
            };
            let mut payload = vec![0u8; usize::try_from(len).unwrap()];
            self.stream.read_exact(&mut payload).await.ok()?;
            match opcode {
                0x1 => return Some(String::from_utf8(payload).expect("non-UTF-8 text frame")),
                0x8 => return None,
                // Ping/pong and anything else is ignored by the tests.
                _ => {}
            }
        }
    }
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("response head");
        head.push(byte[0]);
        assert!(head.len() < 64 * 1024, "unterminated response head");
    }
    String::from_utf8(head).expect("non-UTF-8 response head")
}
