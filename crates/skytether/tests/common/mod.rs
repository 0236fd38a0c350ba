//! Scriptable fake device used by the end-to-end tests in place of a real
//! vehicle. Binds its own UDP socket, learns the peer address from the first
//! datagram it receives, and lets each test drive the conversation.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::sleep;

pub struct FakeDevice {
    socket: UdpSocket,
    peer: Option<std::net::SocketAddr>,
}

impl FakeDevice {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        Self { socket, peer: None }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    pub async fn recv_line(&mut self) -> String {
        let mut buf = [0u8; 512];
        let (n, addr) = self.socket.recv_from(&mut buf).await.unwrap();
        self.peer = Some(addr);
        String::from_utf8_lossy(&buf[..n]).trim().to_string()
    }

    pub async fn reply(&self, line: &str) {
        let addr = self.peer.expect("no peer learned yet");
        self.socket.send_to(line.as_bytes(), addr).await.unwrap();
    }

    pub async fn reply_after(&self, line: &str, delay_ms: u64) {
        sleep(Duration::from_millis(delay_ms)).await;
        self.reply(line).await;
    }

    /// Send a stray datagram before the real reply, to exercise stale-reply
    /// suppression on the driver side.
    pub async fn inject_stray(&self, line: &str) {
        self.reply(line).await;
    }

    /// Accept the SDK-mode handshake (`command` -> `ok`).
    pub async fn accept_handshake(&mut self) {
        let line = self.recv_line().await;
        assert_eq!(line, "command");
        self.reply("ok").await;
    }
}
