//! The backend tunnel: a unix-stream connection that receives the client
//! socket (as SCM_RIGHTS ancillary data), a fixed-size [`LoginData`]
//! record, and later echoes the record's ack token when the backend has
//! taken over the session.

use crate::dispatcher::DispatchMsg;
use crate::error::{AppResult, GateError};
use crate::login::ID_MAX;
use bytes::{Buf, BufMut, BytesMut};
use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const USERID_FIELD: usize = ID_MAX + 1;
const HOSTIP_FIELD: usize = 16;
const PORT_FIELD: usize = ID_MAX + 1;

/// Total size of the record on the wire.
pub const LOGIN_DATA_SIZE: usize = 4 + 8 + USERID_FIELD + HOSTIP_FIELD + PORT_FIELD + 4 + 4 + 4 + 4;

/// Stream sockets need at least one data byte next to ancillary payloads;
/// this is it.
pub const FD_CARRIER: u8 = 0;

/// The handoff record. Strings are NUL-terminated fixed-width fields,
/// integers native-endian; the leading `cb` is the record size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginData {
    pub ack_token: u64,
    pub userid: String,
    pub host_ip: String,
    pub port: String,
    pub encoding: i32,
    pub client_code: u32,
    pub t_lines: i32,
    pub t_cols: i32,
}

impl LoginData {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(LOGIN_DATA_SIZE);
        buf.put_u32_ne(LOGIN_DATA_SIZE as u32);
        buf.put_u64_ne(self.ack_token);
        put_fixed(&mut buf, &self.userid, USERID_FIELD);
        put_fixed(&mut buf, &self.host_ip, HOSTIP_FIELD);
        put_fixed(&mut buf, &self.port, PORT_FIELD);
        buf.put_i32_ne(self.encoding);
        buf.put_u32_ne(self.client_code);
        buf.put_i32_ne(self.t_lines);
        buf.put_i32_ne(self.t_cols);
        buf
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != LOGIN_DATA_SIZE {
            return None;
        }
        let mut b = raw;
        if b.get_u32_ne() as usize != LOGIN_DATA_SIZE {
            return None;
        }
        Some(Self {
            ack_token: b.get_u64_ne(),
            userid: take_fixed(&mut b, USERID_FIELD),
            host_ip: take_fixed(&mut b, HOSTIP_FIELD),
            port: take_fixed(&mut b, PORT_FIELD),
            encoding: b.get_i32_ne(),
            client_code: b.get_u32_ne(),
            t_lines: b.get_i32_ne(),
            t_cols: b.get_i32_ne(),
        })
    }
}

fn put_fixed(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width - 1);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

fn take_fixed(b: &mut &[u8], width: usize) -> String {
    let field = &b[..width];
    let end = field.iter().position(|&c| c == 0).unwrap_or(width);
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    b.advance(width);
    s
}

/// One live backend connection. Dropping the tunnel detaches its ack
/// reader and closes the stream.
pub struct Tunnel {
    stream: Arc<UnixStream>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Wrap a freshly accepted backend connection. With `ack_tx` set
    /// (async-ack mode) a reader task forwards each token to the
    /// dispatcher mailbox as it arrives.
    pub fn new(stream: UnixStream, generation: u64, ack_tx: Option<mpsc::Sender<DispatchMsg>>) -> Self {
        let stream = Arc::new(stream);
        let reader = ack_tx.map(|tx| tokio::spawn(ack_reader(stream.clone(), generation, tx)));
        Self {
            stream,
            generation,
            reader,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ship the raw client descriptor over the tunnel. The caller keeps
    /// its copy open; the send duplicates the descriptor into the backend.
    pub async fn send_fd(&self, fd: RawFd) -> AppResult<()> {
        let raw = self.stream.as_raw_fd();
        self.stream
            .async_io(Interest::WRITABLE, || {
                let carrier = [FD_CARRIER];
                let iov = [IoSlice::new(&carrier)];
                let fds = [fd];
                let cmsg = [ControlMessage::ScmRights(&fds)];
                sendmsg::<UnixAddr>(raw, &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None)
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))
            })
            .await?;
        Ok(())
    }

    pub async fn send_login_data(&self, ld: &LoginData) -> AppResult<()> {
        let buf = ld.encode();
        let mut off = 0;
        while off < buf.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&buf[off..]) {
                Ok(0) => return Err(GateError::TunnelProtocol("short login data write")),
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Synchronous-mode ack: park here until the backend echoes a token
    /// or the tunnel dies.
    pub async fn read_ack(&self) -> AppResult<u64> {
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            self.stream.readable().await?;
            match self.stream.try_read(&mut buf[filled..]) {
                Ok(0) => return Err(GateError::TunnelProtocol("closed while waiting for ack")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Forward ack tokens until the backend goes away. A zero-length read or
/// any hard error reports the tunnel closed.
async fn ack_reader(stream: Arc<UnixStream>, generation: u64, tx: mpsc::Sender<DispatchMsg>) {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    loop {
        if stream.readable().await.is_err() {
            break;
        }
        match stream.try_read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    filled = 0;
                    let token = u64::from_ne_bytes(buf);
                    if tx
                        .send(DispatchMsg::TunnelAck { generation, token })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(_) => break,
        }
    }
    let _ = tx.send(DispatchMsg::TunnelClosed { generation }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LoginData {
        LoginData {
            ack_token: 0xdead_beef_cafe_0001,
            userid: "alice".into(),
            host_ip: "203.0.113.9".into(),
            port: "3000".into(),
            encoding: 2,
            client_code: 0x811c_9dc5,
            t_lines: 24,
            t_cols: 80,
        }
    }

    #[test]
    fn record_round_trips_at_fixed_size() {
        let ld = sample();
        let wire = ld.encode();
        assert_eq!(wire.len(), LOGIN_DATA_SIZE);
        assert_eq!(LoginData::decode(&wire).unwrap(), ld);
    }

    #[test]
    fn oversize_strings_are_truncated_with_nul_room() {
        let mut ld = sample();
        ld.userid = "averylonguserid".into(); // > ID_MAX
        let wire = ld.encode();
        assert_eq!(wire.len(), LOGIN_DATA_SIZE);
        let back = LoginData::decode(&wire).unwrap();
        assert_eq!(back.userid.len(), USERID_FIELD - 1);
        assert!(ld.userid.starts_with(&back.userid));
    }

    #[test]
    fn decode_rejects_wrong_sizes() {
        let wire = sample().encode();
        assert!(LoginData::decode(&wire[..LOGIN_DATA_SIZE - 1]).is_none());
        let mut bad = wire.to_vec();
        bad[0] ^= 0xff; // corrupt the byte-count header
        assert!(LoginData::decode(&bad).is_none());
    }

    #[tokio::test]
    async fn login_data_crosses_a_socketpair() {
        use tokio::io::AsyncReadExt;

        let (a, b) = UnixStream::pair().unwrap();
        let tunnel = Tunnel::new(a, 1, None);
        tunnel.send_login_data(&sample()).await.unwrap();

        let mut raw = vec![0u8; LOGIN_DATA_SIZE];
        let mut b = b;
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(LoginData::decode(&raw).unwrap(), sample());
    }

    #[tokio::test]
    async fn sync_ack_reads_one_token() {
        use tokio::io::AsyncWriteExt;

        let (a, mut b) = UnixStream::pair().unwrap();
        let tunnel = Tunnel::new(a, 1, None);
        b.write_all(&7u64.to_ne_bytes()).await.unwrap();
        assert_eq!(tunnel.read_ack().await.unwrap(), 7);

        drop(b);
        assert!(tunnel.read_ack().await.is_err());
    }
}
