//! Captive DNS: every A question is answered with the access point address.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::*;

use crate::http::Listener;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const TTL_SECS: u32 = 60;

/// Builds the reply to `query`, or `None` when it should be dropped.
pub fn answer(query: &[u8], ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([query[2], query[3]]);
    let is_response = flags & 0x8000 != 0;
    let opcode = (flags >> 11) & 0x0f;
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if is_response || opcode != 0 || qdcount == 0 {
        return None;
    }

    // First question only: labels up to the root, then type and class.
    let mut pos = HEADER_LEN;
    loop {
        let len = *query.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xc0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
    let qtype = u16::from_be_bytes([*query.get(pos)?, *query.get(pos + 1)?]);
    let qclass = u16::from_be_bytes([*query.get(pos + 2)?, *query.get(pos + 3)?]);
    let question_end = pos + 4;

    let answers = u16::from((qtype == TYPE_A || qtype == TYPE_ANY) && qclass == CLASS_IN);
    let rd = flags & 0x0100;

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[0..2]);
    reply.extend_from_slice(&(0x8400 | rd).to_be_bytes());
    reply.extend_from_slice(&1u16.to_be_bytes());
    reply.extend_from_slice(&answers.to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&query[HEADER_LEN..question_end]);
    if answers == 1 {
        reply.extend_from_slice(&[0xc0, 0x0c]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&TTL_SECS.to_be_bytes());
        reply.extend_from_slice(&4u16.to_be_bytes());
        reply.extend_from_slice(&ip.octets());
    }
    Some(reply)
}

/// Responder thread bound to UDP `port`. Stops when closed or dropped.
pub struct CaptiveDns {
    local: SocketAddr,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptiveDns {
    pub fn start(ip: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        let local = socket.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let flag = stop.clone();
        let worker = thread::Builder::new()
            .name("captive-dns".into())
            .spawn(move || serve(socket, ip, flag))?;
        info!("dns: answering on {} with {}", local, ip);
        Ok(Self {
            local,
            stop,
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

fn serve(socket: UdpSocket, ip: Ipv4Addr, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 512];
    while !stop.load(Ordering::Acquire) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                warn!("dns: receive failed: {}", e);
                continue;
            }
        };
        if let Some(reply) = answer(&buf[..len], ip) {
            if let Err(e) = socket.send_to(&reply, peer) {
                debug!("dns: reply to {} failed: {}", peer, e);
            }
        }
    }
}

impl Drop for CaptiveDns {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Listener for CaptiveDns {
    fn close(self: Box<Self>) {
        info!("dns: stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut q = vec![0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&qtype.to_be_bytes());
        q.extend_from_slice(&CLASS_IN.to_be_bytes());
        q
    }

    #[test]
    fn a_query_points_at_access_point() {
        let q = query("connectivitycheck.gstatic.com", TYPE_A);
        let reply = answer(&q, AP).unwrap();
        assert_eq!(&reply[0..2], &[0xab, 0xcd]);
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), 0x8500);
        assert_eq!(&reply[6..8], &[0, 1]);
        assert_eq!(&reply[HEADER_LEN..q.len()], &q[HEADER_LEN..]);
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 4, 1]);
        assert_eq!(reply.len(), q.len() + 16);
    }

    #[test]
    fn other_types_get_empty_answer() {
        let reply = answer(&query("example.com", 28), AP).unwrap();
        assert_eq!(&reply[6..8], &[0, 0]);
    }

    #[test]
    fn malformed_packets_are_dropped() {
        assert_eq!(answer(&[0; 5], AP), None);
        let mut q = query("example.com", TYPE_A);
        q.truncate(q.len() - 3);
        assert_eq!(answer(&q, AP), None);
        let mut response = query("example.com", TYPE_A);
        response[2] |= 0x80;
        assert_eq!(answer(&response, AP), None);
    }

    #[test]
    fn responder_answers_over_udp() {
        let dns = CaptiveDns::start(AP, 0).unwrap();
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, dns.local_addr().port()));
        client.send_to(&query("apple.com", TYPE_A), target).unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[len - 4..len], &AP.octets());
        Box::new(dns).close();
    }
}
