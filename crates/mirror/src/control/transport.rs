//! Datagram plumbing under the control: a nonblocking UDP socket, an
//! in-process channel transport for tests and local sessions, or both at
//! once. Both share the same framing, so a control never cares which one a
//! frame came from.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::address::Endpoint;
use crate::error::{Error, Result};

use super::packet::MAX_PACKET_SIZE;

/// Wildcard control id: accepted by every control, used before the remote
/// id is known and for discovery.
pub(crate) const CONTROL_ID_ANY: u8 = 0;

/// One frame on the in-process transport.
struct LocalFrame {
    from: Endpoint,
    data: Vec<u8>,
}

/// Process-wide port table for the local transport.
fn local_ports() -> &'static Mutex<HashMap<u16, Sender<LocalFrame>>> {
    static PORTS: OnceLock<Mutex<HashMap<u16, Sender<LocalFrame>>>> = OnceLock::new();
    PORTS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) struct Transport {
    udp: Option<UdpSocket>,
    local: Option<(u16, Receiver<LocalFrame>)>,
    /// Width of the leading control-id field; 0 disables multiplexing.
    id_bits: u8,
    local_id: u8,
}

impl Transport {
    pub fn bind(udp_port: Option<u16>, local_port: Option<u16>, id_bits: u8, local_id: u8) -> Result<Self> {
        let udp = match udp_port {
            Some(port) => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
                socket.set_nonblocking(true)?;
                Some(socket)
            }
            None => None,
        };
        let local = match local_port {
            Some(port) => {
                let mut ports = local_ports().lock().unwrap();
                // A dead sender means the previous owner dropped without the
                // map entry being cleaned up yet.
                if ports.get(&port).is_some_and(|tx| {
                    tx.send(LocalFrame {
                        from: Endpoint::Local(0),
                        data: Vec::new(),
                    })
                    .is_ok()
                }) {
                    return Err(Error::PortInUse(port));
                }
                let (tx, rx) = mpsc::channel();
                ports.insert(port, tx);
                Some((port, rx))
            }
            None => None,
        };
        Ok(Self {
            udp,
            local,
            id_bits,
            local_id,
        })
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local.as_ref().map(|(port, _)| *port)
    }

    fn frame(&self, remote_id: u8, payload: &[u8]) -> Vec<u8> {
        if self.id_bits == 0 {
            return payload.to_vec();
        }
        let mask = ((1u16 << self.id_bits) - 1) as u8;
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(remote_id & mask);
        out.extend_from_slice(payload);
        out
    }

    pub fn send(&self, to: Endpoint, remote_id: u8, payload: &[u8]) -> Result<()> {
        let frame = self.frame(remote_id, payload);
        match to {
            Endpoint::Udp(addr) => {
                let socket = self
                    .udp
                    .as_ref()
                    .ok_or_else(|| Error::InvalidAddress("no udp transport bound".into()))?;
                socket.send_to(&frame, addr)?;
            }
            Endpoint::Local(port) => {
                let own = self
                    .local_port()
                    .ok_or_else(|| Error::InvalidAddress("no local transport bound".into()))?;
                let from = Endpoint::Local(own);
                let ports = local_ports().lock().unwrap();
                let tx = ports
                    .get(&port)
                    .ok_or_else(|| Error::InvalidAddress(format!("local port {port} not open")))?;
                // Peer teardown races look like loss, which is fine.
                let _ = tx.send(LocalFrame {
                    from,
                    data: frame,
                });
            }
        }
        Ok(())
    }

    /// Connectionless discovery fan-out on `port`, both transports.
    pub fn broadcast(&self, port: u16, payload: &[u8]) -> Result<()> {
        let frame = self.frame(CONTROL_ID_ANY, payload);
        if let Some(socket) = &self.udp {
            socket.set_broadcast(true)?;
            socket.send_to(&frame, (Ipv4Addr::BROADCAST, port))?;
        }
        if let Some((own_port, _)) = &self.local {
            let ports = local_ports().lock().unwrap();
            for (target, tx) in ports.iter() {
                if *target == *own_port {
                    continue;
                }
                let _ = tx.send(LocalFrame {
                    from: Endpoint::Local(*own_port),
                    data: frame.clone(),
                });
            }
        }
        Ok(())
    }

    /// One frame, id-prefix stripped and checked. `None` when nothing is
    /// pending.
    pub fn recv(&mut self) -> Option<(Endpoint, Vec<u8>)> {
        let mut buf = [0u8; MAX_PACKET_SIZE + 1];
        if let Some(socket) = &self.udp {
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        if let Some(data) = self.accept(&buf[..len]) {
                            return Some((Endpoint::Udp(from), data));
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        if let Some((_, rx)) = &self.local {
            while let Ok(frame) = rx.try_recv() {
                if frame.data.is_empty() {
                    continue;
                }
                if let Some(data) = self.accept(&frame.data) {
                    return Some((frame.from, data));
                }
            }
        }
        None
    }

    /// Poll until a frame arrives or `timeout` passes. The only blocking
    /// point in the whole stack.
    pub fn recv_wait(&mut self, timeout: Duration) -> Option<(Endpoint, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.recv() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn accept(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.id_bits == 0 {
            return Some(frame.to_vec());
        }
        let (&id, rest) = frame.split_first()?;
        let mask = ((1u16 << self.id_bits) - 1) as u8;
        let id = id & mask;
        (id == self.local_id || id == CONTROL_ID_ANY).then(|| rest.to_vec())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some((port, _)) = &self.local {
            local_ports().lock().unwrap().remove(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_round_trip() {
        let mut a = Transport::bind(None, Some(9001), 0, 0).unwrap();
        let b = Transport::bind(None, Some(9002), 0, 0).unwrap();
        b.send(Endpoint::Local(9001), 0, &[1, 2, 3]).unwrap();
        let (from, data) = a.recv_wait(Duration::from_millis(200)).unwrap();
        assert_eq!(from, Endpoint::Local(9002));
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn local_port_collision_rejected() {
        let _a = Transport::bind(None, Some(9010), 0, 0).unwrap();
        assert!(matches!(
            Transport::bind(None, Some(9010), 0, 0),
            Err(Error::PortInUse(9010))
        ));
    }

    #[test]
    fn port_freed_on_drop() {
        {
            let _a = Transport::bind(None, Some(9020), 0, 0).unwrap();
        }
        assert!(Transport::bind(None, Some(9020), 0, 0).is_ok());
    }

    #[test]
    fn id_prefix_filters_foreign_controls() {
        let mut a = Transport::bind(None, Some(9030), 4, 3).unwrap();
        let b = Transport::bind(None, Some(9031), 4, 5).unwrap();

        b.send(Endpoint::Local(9030), 7, &[9]).unwrap();
        assert!(a.recv_wait(Duration::from_millis(50)).is_none());

        b.send(Endpoint::Local(9030), 3, &[9]).unwrap();
        let (_, data) = a.recv_wait(Duration::from_millis(200)).unwrap();
        assert_eq!(data, vec![9]);

        // Wildcard id reaches everyone.
        b.send(Endpoint::Local(9030), CONTROL_ID_ANY, &[4]).unwrap();
        assert!(a.recv_wait(Duration::from_millis(200)).is_some());
    }

    #[test]
    fn local_broadcast_reaches_other_ports() {
        let a = Transport::bind(None, Some(9040), 0, 0).unwrap();
        let mut b = Transport::bind(None, Some(9041), 0, 0).unwrap();
        let mut c = Transport::bind(None, Some(9042), 0, 0).unwrap();
        a.broadcast(0, &[8]).unwrap();
        assert!(b.recv_wait(Duration::from_millis(200)).is_some());
        assert!(c.recv_wait(Duration::from_millis(200)).is_some());
    }

    #[test]
    fn udp_round_trip() {
        let a = Transport::bind(Some(0), None, 0, 0).unwrap();
        let mut b = Transport::bind(Some(0), None, 0, 0).unwrap();
        let b_port = b.udp_addr().unwrap().port();
        let dest = Endpoint::Udp(SocketAddr::from((Ipv4Addr::LOCALHOST, b_port)));
        a.send(dest, 0, &[5, 6]).unwrap();
        let (_, data) = b.recv_wait(Duration::from_millis(500)).unwrap();
        assert_eq!(data, vec![5, 6]);
    }
}
