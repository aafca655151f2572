use rand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::str::FromStr;

use error::TgenError;

/// A `(IPv4, port)` endpoint. Immutable after construction, matching §3:
/// the address is kept in network order and the port in host order so
/// that equality and hashing agree with the wire representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    address: u32,
    port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer {
            address: u32::from(ip),
            port: port,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port)
    }
}

impl FromStr for Peer {
    type Err = TgenError;

    fn from_str(s: &str) -> Result<Peer, TgenError> {
        let mut parts = s.rsplitn(2, ':');
        let port = parts
            .next()
            .ok_or_else(|| TgenError::Graph(format!("missing port in peer '{}'", s)))?;
        let host = parts
            .next()
            .ok_or_else(|| TgenError::Graph(format!("missing host in peer '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TgenError::Graph(format!("invalid port in peer '{}'", s)))?;
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| TgenError::Graph(format!("invalid IPv4 address in peer '{}'", s)))?;
        Ok(Peer::new(ip, port))
    }
}

/// A shuffle-ordered, reference-counted collection of peers.
///
/// `Clone` is the `ref` operation and `Drop` is `unref`: the last clone
/// to be dropped frees the backing `Vec`. Duplicates are kept (the graph
/// may list the same peer twice, which is treated as a selection weight)
/// and no iteration order is promised to callers.
#[derive(Clone)]
pub struct PeerPool(Rc<RefCell<Vec<Peer>>>);

impl PeerPool {
    pub fn new() -> PeerPool {
        PeerPool(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn add(&self, peer: Peer) {
        self.0.borrow_mut().push(peer);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn choose_random<R: Rng>(&self, rng: &mut R) -> Result<Peer, TgenError> {
        let peers = self.0.borrow();
        if peers.is_empty() {
            return Err(TgenError::Pool);
        }
        let idx = rng.gen_range(0, peers.len());
        Ok(peers[idx])
    }
}

impl Default for PeerPool {
    fn default() -> PeerPool {
        PeerPool::new()
    }
}

impl fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PeerPool").field(&self.0.borrow().len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand;

    #[test]
    fn parses_host_port() {
        let p: Peer = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(p.ip(), Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(p.port(), 9000);
    }

    #[test]
    fn rejects_malformed_peer() {
        assert!("not-a-peer".parse::<Peer>().is_err());
        assert!("127.0.0.1".parse::<Peer>().is_err());
        assert!("127.0.0.1:notaport".parse::<Peer>().is_err());
    }

    #[test]
    fn empty_pool_errs() {
        let pool = PeerPool::new();
        let mut rng = rand::thread_rng();
        assert!(pool.choose_random(&mut rng).is_err());
    }

    #[test]
    fn choose_random_picks_member() {
        let pool = PeerPool::new();
        let a: Peer = "10.0.0.1:1".parse().unwrap();
        let b: Peer = "10.0.0.2:2".parse().unwrap();
        pool.add(a);
        pool.add(b);
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let chosen = pool.choose_random(&mut rng).unwrap();
            assert!(chosen == a || chosen == b);
        }
    }

    #[test]
    fn ref_counting_via_clone() {
        let pool = PeerPool::new();
        pool.add("10.0.0.1:1".parse().unwrap());
        let pool2 = pool.clone();
        assert_eq!(pool.len(), pool2.len());
        pool2.add("10.0.0.2:2".parse().unwrap());
        assert_eq!(pool.len(), 2, "clones share the same backing pool");
    }
}
