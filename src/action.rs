use peer::{Peer, PeerPool};

/// The direction bytes flow in a `Transfer`: `Get` pulls bytes from the
/// server to the client, `Put` pushes them from client to server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Get,
    Put,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            TransferKind::Get => "GET",
            TransferKind::Put => "PUT",
        }
    }
}

/// The single transport this core speaks. The schema reserves `udp`,
/// `pipe`, and `socketpair` (see Non-goals); the loader rejects them
/// before a `Graph` is ever produced, so `Protocol` has one inhabitant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

/// A vertex payload: one scheduled behavior.
#[derive(Clone, Debug)]
pub enum Action {
    Start {
        time_s: u64,
        server_port: u16,
        peers: PeerPool,
        socks_proxy: Option<Peer>,
    },
    End {
        time_s: u64,
        count: u64,
        size_bytes: u64,
    },
    Pause {
        time_s: u64,
    },
    Synchronize,
    Transfer {
        kind: TransferKind,
        protocol: Protocol,
        size_bytes: u64,
        peers: Option<PeerPool>,
    },
}

impl Action {
    pub fn is_start(&self) -> bool {
        matches!(*self, Action::Start { .. })
    }
}
