use std::fmt;
use std::net::IpAddr;

/// The immutable identity of one connection, as observed on the TUN
/// device: `src` is the peer that opened the flow, `dst` is this endpoint.
/// Both addresses always belong to the same IP family.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Quad {
    pub src: (IpAddr, u16),
    pub dst: (IpAddr, u16),
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src.0, self.src.1, self.dst.0, self.dst.1
        )
    }
}
