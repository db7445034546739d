use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::net::SocketAddr;
use tracing::debug;
use tracing::warn;

/// The global ip probe always talks to this port.
pub const GLOBAL_IP_PORT: u16 = 443;
/// Unprivileged source ports, [1025...65536).
pub const SRC_PORT_MIN: u16 = 1025;
pub const SRC_PORT_MAX: u16 = 65535;

/// Anomalous segment variants the helper knows how to craft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Only used on the wire, tells the helper to exit.
    Quit = 0,
    GlobalIp = 1,
    AckOnly = 2,
    UrgOnly = 3,
    AckUrg = 4,
    PlainUrg = 5,
    AckChecksumIncorrect = 6,
    AckChecksum = 7,
    UrgUrg = 8,
    UrgChecksum = 9,
    UrgChecksumIncorrect = 10,
    ReservedSyn = 11,
    ReservedEst = 12,
    AckChecksumIncorrectSeq = 13,
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One entry of the variant catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    pub name: &'static str,
    pub opcode: Opcode,
    pub extra: Option<u32>,
}

impl Variant {
    const fn new(name: &'static str, opcode: Opcode, extra: Option<u32>) -> Variant {
        Variant {
            name,
            opcode,
            extra,
        }
    }
}

pub const BASE_VARIANTS: [Variant; 12] = [
    Variant::new("ACK-only", Opcode::AckOnly, None),
    Variant::new("URG-only", Opcode::UrgOnly, None),
    Variant::new("ACK-checksum-incorrect", Opcode::AckChecksumIncorrect, None),
    Variant::new("ACK-checksum", Opcode::AckChecksum, None),
    Variant::new("URG-checksum", Opcode::UrgChecksum, None),
    Variant::new("URG-checksum-incorrect", Opcode::UrgChecksumIncorrect, None),
    // extra is the reserved bit pattern
    Variant::new("Reserved-syn", Opcode::ReservedSyn, Some(1)),
    Variant::new("Reserved-syn", Opcode::ReservedSyn, Some(2)),
    Variant::new("Reserved-syn", Opcode::ReservedSyn, Some(4)),
    Variant::new("Reserved-est", Opcode::ReservedEst, Some(1)),
    Variant::new("Reserved-est", Opcode::ReservedEst, Some(2)),
    Variant::new("Reserved-est", Opcode::ReservedEst, Some(4)),
];

pub const EXTENDED_VARIANTS: [Variant; 6] = [
    Variant::new("plain-URG", Opcode::PlainUrg, None),
    Variant::new("ACK-URG", Opcode::AckUrg, None),
    Variant::new("URG-URG", Opcode::UrgUrg, None),
    Variant::new("Reserved-syn", Opcode::ReservedSyn, Some(8)),
    Variant::new("Reserved-est", Opcode::ReservedEst, Some(8)),
    Variant::new(
        "ACK-checksum-incorrect-seq",
        Opcode::AckChecksumIncorrectSeq,
        None,
    ),
];

/// Returns the variant catalog, optionally with the extended variants appended.
pub fn variant_catalog(extended: bool) -> Vec<Variant> {
    let mut catalog = BASE_VARIANTS.to_vec();
    if extended {
        catalog.extend_from_slice(&EXTENDED_VARIANTS);
    }
    catalog
}

/// One planned probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub name: String,
    pub opcode: Opcode,
    pub extra: Option<u32>,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    /// Our endpoint as the remote peer saw it, known once the global ip probe succeeded.
    pub observed_source: Option<SocketAddr>,
}

impl ProbeSpec {
    pub fn new(
        variant: &Variant,
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
    ) -> ProbeSpec {
        ProbeSpec {
            name: variant.name.to_string(),
            opcode: variant.opcode,
            extra: variant.extra,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            observed_source: None,
        }
    }
}

impl fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let extra = match self.extra {
            Some(e) => format!("({})", e),
            None => String::new(),
        };
        write!(
            f,
            "{}{} [{}] {} -> {}",
            self.name,
            extra,
            self.opcode.code(),
            SocketAddr::new(self.src_addr, self.src_port),
            SocketAddr::new(self.dst_addr, self.dst_port)
        )
    }
}

/// Returns a random unprivileged source port.
pub fn random_src_port<R: Rng>(rng: &mut R) -> u16 {
    rng.gen_range(SRC_PORT_MIN..=SRC_PORT_MAX)
}

/// Build the ordered probe matrix.
/// The global ip probe comes first, then variant x port x local address.
pub fn build_matrix<R: Rng>(
    server_addr: IpAddr,
    server_ports: &[u16],
    local_addrs: &[IpAddr],
    variants: &[Variant],
    rng: &mut R,
) -> Vec<ProbeSpec> {
    let first_local = match local_addrs.first() {
        Some(a) => *a,
        None => {
            warn!("no local address to probe from, empty matrix");
            return Vec::new();
        }
    };

    let total = 1 + variants.len() * server_ports.len() * local_addrs.len();
    let mut matrix = Vec::with_capacity(total);
    let global_ip = Variant::new("GlobalIP", Opcode::GlobalIp, None);
    matrix.push(ProbeSpec::new(
        &global_ip,
        first_local,
        random_src_port(rng),
        server_addr,
        GLOBAL_IP_PORT,
    ));

    for variant in variants {
        for dst_port in server_ports {
            for local_addr in local_addrs {
                let src_port = random_src_port(rng);
                matrix.push(ProbeSpec::new(
                    variant,
                    *local_addr,
                    src_port,
                    server_addr,
                    *dst_port,
                ));
            }
        }
    }
    debug!("{} tests selected", matrix.len());
    matrix
}
