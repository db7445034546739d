//! Framing between us and the packet-crafting helper.
//!
//! Every frame is a big-endian u32 body length followed by the body.
//! Request body: version, sequence (u32), opcode, extra (u32), address family
//! (4 or 6), source address, source port, destination address, destination port.
//! Response body: sequence of the request it answers, success flag,
//! payload length (u16), payload.
use std::io::Read;
use std::io::Write;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;

use crate::error::TamperError;
use crate::matrix::Opcode;

pub const WIRE_VERSION: u8 = 1;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    pub seq: u32,
    pub opcode: u8,
    pub extra: u32,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl WireRequest {
    pub fn new(
        opcode: Opcode,
        extra: u32,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<WireRequest, TamperError> {
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(TamperError::AddressFamilyMismatch {
                src: src.ip(),
                dst: dst.ip(),
            });
        }
        Ok(WireRequest {
            seq: 0,
            opcode: opcode.code(),
            extra,
            src,
            dst,
        })
    }
    /// Tells the helper to exit, the endpoints are ignored.
    pub fn quit() -> WireRequest {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        WireRequest {
            seq: 0,
            opcode: Opcode::Quit.code(),
            extra: 0,
            src: any,
            dst: any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub seq: u32,
    pub success: bool,
    pub payload: Option<Vec<u8>>,
}

impl WireResponse {
    pub fn new(seq: u32, success: bool, payload: Option<Vec<u8>>) -> WireResponse {
        WireResponse {
            seq,
            success,
            payload,
        }
    }
}

fn push_addr(buff: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => buff.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buff.extend_from_slice(&ip.octets()),
    }
    buff.extend_from_slice(&addr.port().to_be_bytes());
}

pub fn encode_request(req: &WireRequest) -> Vec<u8> {
    let mut body = Vec::with_capacity(48);
    body.push(WIRE_VERSION);
    body.extend_from_slice(&req.seq.to_be_bytes());
    body.push(req.opcode);
    body.extend_from_slice(&req.extra.to_be_bytes());
    body.push(if req.src.is_ipv4() { 4 } else { 6 });
    push_addr(&mut body, &req.src);
    push_addr(&mut body, &req.dst);
    body
}

pub fn encode_response(resp: &WireResponse) -> Result<Vec<u8>, TamperError> {
    let payload: &[u8] = match &resp.payload {
        Some(p) => p,
        None => &[],
    };
    if payload.len() > u16::MAX as usize {
        return Err(TamperError::FrameTooLarge {
            len: payload.len(),
            max: u16::MAX as usize,
        });
    }
    let mut body = Vec::with_capacity(7 + payload.len());
    body.extend_from_slice(&resp.seq.to_be_bytes());
    body.push(resp.success as u8);
    body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    body.extend_from_slice(payload);
    Ok(body)
}

fn malformed(reason: &str) -> TamperError {
    TamperError::MalformedFrame {
        reason: reason.to_string(),
    }
}

struct Cursor<'a> {
    buff: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TamperError> {
        if self.buff.len() - self.pos < n {
            return Err(malformed("truncated body"));
        }
        let s = &self.buff[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u8(&mut self) -> Result<u8, TamperError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, TamperError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32, TamperError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn addr(&mut self, family: u8) -> Result<SocketAddr, TamperError> {
        let ip = match family {
            4 => {
                let b = self.take(4)?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(malformed("unknown address family")),
        };
        let port = self.u16()?;
        Ok(SocketAddr::new(ip, port))
    }
    fn finish(&self) -> Result<(), TamperError> {
        if self.pos != self.buff.len() {
            return Err(malformed("trailing bytes"));
        }
        Ok(())
    }
}

pub fn decode_request(body: &[u8]) -> Result<WireRequest, TamperError> {
    let mut c = Cursor { buff: body, pos: 0 };
    if c.u8()? != WIRE_VERSION {
        return Err(malformed("unsupported version"));
    }
    let seq = c.u32()?;
    let opcode = c.u8()?;
    let extra = c.u32()?;
    let family = c.u8()?;
    let src = c.addr(family)?;
    let dst = c.addr(family)?;
    c.finish()?;
    Ok(WireRequest {
        seq,
        opcode,
        extra,
        src,
        dst,
    })
}

pub fn decode_response(body: &[u8]) -> Result<WireResponse, TamperError> {
    let mut c = Cursor { buff: body, pos: 0 };
    let seq = c.u32()?;
    let success = match c.u8()? {
        0 => false,
        1 => true,
        _ => return Err(malformed("bad success flag")),
    };
    let len = c.u16()? as usize;
    let payload = c.take(len)?;
    c.finish()?;
    let payload = if payload.is_empty() {
        None
    } else {
        Some(payload.to_vec())
    };
    Ok(WireResponse {
        seq,
        success,
        payload,
    })
}

pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> Result<(), TamperError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(TamperError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, TamperError> {
    let mut len_buff = [0u8; 4];
    match r.read_exact(&mut len_buff) {
        Ok(_) => (),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TamperError::ChannelClosed);
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buff) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TamperError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(body)
}

/// The global ip probe answers with the address and port the remote peer saw.
pub fn decode_endpoint(payload: &[u8]) -> Option<SocketAddr> {
    match payload.len() {
        6 => {
            let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let port = u16::from_be_bytes([payload[4], payload[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&payload[..16]);
            let port = u16::from_be_bytes([payload[16], payload[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

pub fn encode_endpoint(addr: &SocketAddr) -> Vec<u8> {
    let mut buff = Vec::with_capacity(18);
    push_addr(&mut buff, addr);
    buff
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_request_layout() {
        let src: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let dst: SocketAddr = "203.0.113.5:80".parse().unwrap();
        let mut req = WireRequest::new(Opcode::ReservedSyn, 4, src, dst).unwrap();
        req.seq = 258;
        let body = encode_request(&req);
        assert_eq!(
            body,
            vec![
                1, 0, 0, 1, 2, 11, 0, 0, 0, 4, 4, 10, 0, 0, 2, 0x9c, 0x40, 203, 0, 113, 5, 0, 80
            ]
        );
        assert_eq!(decode_request(&body).unwrap(), req);
    }
    #[test]
    fn test_request_family_mismatch() {
        let src: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        match WireRequest::new(Opcode::AckOnly, 0, src, dst) {
            Err(TamperError::AddressFamilyMismatch { .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }
    #[test]
    fn test_response_decode() {
        let resp = decode_response(&[0, 0, 0, 9, 1, 0, 2, 0xbe, 0xef]).unwrap();
        assert_eq!(resp.seq, 9);
        assert!(resp.success);
        assert_eq!(resp.payload, Some(vec![0xbe, 0xef]));

        let resp = decode_response(&[0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.payload, None);
        assert_eq!(
            encode_response(&WireResponse::new(9, true, Some(vec![0xbe, 0xef]))).unwrap(),
            vec![0, 0, 0, 9, 1, 0, 2, 0xbe, 0xef]
        );
    }
    #[test]
    fn test_response_malformed() {
        assert!(matches!(
            decode_response(&[0, 0, 0, 1, 2, 0, 0]),
            Err(TamperError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode_response(&[0, 0, 0, 1, 1, 0, 4, 1]),
            Err(TamperError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode_response(&[0, 0, 0, 1, 1, 0, 0, 9]),
            Err(TamperError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode_response(&[]),
            Err(TamperError::MalformedFrame { .. })
        ));
    }
    #[test]
    fn test_frame_eof_is_closed() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut empty),
            Err(TamperError::ChannelClosed)
        ));
        let mut huge: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            read_frame(&mut huge),
            Err(TamperError::FrameTooLarge { .. })
        ));
    }
    #[test]
    fn test_frame_stream() {
        let mut buff = Vec::new();
        write_frame(&mut buff, &[1, 2, 3]).unwrap();
        write_frame(&mut buff, &[]).unwrap();
        let mut r: &[u8] = &buff;
        assert_eq!(read_frame(&mut r).unwrap(), vec![1, 2, 3]);
        assert_eq!(read_frame(&mut r).unwrap(), Vec::<u8>::new());
    }
    #[test]
    fn test_endpoint_payload() {
        let addr: SocketAddr = "198.51.100.7:61000".parse().unwrap();
        assert_eq!(decode_endpoint(&encode_endpoint(&addr)), Some(addr));
        let addr6: SocketAddr = "[2001:db8::7]:443".parse().unwrap();
        assert_eq!(decode_endpoint(&encode_endpoint(&addr6)), Some(addr6));
        assert_eq!(decode_endpoint(&[1, 2, 3]), None);
    }
}
