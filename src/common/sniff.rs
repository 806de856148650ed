//! Destination hostname sniffing.
//!
//! When a SOCKS5 client hands us a bare IP, the real hostname may still be
//! recoverable from the first payload bytes: the TLS ClientHello SNI
//! extension on port 443, or the HTTP Host header on port 80. The recovered
//! name lets hostname ACL rules apply to IP-addressed connections.

use httparse::Status;

pub const HTTP_PORT: u16 = 80;
pub const TLS_PORT: u16 = 443;

/// Upper bound on bytes accumulated while sniffing.
pub const SNIFF_BUF_SIZE: usize = 16 * 1024;

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const TLS_EXT_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOST_NAME: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// Hostname recovered.
    Found(String),
    /// Plausible protocol prefix, but the interesting part has not arrived.
    NeedMore,
    /// Not a sniffable protocol, or no hostname present.
    None,
}

/// Sniff a hostname from the first payload bytes for the given destination
/// port. Only ports 80 and 443 are attempted.
pub fn sniff(data: &[u8], port: u16) -> SniffResult {
    match port {
        TLS_PORT => sniff_tls_sni(data),
        HTTP_PORT => sniff_http_host(data),
        _ => SniffResult::None,
    }
}

/// Cursor over an untrusted byte run. `None` from any getter means the
/// input ran out, which the callers report as NeedMore.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn u24(&mut self) -> Option<u32> {
        let a = self.u8()?;
        let b = self.u8()?;
        let c = self.u8()?;
        Some(u32::from_be_bytes([0, a, b, c]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }
}

/// Parse a TLS ClientHello and extract the SNI host_name entry.
fn sniff_tls_sni(data: &[u8]) -> SniffResult {
    // Record header: the type byte alone is enough to rule TLS out.
    if let Some(&content_type) = data.first() {
        if content_type != TLS_CONTENT_TYPE_HANDSHAKE {
            return SniffResult::None;
        }
    } else {
        return SniffResult::NeedMore;
    }

    let mut r = Reader::new(data);
    let (_, _version, record_len) = match (r.u8(), r.u16(), r.u16()) {
        (Some(t), Some(v), Some(l)) => (t, v, l),
        _ => return SniffResult::NeedMore,
    };

    // Sniff only the first record; a ClientHello spanning records is
    // treated as incomplete until the whole record is buffered.
    let record = match r.take(record_len as usize) {
        Some(rec) => rec,
        None => return SniffResult::NeedMore,
    };

    let mut h = Reader::new(record);
    match h.u8() {
        Some(TLS_HANDSHAKE_CLIENT_HELLO) => {}
        Some(_) => return SniffResult::None,
        None => return SniffResult::NeedMore,
    }

    let body_len = match h.u24() {
        Some(l) => l as usize,
        None => return SniffResult::NeedMore,
    };
    let body = match h.take(body_len) {
        Some(b) => b,
        None => return SniffResult::NeedMore,
    };

    let mut b = Reader::new(body);
    // client_version + random
    if b.take(2 + 32).is_none() {
        return SniffResult::NeedMore;
    }
    // session_id
    match b.u8().and_then(|n| b.take(n as usize)) {
        Some(_) => {}
        None => return SniffResult::NeedMore,
    }
    // cipher_suites
    match b.u16().and_then(|n| b.take(n as usize)) {
        Some(_) => {}
        None => return SniffResult::NeedMore,
    }
    // compression_methods
    match b.u8().and_then(|n| b.take(n as usize)) {
        Some(_) => {}
        None => return SniffResult::NeedMore,
    }

    // Extensions are optional; a hello without them carries no SNI.
    let ext_total = match b.u16() {
        Some(l) => l as usize,
        None => return SniffResult::None,
    };
    let exts = match b.take(ext_total) {
        Some(e) => e,
        None => return SniffResult::NeedMore,
    };

    let mut e = Reader::new(exts);
    loop {
        let (ext_type, ext_len) = match (e.u16(), e.u16()) {
            (Some(t), Some(l)) => (t, l as usize),
            _ => return SniffResult::None,
        };
        let ext_data = match e.take(ext_len) {
            Some(d) => d,
            None => return SniffResult::None,
        };

        if ext_type != TLS_EXT_SERVER_NAME {
            continue;
        }

        let mut s = Reader::new(ext_data);
        let list_len = match s.u16() {
            Some(l) => l as usize,
            None => return SniffResult::None,
        };
        let list = match s.take(list_len) {
            Some(l) => l,
            None => return SniffResult::None,
        };

        let mut n = Reader::new(list);
        while let (Some(name_type), Some(name_len)) = (n.u8(), n.u16()) {
            let name = match n.take(name_len as usize) {
                Some(nm) => nm,
                None => return SniffResult::None,
            };
            if name_type == SNI_TYPE_HOST_NAME {
                return match std::str::from_utf8(name) {
                    Ok(host) if !host.is_empty() => SniffResult::Found(host.to_string()),
                    _ => SniffResult::None,
                };
            }
        }
        return SniffResult::None;
    }
}

/// Parse an HTTP/1.x request head and extract the Host header.
fn sniff_http_host(data: &[u8]) -> SniffResult {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(Status::Complete(_)) => {
            for header in req.headers.iter() {
                if header.name.eq_ignore_ascii_case("host") {
                    let value = match std::str::from_utf8(header.value) {
                        Ok(v) => v.trim(),
                        Err(_) => return SniffResult::None,
                    };
                    // Drop a trailing :port; the SOCKS5 request already
                    // fixed the port.
                    let host = value.rsplit_once(':').map_or(value, |(h, p)| {
                        if p.chars().all(|c| c.is_ascii_digit()) {
                            h
                        } else {
                            value
                        }
                    });
                    if host.is_empty() {
                        return SniffResult::None;
                    }
                    return SniffResult::Found(host.to_string());
                }
            }
            SniffResult::None
        }
        Ok(Status::Partial) => SniffResult::NeedMore,
        Err(_) => SniffResult::None,
    }
}
