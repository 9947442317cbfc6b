use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use sha1::{Digest, Sha1};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone)]
pub struct WsHandshakeConfig {
    pub allowed_origins: Option<Vec<String>>,
    pub max_request_bytes: usize,
}

impl Default for WsHandshakeConfig {
    fn default() -> Self {
        Self {
            allowed_origins: None,
            max_request_bytes: 8192,
        }
    }
}

#[derive(Debug)]
pub struct WsFrame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum WsFrameError {
    Timeout,
    Closed,
    Io(std::io::Error),
    Protocol(String),
}

pub fn accept_handshake(stream: &mut TcpStream, config: &WsHandshakeConfig) -> Result<(), String> {
    let request = read_http_request(stream, config.max_request_bytes)?;
    let headers = parse_request_headers(&request)?;

    let upgrade_ok = headers
        .get("upgrade")
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok {
        reject(stream, 400, "Missing Upgrade: websocket")?;
        return Err("websocket upgrade missing".to_string());
    }
    let connection_ok = headers
        .get("connection")
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    if !connection_ok {
        reject(stream, 400, "Missing Connection: Upgrade")?;
        return Err("websocket connection upgrade missing".to_string());
    }
    if headers.get("sec-websocket-version").map(String::as_str) != Some("13") {
        reject(stream, 400, "Unsupported WebSocket version")?;
        return Err("unsupported websocket version".to_string());
    }
    if let Some(allowed) = config.allowed_origins.as_ref() {
        let origin = headers.get("origin").map(String::as_str).unwrap_or("");
        if !origin_allowed(allowed, origin) {
            reject(stream, 403, "Origin not allowed")?;
            return Err("websocket origin rejected".to_string());
        }
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or_else(|| "missing sec-websocket-key".to_string())?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: {}\r\n\
\r\n",
        accept_key(key)
    );
    stream
        .write_all(response.as_bytes())
        .map_err(|err| format!("websocket handshake write failed: {err}"))?;
    Ok(())
}

fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_ENGINE.encode(sha1.finalize())
}

fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed
        .iter()
        .any(|entry| entry == "*" || entry == origin.trim())
}

pub fn read_frame<R: Read>(stream: &mut R, max_payload: usize) -> Result<WsFrame, WsFrameError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).map_err(map_read_error)?;

    let fin = (header[0] & 0x80) != 0;
    let opcode = header[0] & 0x0f;
    if !fin {
        return Err(WsFrameError::Protocol(
            "fragmented frames not supported".to_string(),
        ));
    }
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7f) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).map_err(map_read_error)?;
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).map_err(map_read_error)?;
        len = u64::from_be_bytes(ext);
    }

    if opcode >= 0x8 && len > 125 {
        return Err(WsFrameError::Protocol(
            "control frame payload too large".to_string(),
        ));
    }
    if len as usize > max_payload {
        return Err(WsFrameError::Protocol(format!(
            "websocket payload {} exceeds max {}",
            len, max_payload
        )));
    }

    let mut mask = [0u8; 4];
    if masked {
        stream.read_exact(&mut mask).map_err(map_read_error)?;
    }

    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).map_err(map_read_error)?;
        if masked {
            for (idx, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[idx % 4];
            }
        }
    }

    Ok(WsFrame { opcode, payload })
}

pub fn write_frame<W: Write>(stream: &mut W, opcode: u8, payload: &[u8]) -> Result<(), String> {
    let len = payload.len();
    let mut header = Vec::with_capacity(10);
    header.push(0x80 | (opcode & 0x0f));
    if len < 126 {
        header.push(len as u8);
    } else if len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }
    stream
        .write_all(&header)
        .map_err(|err| format!("websocket header write failed: {err}"))?;
    if !payload.is_empty() {
        stream
            .write_all(payload)
            .map_err(|err| format!("websocket payload write failed: {err}"))?;
    }
    Ok(())
}

fn read_http_request(stream: &mut TcpStream, max_bytes: usize) -> Result<String, String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let read = stream
            .read(&mut buf)
            .map_err(|err| format!("handshake read failed: {err}"))?;
        if read == 0 {
            return Err("handshake closed".to_string());
        }
        data.extend_from_slice(&buf[..read]);
        if data.len() > max_bytes {
            return Err("handshake exceeded max bytes".to_string());
        }
        if data.windows(4).any(|chunk| chunk == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&data).to_string())
}

fn parse_request_headers(request: &str) -> Result<HashMap<String, String>, String> {
    let mut lines = request.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| "empty handshake request".to_string())?;
    let method = request_line.split_whitespace().next().unwrap_or("");
    if !method.eq_ignore_ascii_case("GET") {
        return Err(format!("unexpected method '{method}'"));
    }
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(headers)
}

fn reject(stream: &mut TcpStream, code: u16, message: &str) -> Result<(), String> {
    let response = format!("HTTP/1.1 {code} {message}\r\n\r\n");
    stream
        .write_all(response.as_bytes())
        .map_err(|err| format!("handshake reject write failed: {err}"))?;
    Ok(())
}

fn map_read_error(err: std::io::Error) -> WsFrameError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => WsFrameError::Timeout,
        std::io::ErrorKind::UnexpectedEof => WsFrameError::Closed,
        _ => WsFrameError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn masked_frame_roundtrip() {
        let payload = b"everfall".to_vec();
        let mut framed = vec![0x82, 0x80 | payload.len() as u8];
        let mask = [0x11, 0x22, 0x33, 0x44];
        framed.extend_from_slice(&mask);
        for (idx, byte) in payload.iter().enumerate() {
            framed.push(byte ^ mask[idx % 4]);
        }

        let mut cursor = Cursor::new(framed);
        let frame = read_frame(&mut cursor, 1024).expect("frame");
        assert_eq!(frame.opcode, 0x2);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn write_frame_emits_unmasked_header() {
        let mut out = Vec::new();
        write_frame(&mut out, 0x2, b"abc").expect("write");
        assert_eq!(out, vec![0x82, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn oversized_payload_is_protocol_error() {
        let framed = vec![0x82, 126, 0x40, 0x00];
        let mut cursor = Cursor::new(framed);
        assert!(matches!(
            read_frame(&mut cursor, 1024),
            Err(WsFrameError::Protocol(_))
        ));
    }

    #[test]
    fn header_parse_requires_get() {
        assert!(parse_request_headers("POST / HTTP/1.1\r\n\r\n").is_err());
        let headers =
            parse_request_headers("GET /game HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").expect("ok");
        assert_eq!(headers.get("upgrade").map(String::as_str), Some("websocket"));
    }

    #[test]
    fn origin_check_handles_wildcard() {
        let allowed = vec!["*".to_string()];
        assert!(origin_allowed(&allowed, "https://anything.example"));
        let allowed = vec!["https://play.everfall.example".to_string()];
        assert!(origin_allowed(&allowed, "https://play.everfall.example"));
        assert!(!origin_allowed(&allowed, "https://evil.example"));
    }
}
