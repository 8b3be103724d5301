//! RESP framing: command parsing (multibulk and inline) and reply encoding.
//!
//! Only the reply types the server needs are encoded: simple string, integer, error.

use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;

/// Longest inline command or header line accepted before a terminator is seen.
pub const MAX_INLINE_LEN: usize = 64 * 1024;
/// Largest argument count in a multibulk header.
pub const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;
/// Largest single bulk argument.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Framing error; the connection is answered with `-ERR Protocol error: ...` and closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError(pub String);

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Protocol error: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

fn protocol_error(msg: impl Into<String>) -> ProtocolError {
    ProtocolError(msg.into())
}

/// Server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Integer(i64),
    Error(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                out.put_u8(b'+');
                put_line(out, s);
            }
            Reply::Integer(n) => {
                out.put_u8(b':');
                put_line(out, &n.to_string());
            }
            Reply::Error(s) => {
                out.put_u8(b'-');
                put_line(out, s);
            }
        }
    }
}

/// Line payloads may not carry CR/LF; they are replaced by spaces.
fn put_line(out: &mut BytesMut, s: &str) {
    for b in s.bytes() {
        out.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    out.put_slice(b"\r\n");
}

/// Take one complete command off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed and `buf` is untouched. An empty argument list is
/// returned for blank inline lines and `*0`/`*-1` headers; callers skip those.
pub fn parse_command(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let parsed = if buf[0] == b'*' {
        parse_multibulk(&buf[..])?
    } else {
        parse_inline(&buf[..])?
    };
    let Some((ranges, consumed)) = parsed else {
        return Ok(None);
    };
    let frame = buf.split_to(consumed).freeze();
    Ok(Some(ranges.into_iter().map(|r| frame.slice(r)).collect()))
}

type Frame = (Vec<Range<usize>>, usize);

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_int(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn parse_multibulk(buf: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let Some(end) = find_crlf(buf, 1) else {
        if buf.len() > MAX_INLINE_LEN {
            return Err(protocol_error("too big mbulk count string"));
        }
        return Ok(None);
    };
    let count = parse_int(&buf[1..end])
        .filter(|n| *n <= MAX_MULTIBULK_LEN)
        .ok_or_else(|| protocol_error("invalid multibulk length"))?;
    let mut pos = end + 2;
    if count <= 0 {
        return Ok(Some((Vec::new(), pos)));
    }

    let mut args = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        let Some(&marker) = buf.get(pos) else {
            return Ok(None);
        };
        if marker != b'$' {
            return Err(protocol_error(format!(
                "expected '$', got '{}'",
                marker as char
            )));
        }
        let Some(end) = find_crlf(buf, pos + 1) else {
            if buf.len() - pos > MAX_INLINE_LEN {
                return Err(protocol_error("too big bulk count string"));
            }
            return Ok(None);
        };
        let len = parse_int(&buf[pos + 1..end])
            .filter(|n| (0..=MAX_BULK_LEN).contains(n))
            .ok_or_else(|| protocol_error("invalid bulk length"))? as usize;
        let start = end + 2;
        if buf.len() < start + len + 2 {
            return Ok(None);
        }
        if &buf[start + len..start + len + 2] != b"\r\n" {
            return Err(protocol_error("bulk argument not terminated by CRLF"));
        }
        args.push(start..start + len);
        pos = start + len + 2;
    }
    Ok(Some((args, pos)))
}

fn parse_inline(buf: &[u8]) -> Result<Option<Frame>, ProtocolError> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_INLINE_LEN {
            return Err(protocol_error("too big inline request"));
        }
        return Ok(None);
    };
    let line_end = if nl > 0 && buf[nl - 1] == b'\r' {
        nl - 1
    } else {
        nl
    };

    let mut args = Vec::new();
    let mut i = 0;
    while i < line_end {
        if buf[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        while i < line_end && !buf[i].is_ascii_whitespace() {
            i += 1;
        }
        args.push(start..i);
    }
    Ok(Some((args, nl + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: Vec<Bytes>) -> Vec<String> {
        cmd.iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    #[test]
    fn multibulk_command() {
        let mut buf = BytesMut::from(&b"*3\r\n$5\r\nRPUSH\r\n$3\r\nkey\r\n$7\r\n{\"a\":1}\r\n"[..]);
        let cmd = parse_command(&mut buf).unwrap().unwrap();
        assert_eq!(args(cmd), vec!["RPUSH", "key", "{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn bulk_values_may_contain_crlf() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nECHO\r\n$4\r\na\r\nb\r\n"[..]);
        let cmd = parse_command(&mut buf).unwrap().unwrap();
        assert_eq!(&cmd[1][..], b"a\r\nb");
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let full = b"*2\r\n$4\r\nLLEN\r\n$3\r\nkey\r\n";
        for cut in 1..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(parse_command(&mut buf).unwrap(), None, "cut at {}", cut);
            assert_eq!(buf.len(), cut);
        }
        let mut buf = BytesMut::from(&full[..]);
        assert!(parse_command(&mut buf).unwrap().is_some());
    }

    #[test]
    fn pipelined_commands_in_order() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\nINFO\r\n*1\r\n$4\r\nQUIT\r\n"[..]);
        let mut seen = Vec::new();
        while let Some(cmd) = parse_command(&mut buf).unwrap() {
            seen.push(args(cmd).join(" "));
        }
        assert_eq!(seen, vec!["PING", "INFO", "QUIT"]);
    }

    #[test]
    fn inline_commands() {
        let mut buf = BytesMut::from(&b"  llen   mylist \r\nping\n"[..]);
        assert_eq!(args(parse_command(&mut buf).unwrap().unwrap()), vec!["llen", "mylist"]);
        assert_eq!(args(parse_command(&mut buf).unwrap().unwrap()), vec!["ping"]);
        assert_eq!(parse_command(&mut buf).unwrap(), None);

        let mut blank = BytesMut::from(&b"\r\n"[..]);
        assert_eq!(parse_command(&mut blank).unwrap(), Some(vec![]));
        assert!(blank.is_empty());
    }

    #[test]
    fn empty_multibulk() {
        let mut buf = BytesMut::from(&b"*0\r\n*-1\r\n"[..]);
        assert_eq!(parse_command(&mut buf).unwrap(), Some(vec![]));
        assert_eq!(parse_command(&mut buf).unwrap(), Some(vec![]));
        assert!(buf.is_empty());
    }

    #[test]
    fn framing_errors() {
        let mut buf = BytesMut::from(&b"*x\r\n"[..]);
        assert_eq!(
            parse_command(&mut buf).unwrap_err(),
            ProtocolError("invalid multibulk length".into())
        );
        let mut buf = BytesMut::from(&b"*1\r\n:4\r\n"[..]);
        assert_eq!(
            parse_command(&mut buf).unwrap_err().to_string(),
            "Protocol error: expected '$', got ':'"
        );
        let mut buf = BytesMut::from(&b"*1\r\n$-3\r\n"[..]);
        assert!(parse_command(&mut buf).is_err());
        let mut buf = BytesMut::from(&b"*1\r\n$2\r\nabcd\r\n"[..]);
        assert!(parse_command(&mut buf).is_err());
        let mut buf = BytesMut::from(vec![b'a'; MAX_INLINE_LEN + 1].as_slice());
        assert!(parse_command(&mut buf).is_err());
    }

    #[test]
    fn reply_encoding() {
        let mut out = BytesMut::new();
        Reply::Simple("PONG".into()).encode(&mut out);
        Reply::Integer(42).encode(&mut out);
        Reply::Error("ERR queue full".into()).encode(&mut out);
        Reply::Simple("a\r\nb".into()).encode(&mut out);
        assert_eq!(&out[..], b"+PONG\r\n:42\r\n-ERR queue full\r\n+a  b\r\n");
    }
}
