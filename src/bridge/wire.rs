//! Wire format for the library-clearance exchange.
//!
//! # Request
//!
//! Raw path bytes followed by a single NUL. There is no length prefix.
//! The receiver owns a fixed buffer of [`PATH_MAX`] bytes and forces the
//! final byte to NUL before reading the path back, so a sender that never
//! terminates its string still yields at most `PATH_MAX - 1` bytes.
//!
//! # Response
//!
//! One native-size boolean (a single byte) immediately followed by the
//! NUL-terminated path the clearance service reported. Written as one
//! contiguous buffer.

use std::path::PathBuf;

use thiserror::Error;

/// Size of the receiver's request buffer, terminator included.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Largest buffer a response can occupy.
pub const RESPONSE_MAX: usize = std::mem::size_of::<bool>() + PATH_MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("response is empty")]
    EmptyResponse,

    #[error("response success flag must be 0 or 1, got {0}")]
    InvalidFlag(u8),
}

/// A path forwarded by the shim for quarantine clearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    path: String,
}

impl Request {
    /// Build a request. Paths longer than `PATH_MAX - 1` bytes are cut at
    /// the bound, on a character boundary.
    pub fn new(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if path.len() > PATH_MAX - 1 {
            let mut cut = PATH_MAX - 1;
            while !path.is_char_boundary(cut) {
                cut -= 1;
            }
            path.truncate(cut);
        }
        Self { path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Sender side: path bytes plus terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.path.len() + 1);
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(0);
        buf
    }

    /// Receiver side. Copies at most `PATH_MAX` bytes into a fixed buffer,
    /// forces the last byte to NUL and reads up to the first NUL.
    pub fn decode(raw: &[u8]) -> Self {
        let mut buf = [0u8; PATH_MAX];
        let n = raw.len().min(PATH_MAX);
        buf[..n].copy_from_slice(&raw[..n]);
        buf[PATH_MAX - 1] = 0;

        let end = buf.iter().position(|&b| b == 0).unwrap_or(PATH_MAX - 1);
        Self {
            path: String::from_utf8_lossy(&buf[..end]).into_owned(),
        }
    }

    pub fn into_path_buf(self) -> PathBuf {
        PathBuf::from(self.path)
    }
}

/// Verdict returned to the shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub success: bool,
    pub path: String,
}

impl Response {
    pub fn new(success: bool, path: impl Into<String>) -> Self {
        Self {
            success,
            path: path.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let path = Request::new(self.path.clone());
        let mut buf = Vec::with_capacity(1 + path.path().len() + 1);
        buf.push(u8::from(self.success));
        buf.extend_from_slice(&path.encode());
        buf
    }

    /// Decode a response. A missing terminator is tolerated the same way
    /// the request side tolerates it.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let (&flag, rest) = raw.split_first().ok_or(WireError::EmptyResponse)?;
        let success = match flag {
            0 => false,
            1 => true,
            other => return Err(WireError::InvalidFlag(other)),
        };
        Ok(Self {
            success,
            path: Request::decode(rest).path,
        })
    }
}

/// True once `buf` holds a complete request: a terminator was seen or the
/// bounded buffer is full.
pub fn request_complete(buf: &[u8]) -> bool {
    buf.len() >= PATH_MAX || buf.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_nul_terminated() {
        let req = Request::new("/Users/x/mods/custom.dylib");
        let bytes = req.encode();
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(Request::decode(&bytes).path(), "/Users/x/mods/custom.dylib");
    }

    #[test]
    fn unterminated_request_is_truncated_at_bound() {
        let raw = vec![b'a'; PATH_MAX];
        let req = Request::decode(&raw);
        assert_eq!(req.path().len(), PATH_MAX - 1);
        assert!(req.path().bytes().all(|b| b == b'a'));
    }

    #[test]
    fn oversized_request_ignores_bytes_past_bound() {
        let mut raw = vec![b'b'; PATH_MAX + 64];
        raw.push(0);
        assert_eq!(Request::decode(&raw).path().len(), PATH_MAX - 1);
    }

    #[test]
    fn decode_stops_at_first_nul() {
        let req = Request::decode(b"/tmp/a.so\0garbage\0");
        assert_eq!(req.path(), "/tmp/a.so");
    }

    #[test]
    fn sender_truncates_long_paths() {
        let long = "x".repeat(PATH_MAX * 2);
        let req = Request::new(long);
        assert_eq!(req.encode().len(), PATH_MAX);
    }

    #[test]
    fn response_layout_is_flag_then_path() {
        let bytes = Response::new(true, "/a/b").encode();
        assert_eq!(bytes, b"\x01/a/b\0");

        let parsed = Response::decode(&bytes).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.path, "/a/b");
    }

    #[test]
    fn response_rejects_bad_flag_and_empty_buffer() {
        assert_eq!(Response::decode(&[]), Err(WireError::EmptyResponse));
        assert_eq!(Response::decode(b"\x07/x\0"), Err(WireError::InvalidFlag(7)));
    }

    #[test]
    fn completeness_detection() {
        assert!(!request_complete(b"/partial"));
        assert!(request_complete(b"/done\0"));
        assert!(request_complete(&vec![b'z'; PATH_MAX]));
    }
}
