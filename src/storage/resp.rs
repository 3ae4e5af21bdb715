//! Minimal RESP wire codec
//!
//! Covers the reply types the sidecar actually exchanges with the store:
//! simple strings, errors, integers, bulk strings and arrays, with nil
//! encoded as a negative length.

use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Error, Result};

/// A single RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Value>),
    Null,
}

impl Value {
    /// Bulk or simple string content; `None` for nil.
    pub fn into_string(self) -> Result<Option<String>> {
        match self {
            Value::Bulk(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Value::Simple(s) => Ok(Some(s)),
            Value::Null => Ok(None),
            Value::Error(e) => Err(Error::Protocol(e)),
            other => Err(Error::Protocol(format!("expected string, got {:?}", other))),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(n),
            Value::Error(e) => Err(Error::Protocol(e)),
            other => Err(Error::Protocol(format!("expected integer, got {:?}", other))),
        }
    }

    /// Array elements; nil counts as an empty array.
    pub fn into_array(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            Value::Error(e) => Err(Error::Protocol(e)),
            other => Err(Error::Protocol(format!("expected array, got {:?}", other))),
        }
    }

    /// Fail on error replies, accept anything else.
    pub fn ok(self) -> Result<()> {
        match self {
            Value::Error(e) => Err(Error::Protocol(e)),
            _ => Ok(()),
        }
    }
}

/// Write one command as a RESP array of bulk strings.
pub async fn write_command<W>(w: &mut W, args: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    w.write_all(&buf).await?;
    Ok(())
}

/// Read one reply. Boxed so arrays can recurse.
pub fn read_value<'a, R>(r: &'a mut R) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(r).await?;
        let (&tag, rest) = line
            .split_first()
            .ok_or_else(|| Error::Protocol("empty reply line".into()))?;

        match tag {
            b'+' => Ok(Value::Simple(String::from_utf8_lossy(rest).into_owned())),
            b'-' => Ok(Value::Error(String::from_utf8_lossy(rest).into_owned())),
            b':' => Ok(Value::Int(parse_int(rest)?)),
            b'$' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Value::Null);
                }
                let mut data = vec![0u8; len as usize + 2];
                r.read_exact(&mut data).await?;
                data.truncate(len as usize);
                Ok(Value::Bulk(data))
            }
            b'*' => {
                let len = parse_int(rest)?;
                if len < 0 {
                    return Ok(Value::Null);
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_value(r).await?);
                }
                Ok(Value::Array(items))
            }
            other => Err(Error::Protocol(format!("unknown reply tag {:?}", other as char))),
        }
    })
}

/// Read a CRLF-terminated line, without the terminator.
async fn read_line<R>(r: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(Error::ConnectionFailed("store closed the connection".into()));
    }
    if line.ends_with(b"\n") {
        line.pop();
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(line)
}

fn parse_int(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("bad integer: {:?}", String::from_utf8_lossy(bytes))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(input: &[u8]) -> Result<Value> {
        let mut reader = BufReader::new(input);
        read_value(&mut reader).await
    }

    #[tokio::test]
    async fn test_simple_and_error() {
        assert_eq!(parse(b"+OK\r\n").await.unwrap(), Value::Simple("OK".into()));
        assert_eq!(
            parse(b"-ERR wrong type\r\n").await.unwrap(),
            Value::Error("ERR wrong type".into())
        );
    }

    #[tokio::test]
    async fn test_int() {
        assert_eq!(parse(b":42\r\n").await.unwrap(), Value::Int(42));
        assert_eq!(parse(b":-1\r\n").await.unwrap(), Value::Int(-1));
    }

    #[tokio::test]
    async fn test_bulk() {
        assert_eq!(
            parse(b"$5\r\nhello\r\n").await.unwrap(),
            Value::Bulk(b"hello".to_vec())
        );
        assert_eq!(parse(b"$0\r\n\r\n").await.unwrap(), Value::Bulk(Vec::new()));
        assert_eq!(parse(b"$-1\r\n").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_nested_array() {
        // SCAN-style reply: [cursor, [k1, k2]]
        let raw = b"*2\r\n$1\r\n0\r\n*2\r\n$2\r\nk1\r\n$2\r\nk2\r\n";
        let value = parse(raw).await.unwrap();
        let items = value.into_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].clone().into_string().unwrap(), Some("0".into()));
        let keys = items[1].clone().into_array().unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_write_command() {
        let mut buf = Vec::new();
        write_command(&mut buf, &[b"SET", b"key", b"value"]).await.unwrap();
        assert_eq!(buf, b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let err = parse(b"").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_error_reply_through_helpers() {
        let value = parse(b"-ERR nope\r\n").await.unwrap();
        assert!(value.ok().is_err());
    }
}
