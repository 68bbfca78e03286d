// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Wire protocol
//
// One request per TCP connection. The request is an ASCII verb line:
//
//   REQUEST_FILE_LIST            -> JSON manifest, then close
//   DOWNLOAD:<name>              -> u64 big-endian length, then that many bytes
//   UPLOAD:<name>                -> (client sends) u64 length, then bytes
//   TEST_CONNECTION              -> "CONNECTION_OK"
//
// A zero length answers a DOWNLOAD for an item that does not exist.

use crate::types::{AppError, ManifestEntry};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REQUEST_FILE_LIST: &str = "REQUEST_FILE_LIST";
pub const DOWNLOAD_PREFIX: &str = "DOWNLOAD:";
pub const UPLOAD_PREFIX: &str = "UPLOAD:";
pub const TEST_CONNECTION: &str = "TEST_CONNECTION";

/// Reply to a liveness probe
pub const CONNECTION_OK: &[u8] = b"CONNECTION_OK";

/// Longest request line the server will read
pub const MAX_REQUEST_LEN: usize = 1024;

/// Size of each read/write during a transfer
pub const CHUNK_SIZE: usize = 4096;

/// A request verb with its argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    FileList,
    Download(String),
    Upload(String),
    TestConnection,
}

impl Request {
    /// Parse a request line. Line terminators and NUL padding are dropped;
    /// spaces belong to the item name.
    pub fn parse(line: &str) -> Result<Self, AppError> {
        let line = line.trim_matches(|c: char| c == '\r' || c == '\n' || c == '\0');

        if line == REQUEST_FILE_LIST {
            Ok(Self::FileList)
        } else if line == TEST_CONNECTION {
            Ok(Self::TestConnection)
        } else if let Some(name) = line.strip_prefix(DOWNLOAD_PREFIX) {
            non_empty(name, "DOWNLOAD").map(Self::Download)
        } else if let Some(name) = line.strip_prefix(UPLOAD_PREFIX) {
            non_empty(name, "UPLOAD").map(Self::Upload)
        } else {
            Err(AppError::Protocol(format!(
                "Unknown request: {}",
                line.chars().take(64).collect::<String>()
            )))
        }
    }

    /// Request line as sent on the wire, newline-terminated
    pub fn to_line(&self) -> String {
        match self {
            Self::FileList => format!("{}\n", REQUEST_FILE_LIST),
            Self::Download(name) => format!("{}{}\n", DOWNLOAD_PREFIX, name),
            Self::Upload(name) => format!("{}{}\n", UPLOAD_PREFIX, name),
            Self::TestConnection => format!("{}\n", TEST_CONNECTION),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Self::FileList => REQUEST_FILE_LIST,
            Self::Download(_) => "DOWNLOAD",
            Self::Upload(_) => "UPLOAD",
            Self::TestConnection => TEST_CONNECTION,
        }
    }
}

fn non_empty(name: &str, verb: &str) -> Result<String, AppError> {
    if name.is_empty() {
        Err(AppError::Protocol(format!("{} without an item name", verb)))
    } else {
        Ok(name.to_string())
    }
}

/// Run an I/O future under a deadline; expiry reads as an unreachable peer
pub async fn with_timeout<T, F>(duration: Duration, what: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(AppError::Io(format!("{}: {}", what, e))),
        Err(_) => Err(AppError::PeerUnreachable(format!(
            "{} timed out after {:?}",
            what, duration
        ))),
    }
}

/// Read the request line from a single bounded read.
///
/// Returns the request and any bytes that followed the line terminator
/// (the start of an upload body). Without a terminator the whole chunk is
/// the request line.
pub async fn read_request<R>(reader: &mut R, timeout: Duration) -> Result<(Request, Vec<u8>), AppError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_LEN];
    let filled = with_timeout(timeout, "Reading request", reader.read(&mut buf)).await?;
    if filled == 0 {
        return Err(AppError::Protocol("Connection closed before request".to_string()));
    }

    let (line, rest) = match buf[..filled].iter().position(|&b| b == b'\n') {
        Some(pos) => (&buf[..pos], buf[pos + 1..filled].to_vec()),
        None => (&buf[..filled], Vec::new()),
    };
    let line = std::str::from_utf8(line)
        .map_err(|_| AppError::Protocol("Request is not valid UTF-8".to_string()))?;

    Ok((Request::parse(line)?, rest))
}

pub async fn write_request<W>(writer: &mut W, request: &Request) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(request.to_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_length<W>(writer: &mut W, len: u64) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&len.to_be_bytes()).await?;
    Ok(())
}

/// Read the 8-byte big-endian length prefix
pub async fn read_length<R>(reader: &mut R, timeout: Duration) -> Result<u64, AppError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 8];
    match tokio::time::timeout(timeout, reader.read_exact(&mut prefix)).await {
        Ok(Ok(_)) => Ok(u64::from_be_bytes(prefix)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(AppError::Protocol(
            "Connection closed before length prefix".to_string(),
        )),
        Ok(Err(e)) => Err(AppError::Io(format!("Reading length prefix: {}", e))),
        Err(_) => Err(AppError::PeerUnreachable(format!(
            "Length prefix timed out after {:?}",
            timeout
        ))),
    }
}

/// Move exactly `len` bytes from `reader` to `writer` in [`CHUNK_SIZE`] pieces.
///
/// `on_progress` receives the running total after every chunk. Each read
/// and write is bounded by `timeout`.
pub async fn copy_exact<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    timeout: Duration,
    mut on_progress: F,
) -> Result<u64, AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;

    while copied < len {
        let want = (len - copied).min(CHUNK_SIZE as u64) as usize;
        let n = with_timeout(timeout, "Reading transfer data", reader.read(&mut chunk[..want])).await?;
        if n == 0 {
            return Err(AppError::Protocol(format!(
                "Connection closed after {} of {} bytes",
                copied, len
            )));
        }

        with_timeout(timeout, "Writing transfer data", writer.write_all(&chunk[..n])).await?;
        copied += n as u64;
        on_progress(copied);
    }

    with_timeout(timeout, "Flushing transfer data", writer.flush()).await?;
    Ok(copied)
}

/// Read a manifest sent as one JSON document terminated by connection close
pub async fn read_manifest<R>(reader: &mut R, max_len: usize) -> Result<Vec<ManifestEntry>, AppError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    reader
        .take(max_len as u64 + 1)
        .read_to_end(&mut bytes)
        .await?;

    if bytes.len() > max_len {
        return Err(AppError::Protocol(format!(
            "Manifest exceeds {} bytes",
            max_len
        )));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Protocol(format!("Malformed manifest: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, ItemKind};

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_parse_verbs() {
        assert_eq!(Request::parse("REQUEST_FILE_LIST").unwrap(), Request::FileList);
        assert_eq!(Request::parse("TEST_CONNECTION\r\n").unwrap(), Request::TestConnection);
        assert_eq!(
            Request::parse("DOWNLOAD:Docs/a b.txt").unwrap(),
            Request::Download("Docs/a b.txt".to_string())
        );
        assert_eq!(
            Request::parse("UPLOAD:x.bin\n").unwrap(),
            Request::Upload("x.bin".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Request::parse("HELLO").unwrap_err().kind(), ErrorKind::Protocol);
        assert_eq!(Request::parse("DOWNLOAD:").unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_download_name_keeps_colons() {
        assert_eq!(
            Request::parse("DOWNLOAD:a:b").unwrap(),
            Request::Download("a:b".to_string())
        );
    }

    #[tokio::test]
    async fn test_request_line_and_trailing_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut payload = Request::Upload("f.txt".to_string()).to_line().into_bytes();
        payload.extend_from_slice(&5u64.to_be_bytes());
        payload.extend_from_slice(b"he");
        client.write_all(&payload).await.unwrap();

        let (request, rest) = read_request(&mut server, TIMEOUT).await.unwrap();
        assert_eq!(request, Request::Upload("f.txt".to_string()));
        assert_eq!(rest.len(), 10);
        assert_eq!(&rest[..8], &5u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_request_without_terminator() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"REQUEST_FILE_LIST").await.unwrap();

        let (request, rest) = read_request(&mut server, TIMEOUT).await.unwrap();
        assert_eq!(request, Request::FileList);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_upload_in_separate_writes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(b"UPLOAD:x.txt").await.unwrap();

        let (request, rest) = read_request(&mut server, TIMEOUT).await.unwrap();
        assert_eq!(request, Request::Upload("x.txt".to_string()));
        assert!(rest.is_empty());

        // 10 is '\n' in the last byte of the prefix
        client.write_all(&10u64.to_be_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"0123456789").await.unwrap();

        assert_eq!(read_length(&mut server, TIMEOUT).await.unwrap(), 10);
        let mut body = Vec::new();
        copy_exact(&mut server, &mut body, 10, TIMEOUT, |_| {}).await.unwrap();
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn test_item_names_keep_their_spaces() {
        assert_eq!(
            Request::parse(" DOWNLOAD: notes .txt \r\n").unwrap_err().kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Request::parse("DOWNLOAD: notes .txt \r\n").unwrap(),
            Request::Download(" notes .txt ".to_string())
        );
    }

    #[tokio::test]
    async fn test_closed_before_request() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_request(&mut server, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_length(&mut client, 0x0102).await.unwrap();
        let mut raw = [0u8; 8];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 1]).await.unwrap();
        drop(client);
        let err = read_length(&mut server, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_copy_exact_stops_at_length() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut source = std::io::Cursor::new([data.clone(), b"trailing".to_vec()].concat());
        let mut sink = Vec::new();
        let mut updates = Vec::new();

        let copied = copy_exact(&mut source, &mut sink, data.len() as u64, TIMEOUT, |n| {
            updates.push(n)
        })
        .await
        .unwrap();

        assert_eq!(copied, 10_000);
        assert_eq!(sink, data);
        assert_eq!(updates, vec![4096, 8192, 10_000]);
    }

    #[tokio::test]
    async fn test_copy_exact_reports_early_close() {
        let mut source = std::io::Cursor::new(vec![1u8; 10]);
        let mut sink = Vec::new();
        let err = copy_exact(&mut source, &mut sink, 20, TIMEOUT, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_read_manifest() {
        let json = br#"[{"name":"a.txt","type":"file","public":true},{"name":"Docs","type":"folder","public":true}]"#;
        let mut reader = &json[..];
        let manifest = read_manifest(&mut reader, 4096).await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[1].kind, ItemKind::Folder);

        let mut reader = &json[..];
        let err = read_manifest(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let mut reader = &b"not json"[..];
        assert!(read_manifest(&mut reader, 4096).await.is_err());
    }
}
