//! Byte tubes to a local process or a remote socket.

use crate::core::chunked::read_chunked;
use crate::core::raw_http::read_response;
use crate::domain::model::RawResponse;
use crate::utils::error::{CtfError, Result};
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 4096;

/// Read side of a tube. Bytes stay in `buffer` until a receive takes them,
/// so a receive cut off by its timeout leaves them for the next call.
struct TubeReader {
    inner: BoxedReader,
    buffer: BytesMut,
}

impl TubeReader {
    fn new(inner: BoxedReader) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// Appends the next read to the buffer. `Ok(0)` means EOF.
    async fn fill_more(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.buffer.split_to(n).to_vec()
    }

    fn find(&self, delim: &[u8]) -> Option<usize> {
        self.buffer
            .windows(delim.len())
            .position(|window| window == delim)
    }
}

impl AsyncRead for TubeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.buffer.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let n = this.buffer.len().min(buf.remaining());
        buf.put_slice(&this.buffer[..n]);
        this.buffer.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncBufRead for TubeReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.buffer.is_empty() {
            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            this.buffer.extend_from_slice(read_buf.filled());
        }
        Poll::Ready(Ok(&this.buffer[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().buffer.advance(amt);
    }
}

/// Where a solver connects: the remote service or a local copy of the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Remote { host: String, port: u16 },
    Process { program: String, args: Vec<String> },
}

impl Target {
    /// Remote when both host and port are given, local process otherwise.
    pub fn from_args(host: Option<String>, port: Option<u16>, program: impl Into<String>) -> Self {
        match (host, port) {
            (Some(host), Some(port)) => Target::Remote { host, port },
            _ => Target::Process {
                program: program.into(),
                args: Vec::new(),
            },
        }
    }

    pub async fn connect(&self) -> Result<Tube> {
        match self {
            Target::Remote { host, port } => Tube::remote(host, *port).await,
            Target::Process { program, args } => Tube::process(program, args),
        }
    }
}

pub struct Tube {
    reader: TubeReader,
    writer: BoxedWriter,
    child: Option<Child>,
    label: String,
    timeout: Option<Duration>,
}

async fn with_timeout<T, F>(timeout: Option<Duration>, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CtfError::timeout(operation))?,
        None => fut.await,
    }
}

fn eof(operation: &str) -> CtfError {
    CtfError::IoError(std::io::Error::new(
        ErrorKind::UnexpectedEof,
        format!("tube closed while {}", operation),
    ))
}

impl Tube {
    pub fn process<S: AsRef<str>>(program: &str, args: &[S]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CtfError::ProcessError {
                message: format!("failed to start {}: {}", program, e),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| CtfError::ProcessError {
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| CtfError::ProcessError {
            message: "child stdout unavailable".to_string(),
        })?;

        tracing::info!("Started process {} (pid {:?})", program, child.id());
        Ok(Self {
            reader: TubeReader::new(Box::new(stdout)),
            writer: Box::new(stdin),
            child: Some(child),
            label: program.to_string(),
            timeout: None,
        })
    }

    pub async fn remote(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        tracing::info!("Opened connection to {}:{}", host, port);
        Ok(Self {
            reader: TubeReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            child: None,
            label: format!("{}:{}", host, port),
            timeout: None,
        })
    }

    /// Wraps any duplex stream (TLS sockets, in-memory pipes in tests).
    pub fn from_stream<S>(stream: S, label: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: TubeReader::new(Box::new(read_half)),
            writer: Box::new(write_half),
            child: None,
            label: label.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn is_process(&self) -> bool {
        self.child.is_some()
    }

    pub async fn send(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        tracing::debug!("[{}] sent {} bytes: {}", self.label, data.len(), data.escape_ascii());
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_line(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut line = data.as_ref().to_vec();
        line.push(b'\n');
        self.send(line).await
    }

    /// Returns whatever is buffered or arrives next, at most `max` bytes.
    pub async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        let reader = &mut self.reader;
        let data = with_timeout(self.timeout, "receiving", async move {
            if reader.buffer.is_empty() && reader.fill_more().await? == 0 {
                return Err(eof("receiving"));
            }
            let take = reader.buffer.len().min(max);
            Ok::<_, CtfError>(reader.take(take))
        })
        .await?;
        self.log_received(&data);
        Ok(data)
    }

    pub async fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let reader = &mut self.reader;
        let data = with_timeout(self.timeout, "receiving exact bytes", async move {
            while reader.buffer.len() < n {
                if reader.fill_more().await? == 0 {
                    return Err(eof("receiving exact bytes"));
                }
            }
            Ok::<_, CtfError>(reader.take(n))
        })
        .await?;
        self.log_received(&data);
        Ok(data)
    }

    /// Reads until `delim` has been seen. With `drop` the delimiter is removed.
    pub async fn recv_until(&mut self, delim: &[u8], drop: bool) -> Result<Vec<u8>> {
        if delim.is_empty() {
            return Ok(Vec::new());
        }
        let reader = &mut self.reader;
        let mut data = with_timeout(self.timeout, "waiting for delimiter", async move {
            loop {
                if let Some(pos) = reader.find(delim) {
                    return Ok::<_, CtfError>(reader.take(pos + delim.len()));
                }
                if reader.fill_more().await? == 0 {
                    return Err(eof("waiting for delimiter"));
                }
            }
        })
        .await?;
        self.log_received(&data);
        if drop {
            data.truncate(data.len() - delim.len());
        }
        Ok(data)
    }

    /// One line including its trailing `\n`.
    pub async fn recv_line(&mut self) -> Result<Vec<u8>> {
        self.recv_until(b"\n", false).await
    }

    pub async fn send_after(&mut self, delim: &[u8], data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let received = self.recv_until(delim, false).await?;
        self.send(data).await?;
        Ok(received)
    }

    pub async fn send_line_after(
        &mut self,
        delim: &[u8],
        data: impl AsRef<[u8]>,
    ) -> Result<Vec<u8>> {
        let received = self.recv_until(delim, false).await?;
        self.send_line(data).await?;
        Ok(received)
    }

    /// Reads until the peer closes its side.
    pub async fn recv_all(&mut self) -> Result<Vec<u8>> {
        let reader = &mut self.reader;
        let data = with_timeout(self.timeout, "receiving until EOF", async move {
            while reader.fill_more().await? > 0 {}
            let len = reader.buffer.len();
            Ok::<_, CtfError>(reader.take(len))
        })
        .await?;
        self.log_received(&data);
        Ok(data)
    }

    pub async fn recv_chunked(&mut self) -> Result<Vec<u8>> {
        with_timeout(
            self.timeout,
            "reading chunked body",
            read_chunked(&mut self.reader),
        )
        .await
    }

    pub async fn recv_response(&mut self) -> Result<RawResponse> {
        with_timeout(
            self.timeout,
            "reading HTTP response",
            read_response(&mut self.reader),
        )
        .await
    }

    /// Closes our writing side so the peer sees EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Waits for a process tube to exit. Remote tubes have no status.
    pub async fn wait(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(Some(child.wait().await?)),
            None => Ok(None),
        }
    }

    /// Opens gdb attached to the process in a new terminal window.
    ///
    /// `terminal` is the launcher prefix, e.g. `["konsole", "-e"]`. Remote
    /// tubes have nothing to attach to and are left alone.
    pub fn attach_debugger(&self, terminal: &[String], script: &[&str]) -> Result<()> {
        let Some(pid) = self.pid() else {
            tracing::debug!("[{}] not a local process, skipping debugger", self.label);
            return Ok(());
        };
        let (launcher, launcher_args) = terminal.split_first().ok_or_else(|| {
            CtfError::MissingConfigError {
                field: "terminal".to_string(),
            }
        })?;

        let mut gdb_args = vec!["gdb".to_string(), "-p".to_string(), pid.to_string()];
        if !script.is_empty() {
            let path = gdb_script_path(pid);
            std::fs::write(&path, script.join("\n"))?;
            gdb_args.push("-x".to_string());
            gdb_args.push(path.to_string_lossy().into_owned());
        }

        Command::new(launcher)
            .args(launcher_args)
            .args(&gdb_args)
            .spawn()
            .map_err(|e| CtfError::ProcessError {
                message: format!("failed to launch debugger via {}: {}", launcher, e),
            })?;
        tracing::info!("Attached gdb to pid {}", pid);
        Ok(())
    }

    /// Hands the tube to the terminal: stdin goes to the target, target output
    /// goes to stdout. Returns when either side closes.
    pub async fn interactive(&mut self) -> Result<()> {
        tracing::info!("[{}] switching to interactive mode", self.label);
        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();

        tokio::select! {
            result = tokio::io::copy(&mut self.reader, &mut stdout) => {
                result?;
                tracing::info!("[{}] target closed the connection", self.label);
            }
            result = tokio::io::copy(&mut stdin, &mut self.writer) => {
                result?;
                tracing::info!("[{}] stdin closed", self.label);
            }
        }
        stdout.flush().await?;
        Ok(())
    }

    fn log_received(&self, data: &[u8]) {
        tracing::debug!(
            "[{}] received {} bytes: {}",
            self.label,
            data.len(),
            data.escape_ascii()
        );
    }
}

fn gdb_script_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("ctfify-gdb-{}.gdb", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_args() {
        assert_eq!(
            Target::from_args(Some("pwn.chall".to_string()), Some(1337), "./chall"),
            Target::Remote {
                host: "pwn.chall".to_string(),
                port: 1337
            }
        );
        assert_eq!(
            Target::from_args(Some("pwn.chall".to_string()), None, "./chall"),
            Target::Process {
                program: "./chall".to_string(),
                args: vec![]
            }
        );
    }

    #[tokio::test]
    async fn test_recv_until_and_line() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex");
        server.write_all(b"Name: ").await.unwrap();
        server.write_all(b"line one\nrest").await.unwrap();

        assert_eq!(tube.recv_until(b": ", true).await.unwrap(), b"Name");
        assert_eq!(tube.recv_line().await.unwrap(), b"line one\n");
        assert_eq!(tube.recv(100).await.unwrap(), b"rest");
    }

    #[tokio::test]
    async fn test_send_line_after() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex");
        server.write_all(b"> ").await.unwrap();

        let prompt = tube.send_line_after(b"> ", b"AAAA").await.unwrap();
        assert_eq!(prompt, b"> ");

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AAAA\n");
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex").with_timeout(Duration::from_millis(50));
        let err = tube.recv_line().await.unwrap_err();
        assert!(matches!(err, CtfError::TimeoutError { .. }));
    }

    #[tokio::test]
    async fn test_timed_out_recv_until_keeps_partial_line() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex").with_timeout(Duration::from_millis(50));
        server.write_all(b"leak=0x4141").await.unwrap();

        let err = tube.recv_until(b"\n", false).await.unwrap_err();
        assert!(matches!(err, CtfError::TimeoutError { .. }));

        server.write_all(b"\n").await.unwrap();
        assert_eq!(tube.recv_line().await.unwrap(), b"leak=0x4141\n");
    }

    #[tokio::test]
    async fn test_timed_out_recv_exact_keeps_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex").with_timeout(Duration::from_millis(50));
        server.write_all(b"abc").await.unwrap();

        assert!(tube.recv_exact(5).await.is_err());

        server.write_all(b"de!").await.unwrap();
        assert_eq!(tube.recv_exact(5).await.unwrap(), b"abcde");
        assert_eq!(tube.recv(16).await.unwrap(), b"!");
    }

    #[tokio::test]
    async fn test_buffered_bytes_feed_chunked_read() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex");
        server.write_all(b"HDR\n4\r\nflag\r\n0\r\n\r\n").await.unwrap();

        assert_eq!(tube.recv_line().await.unwrap(), b"HDR\n");
        assert_eq!(tube.recv_chunked().await.unwrap(), b"flag");
    }

    #[tokio::test]
    async fn test_recv_exact_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut tube = Tube::from_stream(client, "duplex");
        server.write_all(b"abc").await.unwrap();
        drop(server);
        let err = tube.recv_exact(8).await.unwrap_err();
        match err {
            CtfError::IoError(e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_attach_debugger_skips_remote() {
        let (client, _server) = tokio::io::duplex(8);
        let tube = Tube::from_stream(client, "duplex");
        assert!(tube.attach_debugger(&[], &["break main"]).is_ok());
    }
}
