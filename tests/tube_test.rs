use anyhow::Result;
use ctfify::adapters::http::BaseApi;
use ctfify::adapters::tube::{Target, Tube};
use ctfify::CtfError;
use reqwest::Method;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_raw_request_over_tube_with_chunked_response() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nX-Flag: yes\r\n\r\n\
                  5\r\nflag{\r\n5\r\ntube}\r\n0\r\n\r\n",
            )
            .await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&request).into_owned())
    });

    let api = BaseApi::new(&addr.to_string())?;
    let raw = api.make_raw_request(Method::GET, "/smuggle", |builder| {
        builder.query(&[("q", "1")])
    })?;

    let mut tube = Tube::remote("127.0.0.1", addr.port())
        .await?
        .with_timeout(Duration::from_secs(5));
    tube.send(&raw).await?;
    let response = tube.recv_response().await?;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-flag"), Some("yes"));
    assert_eq!(response.body, b"flag{tube}");

    let received = server.await??;
    assert!(received.starts_with("GET /smuggle?q=1 HTTP/1.1\r\n"));
    Ok(())
}

#[tokio::test]
async fn test_remote_target_prompt_exchange() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        socket.write_all(b"Welcome!\nname: ").await?;
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await?;
        let name = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        socket
            .write_all(format!("hello {}\n", name).as_bytes())
            .await?;
        Ok::<_, std::io::Error>(())
    });

    let target = Target::from_args(Some("127.0.0.1".to_string()), Some(port), "./chall");
    let mut tube = target.connect().await?.with_timeout(Duration::from_secs(5));
    assert!(!tube.is_process());

    let banner = tube.send_line_after(b"name: ", "pwn").await?;
    assert_eq!(banner, b"Welcome!\nname: ");
    assert_eq!(tube.recv_line().await?, b"hello pwn\n");
    assert_eq!(tube.recv_all().await?, b"");
    Ok(())
}

#[tokio::test]
async fn test_recv_times_out_on_silent_peer() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(socket);
        Ok::<_, std::io::Error>(())
    });

    let mut tube = Tube::remote("127.0.0.1", port)
        .await?
        .with_timeout(Duration::from_millis(50));
    let err = tube.recv_line().await.unwrap_err();
    assert!(matches!(err, CtfError::TimeoutError { .. }));

    server.await??;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_tube_roundtrip() -> Result<()> {
    let mut tube = Tube::process("cat", &[] as &[&str])?.with_timeout(Duration::from_secs(5));
    assert!(tube.is_process());
    assert!(tube.pid().is_some());

    tube.send_line("AAAA%p%p").await?;
    assert_eq!(tube.recv_until(b"%p", true).await?, b"AAAA");
    assert_eq!(tube.recv_exact(3).await?, b"%p\n");

    tube.shutdown().await?;
    let status = tube.wait().await?;
    assert!(status.is_some_and(|s| s.success()));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_tube_with_args() -> Result<()> {
    let mut tube = Tube::process("sh", &["-c", "printf 'leak: 0x4141\\n'; read x; echo got $x"])?
        .with_timeout(Duration::from_secs(5));

    let leak = tube.recv_until(b"\n", true).await?;
    assert_eq!(leak, b"leak: 0x4141");
    tube.send_line("rop").await?;
    assert_eq!(tube.recv_line().await?, b"got rop\n");
    Ok(())
}
