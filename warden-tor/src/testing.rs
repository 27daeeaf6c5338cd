//! Local stand-ins for the SOCKS port and the echo endpoint

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use warden_core::{ProbeSettings, ProxyConfiguration};

use crate::ConnectivityProbe;

/// Keep-alive echo server; `origin(n)` is the address reported on the n-th connection
pub async fn echo_server<F>(origin: F) -> SocketAddr
where
    F: Fn(usize) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut accepted = 0;
        while let Ok((stream, _)) = listener.accept().await {
            accepted += 1;
            let body = format!(r#"{{"origin": "{}"}}"#, origin(accepted));
            tokio::spawn(serve_keep_alive(stream, body));
        }
    });
    addr
}

/// Same address on every connection
pub async fn fixed_echo(address: &'static str) -> SocketAddr {
    echo_server(move |_| address.to_string()).await
}

async fn serve_keep_alive(mut stream: TcpStream, body: String) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let end = loop {
            if let Some(pos) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
            }
        };
        pending.drain(..end);

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
            body.len(),
            body
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Minimal SOCKS5 proxy that sends every stream to `exit`, whatever the
/// client asked for. Stands in for Tor's exit path.
pub async fn socks_proxy(exit: SocketAddr) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = relay(client, exit).await;
            });
        }
    });
    port
}

async fn relay(mut client: TcpStream, exit: SocketAddr) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let address_len = match request[3] {
        0x01 => 4,
        0x04 => 16,
        _ => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            len[0] as usize
        },
    };
    let mut target = vec![0u8; address_len + 2];
    client.read_exact(&mut target).await?;

    let mut upstream = TcpStream::connect(exit).await?;
    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Probe whose routed path goes through `socks_port` and whose echo and
/// anonymity check URLs both point at `echo`
pub fn probe(socks_port: u16, echo: SocketAddr) -> ConnectivityProbe {
    let proxy = ProxyConfiguration {
        socks_port,
        ..Default::default()
    };
    let url = format!("http://{}/ip", echo);
    let settings = ProbeSettings {
        echo_url: url.clone(),
        tor_check_url: url,
        geolocation: false,
        http_timeout_secs: 5,
        ..Default::default()
    };
    ConnectivityProbe::new(&proxy, settings).unwrap()
}
