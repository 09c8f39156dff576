//! In-process echo demo: starts a server on an ephemeral port, sends one
//! frame as a raw TCP client, and prints the echoed response.
//!
//! ```sh
//! cargo run --example echo
//! ```

use std::sync::Arc;

use skua::{Frame, FrameFlags, HEADER_LEN, ServeMux, Server, ServerBinding, decode_header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skua=debug")),
        )
        .init();

    let mux = Arc::new(ServeMux::new());
    mux.handle_func(1, |mut writer, frame| async move {
        writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
        writer.write_bytes(&frame.payload);
        if let Err(e) = writer.end_write().await {
            eprintln!("echo failed: {e}");
        }
    });

    let server = Server::new(vec![ServerBinding::new("127.0.0.1:0", mux)]);
    server.listen().await?;
    let addr = server.local_addrs()[0];
    println!("listening on {addr}");

    let serving = server.clone();
    let serve_task = tokio::spawn(async move { serving.serve().await });

    let mut client = TcpStream::connect(addr).await?;
    let request = Frame {
        request_id: 1,
        cmd: 1,
        flags: FrameFlags::STREAM | FrameFlags::STREAM_END,
        payload: bytes::Bytes::from_static(b"hello, skua"),
    };
    client.write_all(&request.encode()).await?;

    let mut raw = [0u8; HEADER_LEN];
    client.read_exact(&mut raw).await?;
    let header = decode_header(&raw);
    let mut payload = vec![0u8; header.payload_len as usize];
    client.read_exact(&mut payload).await?;
    println!(
        "response: request_id={} cmd={} payload={:?}",
        header.request_id,
        header.cmd,
        String::from_utf8_lossy(&payload)
    );

    server.shutdown().await;
    serve_task.await??;
    Ok(())
}
