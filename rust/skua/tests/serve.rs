//! Dispatch semantics over real TCP connections: ordering for blocking
//! handlers, concurrency for `NON_BLOCK`, stream write rules, and panic
//! isolation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use skua::{
    Cmd, Frame, FrameFlags, HEADER_LEN, Header, LatencyObserver, ServeMux, Server, ServerBinding,
    WriteError, decode_header,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

async fn start_server(binding: ServerBinding) -> (Server, SocketAddr, tokio::task::JoinHandle<()>) {
    let server = Server::new(vec![binding]);
    server.listen().await.unwrap();
    let addr = server.local_addrs()[0];
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        serving.serve().await.unwrap();
    });
    (server, addr, handle)
}

async fn send_frame(
    stream: &mut TcpStream,
    request_id: u64,
    cmd: Cmd,
    flags: FrameFlags,
    payload: &[u8],
) {
    let frame = Frame {
        request_id,
        cmd,
        flags,
        payload: Bytes::copy_from_slice(payload),
    };
    stream.write_all(&frame.encode()).await.unwrap();
}

async fn recv_frame(stream: &mut TcpStream) -> io::Result<(Header, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).await?;
    let header = decode_header(&raw);
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;
    Ok((header, payload))
}

fn echo_mux(cmd: Cmd) -> Arc<ServeMux> {
    let mux = Arc::new(ServeMux::new());
    mux.handle_func(cmd, |mut writer, frame| async move {
        writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
        writer.write_bytes(&frame.payload);
        writer.end_write().await.unwrap();
    });
    mux
}

#[tokio::test]
async fn blocking_echo_preserves_order() {
    let mux = Arc::new(ServeMux::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    {
        let in_flight = in_flight.clone();
        let overlapped = overlapped.clone();
        mux.handle_func(7, move |mut writer, frame| {
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            async move {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
                writer.write_bytes(&frame.payload);
                writer.end_write().await.unwrap();
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }
    let (server, addr, _serving) = start_server(ServerBinding::new("127.0.0.1:0", mux)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let open_end = FrameFlags::STREAM | FrameFlags::STREAM_END;
    send_frame(&mut client, 1, 7, open_end, b"hi").await;
    send_frame(&mut client, 2, 7, open_end, b"there").await;

    let (first, payload) = recv_frame(&mut client).await.unwrap();
    assert_eq!(first.request_id, 1);
    assert_eq!(first.cmd, 7);
    assert_eq!(first.flags, FrameFlags::STREAM_END);
    assert_eq!(payload, b"hi");

    let (second, payload) = recv_frame(&mut client).await.unwrap();
    assert_eq!(second.request_id, 2);
    assert_eq!(payload, b"there");

    // the reader must not hand over frame 2 while frame 1's handler runs
    assert!(!overlapped.load(Ordering::SeqCst));

    server.shutdown().await;
}

#[tokio::test]
async fn nonblock_handlers_overlap() {
    let mux = Arc::new(ServeMux::new());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let current = current.clone();
        let peak = peak.clone();
        mux.handle_func(9, move |mut writer, frame| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
                writer.end_write().await.unwrap();
                current.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }
    let (server, addr, _serving) = start_server(ServerBinding::new("127.0.0.1:0", mux)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let begin = Instant::now();
    let flags = FrameFlags::STREAM | FrameFlags::STREAM_END | FrameFlags::NON_BLOCK;
    for id in 1..=5u64 {
        send_frame(&mut client, id, 9, flags, b"").await;
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        let (header, _) = recv_frame(&mut client).await.unwrap();
        seen.push(header.request_id);
    }
    let elapsed = begin.elapsed();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert!(
        elapsed < Duration::from_millis(600),
        "handlers did not overlap: {elapsed:?}"
    );
    assert!(peak.load(Ordering::SeqCst) >= 2);

    server.shutdown().await;
}

#[tokio::test]
async fn write_after_close_self_is_rejected() {
    let mux = Arc::new(ServeMux::new());
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    mux.handle_func(11, move |mut writer, frame| {
        let result_tx = result_tx.clone();
        async move {
            writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
            writer.end_write().await.unwrap();
            // the outbound half is closed now
            writer.start_write(frame.request_id, frame.cmd, FrameFlags::empty());
            result_tx.send(writer.end_write().await).unwrap();
        }
    });
    let (server, addr, _serving) = start_server(ServerBinding::new("127.0.0.1:0", mux)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_frame(
        &mut client,
        1,
        11,
        FrameFlags::STREAM | FrameFlags::STREAM_END,
        b"",
    )
    .await;
    let (header, _) = recv_frame(&mut client).await.unwrap();
    assert_eq!(header.request_id, 1);

    let rejected = result_rx.recv().await.unwrap();
    assert!(matches!(rejected, Err(WriteError::WriteAfterCloseSelf)));

    server.shutdown().await;
}

#[tokio::test]
async fn rst_for_unknown_stream_is_rejected() {
    let mux = Arc::new(ServeMux::new());
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    mux.handle_func(12, move |mut writer, frame| {
        let result_tx = result_tx.clone();
        async move {
            writer.start_write(4242, 0, FrameFlags::STREAM_RST);
            result_tx.send(writer.end_write().await).unwrap();
            writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
            writer.end_write().await.unwrap();
        }
    });
    let (server, addr, _serving) = start_server(ServerBinding::new("127.0.0.1:0", mux)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_frame(
        &mut client,
        1,
        12,
        FrameFlags::STREAM | FrameFlags::STREAM_END,
        b"",
    )
    .await;
    recv_frame(&mut client).await.unwrap();

    let rejected = result_rx.recv().await.unwrap();
    assert!(matches!(rejected, Err(WriteError::RstNonExistingStream)));

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_cmd_is_dropped_silently() {
    let mux = echo_mux(1);
    let (server, addr, _serving) = start_server(ServerBinding::new("127.0.0.1:0", mux)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let open_end = FrameFlags::STREAM | FrameFlags::STREAM_END;
    send_frame(&mut client, 1, 99, open_end, b"nobody home").await;
    send_frame(&mut client, 2, 1, open_end, b"echo").await;

    // the only response is for the registered command; the connection stays up
    let (header, payload) = recv_frame(&mut client).await.unwrap();
    assert_eq!(header.request_id, 2);
    assert_eq!(payload, b"echo");

    server.shutdown().await;
}

#[derive(Default)]
struct RecordingObserver {
    samples: Mutex<Vec<(Cmd, Option<String>)>>,
}

impl LatencyObserver for RecordingObserver {
    fn observe(&self, cmd: Cmd, error: Option<&str>, _elapsed: Duration) {
        self.samples
            .lock()
            .unwrap()
            .push((cmd, error.map(str::to_string)));
    }
}

#[tokio::test]
async fn handler_panic_resets_the_stream() {
    let mux = Arc::new(ServeMux::new());
    mux.handle_func(13, |_writer, _frame| async move {
        panic!("boom");
    });
    mux.handle_func(1, |mut writer, frame| async move {
        writer.start_write(frame.request_id, frame.cmd, FrameFlags::STREAM_END);
        writer.end_write().await.unwrap();
    });
    let observer = Arc::new(RecordingObserver::default());
    let binding = ServerBinding::new("127.0.0.1:0", mux).with_latency(observer.clone());
    let (server, addr, _serving) = start_server(binding).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let open_end = FrameFlags::STREAM | FrameFlags::STREAM_END;
    send_frame(&mut client, 42, 13, open_end, b"").await;

    let (reset, payload) = recv_frame(&mut client).await.unwrap();
    assert_eq!(reset.request_id, 42);
    assert_eq!(reset.flags, FrameFlags::STREAM_RST);
    assert_eq!(reset.cmd, 0);
    assert!(payload.is_empty());

    // exactly one frame for request 42: the next frame answers request 43
    send_frame(&mut client, 43, 1, open_end, b"").await;
    let (next, _) = recv_frame(&mut client).await.unwrap();
    assert_eq!(next.request_id, 43);

    let samples = observer.samples.lock().unwrap();
    let panicked: Vec<_> = samples.iter().filter(|(cmd, _)| *cmd == 13).collect();
    assert_eq!(panicked.len(), 1);
    assert_eq!(panicked[0].1.as_deref(), Some("boom"));
    drop(samples);

    server.shutdown().await;
}

#[tokio::test]
async fn oversize_frame_closes_the_connection() {
    let mux = echo_mux(1);
    let binding = ServerBinding::new("127.0.0.1:0", mux).with_max_frame_size(1024);
    let (server, addr, _serving) = start_server(binding).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    // a payload of exactly the limit is fine
    send_frame(
        &mut client,
        1,
        1,
        FrameFlags::STREAM | FrameFlags::STREAM_END,
        &vec![0u8; 1024],
    )
    .await;
    let (header, payload) = recv_frame(&mut client).await.unwrap();
    assert_eq!(header.request_id, 1);
    assert_eq!(payload.len(), 1024);

    // one byte past the limit kills the connection before the payload is read
    let oversize = Frame {
        request_id: 2,
        cmd: 1,
        flags: FrameFlags::STREAM | FrameFlags::STREAM_END,
        payload: Bytes::new(),
    };
    let mut raw = oversize.encode().to_vec();
    raw[..4].copy_from_slice(&1025u32.to_be_bytes());
    client.write_all(&raw).await.unwrap();

    assert!(recv_frame(&mut client).await.is_err());

    server.shutdown().await;
}
