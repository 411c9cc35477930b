//! End-to-end engine tests over an in-memory duplex pipe, with the test
//! driving the server side of the wire frame by frame.

use bytes::BytesMut;
use http2_client::{
    connection::{Connection, ConnectionEvent, Handle, PREFACE},
    flags::*,
    frame::{Decoded, Frame},
    hpack::HeaderCodec,
    types::*,
    Error, ErrorCode, Request, Response, Settings,
};
use std::{num::NonZeroU32, time::Duration};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use url::Url;

struct TestPeer {
    io: DuplexStream,
    buf: BytesMut,
    codec: HeaderCodec,
}

impl TestPeer {
    async fn read_preface(&mut self) {
        let mut preface = [0u8; 24];
        self.io.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], PREFACE);
    }

    async fn recv_frame(&mut self) -> Frame {
        loop {
            match Frame::decode(&mut self.buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
                Decoded::Frame(frame) => return frame,
                Decoded::Ignored(_) => {}
                Decoded::Unfinished => {
                    let mut chunk = [0u8; 4096];
                    let read = self.io.read(&mut chunk).await.unwrap();
                    assert!(read > 0, "client hung up while a frame was expected");
                    self.buf.extend_from_slice(&chunk[..read]);
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        frame.encode(&mut out, DEFAULT_MAX_FRAME_SIZE).unwrap();
        self.io.write_all(&out).await.unwrap();
    }

    /// Runs the preface/settings exchange from the server's point of view.
    async fn handshake(&mut self, params: Vec<(SettingsParameter, u32)>) {
        self.read_preface().await;
        match self.recv_frame().await {
            Frame::Settings { flags, params } => {
                assert!(!flags.contains(SettingsFlags::ACK));
                assert!(params.is_empty(), "defaults encode to an empty SETTINGS");
            }
            other => panic!("expected client SETTINGS, got {:?}", other),
        }
        self.send_frame(Frame::Settings {
            flags: SettingsFlags::empty(),
            params,
        })
        .await;
        match self.recv_frame().await {
            Frame::Settings { flags, .. } => assert!(flags.contains(SettingsFlags::ACK)),
            other => panic!("expected SETTINGS ACK, got {:?}", other),
        }
        self.send_frame(Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        })
        .await;
        match self.recv_frame().await {
            Frame::WindowUpdate { stream, increment } => {
                assert_eq!(stream, 0);
                assert_eq!(increment.get(), 2_000_000_000);
            }
            other => panic!("expected the connection window boost, got {:?}", other),
        }
    }

    /// Receives a whole request: HEADERS (any CONTINUATIONs) plus DATA until
    /// END_STREAM. Returns the decoded headers and the body.
    async fn recv_request(&mut self) -> (StreamId, Headers, Vec<u8>) {
        let (stream_id, mut block, mut end_headers, mut end_stream) = match self.recv_frame().await
        {
            Frame::Headers {
                stream,
                flags,
                fragment,
                ..
            } => (
                stream.get(),
                fragment.to_vec(),
                flags.contains(HeadersFlags::END_HEADERS),
                flags.contains(HeadersFlags::END_STREAM),
            ),
            other => panic!("expected HEADERS, got {:?}", other),
        };
        while !end_headers {
            match self.recv_frame().await {
                Frame::Continuation {
                    stream,
                    flags,
                    fragment,
                } => {
                    assert_eq!(stream.get(), stream_id);
                    block.extend_from_slice(&fragment);
                    end_headers = flags.contains(ContinuationFlags::END_HEADERS);
                }
                other => panic!("expected CONTINUATION, got {:?}", other),
            }
        }
        let headers = self.codec.decode(&block).unwrap();
        let mut body = Vec::new();
        while !end_stream {
            match self.recv_frame().await {
                Frame::Data {
                    stream,
                    flags,
                    data,
                } => {
                    assert_eq!(stream.get(), stream_id);
                    body.extend_from_slice(&data);
                    end_stream = flags.contains(DataFlags::END_STREAM);
                }
                other => panic!("expected DATA, got {:?}", other),
            }
        }
        (stream_id, headers, body)
    }

    /// Sends a bodyless response and the trailing frames a client expects.
    async fn send_response(&mut self, stream_id: StreamId, status: &str, body: &[u8]) {
        let block = self
            .codec
            .encode(&vec![(":status".to_owned(), status.to_owned())]);
        let stream = NonZeroStreamId::new(stream_id).unwrap();
        self.send_frame(Frame::Headers {
            stream,
            flags: if body.is_empty() {
                HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM
            } else {
                HeadersFlags::END_HEADERS
            },
            priority: None,
            fragment: block.into(),
        })
        .await;
        if !body.is_empty() {
            self.send_frame(Frame::Data {
                stream,
                flags: DataFlags::END_STREAM,
                data: body.to_vec().into(),
            })
            .await;
        }
    }

    /// The WINDOW_UPDATE pair the client owes us for a DATA payload.
    async fn expect_window_updates(&mut self, stream_id: StreamId, length: u32) {
        match self.recv_frame().await {
            Frame::WindowUpdate { stream, increment } => {
                assert_eq!(stream, stream_id);
                assert_eq!(increment.get(), length);
            }
            other => panic!("expected stream WINDOW_UPDATE, got {:?}", other),
        }
        match self.recv_frame().await {
            Frame::WindowUpdate { stream, increment } => {
                assert_eq!(stream, 0);
                assert_eq!(increment.get(), length);
            }
            other => panic!("expected connection WINDOW_UPDATE, got {:?}", other),
        }
    }
}

type Events = mpsc::UnboundedReceiver<ConnectionEvent>;

fn start() -> (TestPeer, Handle, Events, JoinHandle<Result<(), Error>>) {
    let (client_io, server_io) = duplex(1 << 20);
    let (connection, handle, events) = Connection::new(client_io, Settings::default());
    let task = tokio::spawn(connection.run());
    let peer = TestPeer {
        io: server_io,
        buf: BytesMut::new(),
        codec: HeaderCodec::new(),
    };
    (peer, handle, events, task)
}

fn url() -> Url {
    "https://example.com/".try_into().unwrap()
}

fn spawn_request(handle: &Handle, request: Request) -> JoinHandle<Result<Response, Error>> {
    let handle = handle.clone();
    tokio::spawn(async move { handle.request(request).await })
}

async fn assert_quiet(peer: &mut TestPeer) {
    assert!(
        timeout(Duration::from_millis(100), peer.recv_frame())
            .await
            .is_err(),
        "client sent a frame it should have held back"
    );
}

#[tokio::test]
async fn handshake_settings_and_window_boost() {
    let (mut peer, _handle, _events, _task) = start();
    peer.handshake(vec![
        (SettingsParameter::MaxConcurrentStreams, 100),
        (SettingsParameter::InitialWindowSize, 65_535),
    ])
    .await;
}

#[tokio::test]
async fn requests_wait_for_peer_settings() {
    let (mut peer, handle, _events, _task) = start();
    let pending = spawn_request(&handle, Request::get(url(), None));

    peer.read_preface().await;
    let first = peer.recv_frame().await;
    assert!(matches!(first, Frame::Settings { .. }));
    // demand is still zero, the request must not reach the wire
    assert_quiet(&mut peer).await;

    peer.send_frame(Frame::Settings {
        flags: SettingsFlags::empty(),
        params: vec![(SettingsParameter::MaxConcurrentStreams, 100)],
    })
    .await;
    match peer.recv_frame().await {
        Frame::Settings { flags, .. } => assert!(flags.contains(SettingsFlags::ACK)),
        other => panic!("expected SETTINGS ACK, got {:?}", other),
    }
    let (stream_id, headers, body) = peer.recv_request().await;
    assert_eq!(stream_id, 1);
    assert!(body.is_empty());
    assert!(headers.contains(&(":method".to_owned(), "GET".to_owned())));

    peer.send_response(1, "200", b"").await;
    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn single_request_response() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let pending = spawn_request(&handle, Request::get(url(), None));
    let (stream_id, headers, _) = peer.recv_request().await;
    assert_eq!(stream_id, 1);
    assert!(headers.contains(&(":path".to_owned(), "/".to_owned())));
    assert!(headers.contains(&(":authority".to_owned(), "example.com".to_owned())));

    peer.send_response(1, "200", b"hello").await;
    peer.expect_window_updates(1, 5).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.body[..], b"hello");

    // the finished stream released its slot; the next request takes stream 3
    let pending = spawn_request(&handle, Request::get(url(), None));
    let (stream_id, _, _) = peer.recv_request().await;
    assert_eq!(stream_id, 3);
    peer.send_response(3, "204", b"").await;
    assert_eq!(pending.await.unwrap().unwrap().status(), 204);
}

#[tokio::test]
async fn admission_honors_the_concurrent_stream_limit() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 1)])
        .await;

    let first = spawn_request(&handle, Request::get(url(), None));
    let second = spawn_request(&handle, Request::get(url(), None));

    let (stream_id, _, _) = peer.recv_request().await;
    assert_eq!(stream_id, 1);
    // one slot, one stream: the second request must stay queued
    assert_quiet(&mut peer).await;

    peer.send_response(1, "200", b"").await;
    assert_eq!(first.await.unwrap().unwrap().status(), 200);

    let (stream_id, _, _) = peer.recv_request().await;
    assert_eq!(stream_id, 3);
    peer.send_response(3, "200", b"").await;
    assert_eq!(second.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn response_headers_reassemble_across_continuation() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let pending = spawn_request(&handle, Request::get(url(), None));
    let (stream_id, _, _) = peer.recv_request().await;

    let block = peer.codec.encode(&vec![
        (":status".to_owned(), "200".to_owned()),
        ("x-source".to_owned(), "pushed-in-pieces".to_owned()),
    ]);
    let (first, rest) = block.split_at(3);
    let stream = NonZeroStreamId::new(stream_id).unwrap();
    peer.send_frame(Frame::Headers {
        stream,
        flags: HeadersFlags::END_STREAM,
        priority: None,
        fragment: first.to_vec().into(),
    })
    .await;
    peer.send_frame(Frame::Continuation {
        stream,
        flags: ContinuationFlags::END_HEADERS,
        fragment: rest.to_vec().into(),
    })
    .await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("x-source"), Some("pushed-in-pieces"));
}

#[tokio::test]
async fn interrupted_continuation_is_a_protocol_error() {
    let (mut peer, handle, mut events, task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let pending = spawn_request(&handle, Request::get(url(), None));
    let (stream_id, _, _) = peer.recv_request().await;

    let block = peer
        .codec
        .encode(&vec![(":status".to_owned(), "200".to_owned())]);
    let stream = NonZeroStreamId::new(stream_id).unwrap();
    peer.send_frame(Frame::Headers {
        stream,
        flags: HeadersFlags::empty(),
        priority: None,
        fragment: block.into(),
    })
    .await;
    // DATA in the middle of a header block tears the connection down
    peer.send_frame(Frame::Data {
        stream,
        flags: DataFlags::END_STREAM,
        data: b"oops".to_vec().into(),
    })
    .await;

    loop {
        match peer.recv_frame().await {
            Frame::GoAway { error, .. } => {
                assert_eq!(error, ErrorCode::ProtocolError);
                break;
            }
            _ => {}
        }
    }
    assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
    assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
    assert!(matches!(
        events.recv().await,
        Some(ConnectionEvent::Closed)
    ));
}

#[tokio::test]
async fn goaway_fails_streams_above_the_high_water_mark() {
    let (mut peer, handle, mut events, task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let first = spawn_request(&handle, Request::get(url(), None));
    assert_eq!(peer.recv_request().await.0, 1);
    let second = spawn_request(&handle, Request::get(url(), None));
    assert_eq!(peer.recv_request().await.0, 3);
    let third = spawn_request(&handle, Request::get(url(), None));
    assert_eq!(peer.recv_request().await.0, 5);

    peer.send_frame(Frame::GoAway {
        last_stream: 3,
        error: ErrorCode::NoError,
        debug: bytes::Bytes::from_static(b"maintenance"),
    })
    .await;

    // stream 5 was never processed by the peer
    assert!(matches!(
        third.await.unwrap(),
        Err(Error::CancelledByGoaway {
            last_stream: 3,
            error: ErrorCode::NoError,
        })
    ));

    // the surviving streams complete normally
    peer.send_response(1, "200", b"").await;
    peer.send_response(3, "204", b"").await;
    assert_eq!(first.await.unwrap().unwrap().status(), 200);
    assert_eq!(second.await.unwrap().unwrap().status(), 204);

    assert!(task.await.unwrap().is_ok());
    assert!(matches!(
        events.recv().await,
        Some(ConnectionEvent::Closed)
    ));
}

#[tokio::test]
async fn uploads_block_on_the_stream_window() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![
        (SettingsParameter::MaxConcurrentStreams, 100),
        (SettingsParameter::InitialWindowSize, 10),
    ])
    .await;

    let pending = spawn_request(&handle, Request::post(url(), None, vec![7u8; 25]));
    match peer.recv_frame().await {
        Frame::Headers { stream, flags, .. } => {
            assert_eq!(stream.get(), 1);
            assert!(!flags.contains(HeadersFlags::END_STREAM));
        }
        other => panic!("expected HEADERS, got {:?}", other),
    }
    match peer.recv_frame().await {
        Frame::Data { flags, data, .. } => {
            assert_eq!(data.len(), 10, "only the window's worth may be sent");
            assert!(!flags.contains(DataFlags::END_STREAM));
        }
        other => panic!("expected DATA, got {:?}", other),
    }
    assert_quiet(&mut peer).await;

    let increment = NonZeroU32::new(15).unwrap();
    peer.send_frame(Frame::WindowUpdate {
        stream: 1,
        increment,
    })
    .await;
    peer.send_frame(Frame::WindowUpdate {
        stream: 0,
        increment,
    })
    .await;
    match peer.recv_frame().await {
        Frame::Data { flags, data, .. } => {
            assert_eq!(data.len(), 15);
            assert!(flags.contains(DataFlags::END_STREAM));
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    peer.send_response(1, "200", b"").await;
    assert_eq!(pending.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn settings_delta_reopens_stream_windows() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![
        (SettingsParameter::MaxConcurrentStreams, 100),
        (SettingsParameter::InitialWindowSize, 10),
    ])
    .await;

    let pending = spawn_request(&handle, Request::post(url(), None, vec![7u8; 25]));
    assert!(matches!(peer.recv_frame().await, Frame::Headers { .. }));
    match peer.recv_frame().await {
        Frame::Data { data, .. } => assert_eq!(data.len(), 10),
        other => panic!("expected DATA, got {:?}", other),
    }

    // raising the initial window size credits every active stream
    peer.send_frame(Frame::Settings {
        flags: SettingsFlags::empty(),
        params: vec![(SettingsParameter::InitialWindowSize, 25)],
    })
    .await;
    match peer.recv_frame().await {
        Frame::Settings { flags, .. } => assert!(flags.contains(SettingsFlags::ACK)),
        other => panic!("expected SETTINGS ACK, got {:?}", other),
    }
    match peer.recv_frame().await {
        Frame::Data { flags, data, .. } => {
            assert_eq!(data.len(), 15);
            assert!(flags.contains(DataFlags::END_STREAM));
        }
        other => panic!("expected DATA, got {:?}", other),
    }

    peer.send_response(1, "200", b"").await;
    assert_eq!(pending.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn ping_round_trip() {
    let (mut peer, handle, mut events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let handle_clone = handle.clone();
    let pinged = tokio::spawn(async move { handle_clone.ping().await });
    let data = match peer.recv_frame().await {
        Frame::Ping { flags, data } => {
            assert!(!flags.contains(PingFlags::ACK));
            data
        }
        other => panic!("expected PING, got {:?}", other),
    };
    peer.send_frame(Frame::Ping {
        flags: PingFlags::ACK,
        data,
    })
    .await;
    pinged.await.unwrap().unwrap();
    assert!(matches!(events.recv().await, Some(ConnectionEvent::Pong)));
}

#[tokio::test]
async fn peer_pings_are_echoed() {
    let (mut peer, _handle, mut events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let data = [9, 8, 7, 6, 5, 4, 3, 2];
    peer.send_frame(Frame::Ping {
        flags: PingFlags::empty(),
        data,
    })
    .await;
    match peer.recv_frame().await {
        Frame::Ping { flags, data: echoed } => {
            assert!(flags.contains(PingFlags::ACK));
            assert_eq!(echoed, data);
        }
        other => panic!("expected PING ACK, got {:?}", other),
    }
    assert!(matches!(events.recv().await, Some(ConnectionEvent::Ping)));
}

#[tokio::test]
async fn push_promise_surfaces_to_the_client() {
    let (mut peer, handle, mut events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let pending = spawn_request(&handle, Request::get(url(), None));
    let (stream_id, _, _) = peer.recv_request().await;

    let promise = peer.codec.encode(&vec![
        (":method".to_owned(), "GET".to_owned()),
        (":path".to_owned(), "/style.css".to_owned()),
    ]);
    peer.send_frame(Frame::PushPromise {
        stream: NonZeroStreamId::new(stream_id).unwrap(),
        flags: PushPromiseFlags::END_HEADERS,
        promised: NonZeroStreamId::new(2).unwrap(),
        fragment: promise.into(),
    })
    .await;
    match events.recv().await {
        Some(ConnectionEvent::PushPromise { stream, headers }) => {
            assert_eq!(stream, 2);
            assert!(headers.contains(&(":path".to_owned(), "/style.css".to_owned())));
        }
        other => panic!("expected a push promise event, got {:?}", other),
    }

    // the pushed stream delivers like any other; its DATA is credited back
    peer.send_response(2, "200", b"body{}").await;
    peer.expect_window_updates(2, 6).await;

    peer.send_response(stream_id, "200", b"").await;
    assert_eq!(pending.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn close_sends_goaway_and_notifies() {
    let (mut peer, handle, mut events, task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    handle.close();
    match peer.recv_frame().await {
        Frame::GoAway {
            last_stream, error, ..
        } => {
            assert_eq!(last_stream, 0);
            assert_eq!(error, ErrorCode::NoError);
        }
        other => panic!("expected GOAWAY, got {:?}", other),
    }
    assert!(task.await.unwrap().is_ok());
    assert!(matches!(
        events.recv().await,
        Some(ConnectionEvent::Closed)
    ));
    // the engine is gone; new requests fail fast
    assert!(matches!(
        handle.request(Request::get(url(), None)).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn transport_loss_fails_in_flight_requests() {
    let (peer, handle, mut events, task) = start();
    let pending = spawn_request(&handle, Request::get(url(), None));
    // dropping the peer kills the transport out from under the engine,
    // mid-handshake or not
    drop(peer);
    match task.await.unwrap() {
        Ok(()) | Err(Error::Transport(_)) => {}
        Err(other) => panic!("unexpected engine error: {}", other),
    }
    assert!(matches!(
        events.recv().await,
        Some(ConnectionEvent::Closed)
    ));
    assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
}

#[tokio::test]
async fn reset_streams_fail_only_their_request() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    let first = spawn_request(&handle, Request::get(url(), None));
    assert_eq!(peer.recv_request().await.0, 1);
    let second = spawn_request(&handle, Request::get(url(), None));
    assert_eq!(peer.recv_request().await.0, 3);

    peer.send_frame(Frame::ResetStream {
        stream: NonZeroStreamId::new(1).unwrap(),
        error: ErrorCode::RefusedStream,
    })
    .await;
    assert!(matches!(
        first.await.unwrap(),
        Err(Error::Stream {
            id: 1,
            error: ErrorCode::RefusedStream,
        })
    ));

    // the connection is still healthy
    peer.send_response(3, "200", b"").await;
    assert_eq!(second.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn oversized_header_blocks_split_into_continuations() {
    let (mut peer, handle, _events, _task) = start();
    peer.handshake(vec![(SettingsParameter::MaxConcurrentStreams, 100)])
        .await;

    // an incompressible header value far beyond one frame
    let huge = "x".repeat(40_000);
    let pending = spawn_request(
        &handle,
        Request::get(url(), Some(vec![("x-huge".to_owned(), huge.clone())])),
    );

    let (stream_id, headers, _) = peer.recv_request().await;
    assert_eq!(stream_id, 1);
    assert!(headers.contains(&("x-huge".to_owned(), huge)));

    peer.send_response(1, "200", b"").await;
    assert_eq!(pending.await.unwrap().unwrap().status(), 200);
}
