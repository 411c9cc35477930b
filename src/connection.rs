use crate::{
    flags::*,
    flow::FlowControl,
    frame::{Decoded, Frame, Priority},
    hpack::HeaderCodec,
    queue::{self, PendingRequest, QueueReceiver},
    request::Request,
    response::Response,
    settings::Settings,
    stream::{Stream, StreamSignal},
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroU32,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const READ_CHUNK: usize = 16_384;

/// Connection-level notifications delivered to the client.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The peer pinged us (we already echoed the ACK).
    Ping,
    /// A ping of ours was acknowledged.
    Pong,
    /// The peer promised a pushed response on `stream`.
    PushPromise { stream: StreamId, headers: Headers },
    /// The connection is gone; in-flight requests have been failed.
    Closed,
}

enum Command {
    Ping(oneshot::Sender<()>),
    Close,
}

/// Cloneable handle for submitting requests and control calls to a running
/// [`Connection`].
#[derive(Clone)]
pub struct Handle {
    commands: mpsc::UnboundedSender<Command>,
    requests: mpsc::UnboundedSender<PendingRequest>,
}

impl Handle {
    /// Queues a request and waits for its response. The connection pulls it
    /// once the peer's stream limit has room.
    pub async fn request(&self, request: Request) -> Result<Response, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .send(PendingRequest {
                request,
                response_tx,
            })
            .map_err(|_| Error::Closed)?;
        response_rx.await.map_err(|_| Error::Closed)?
    }

    /// Sends a PING and waits for the peer's ACK.
    pub async fn ping(&self) -> Result<(), Error> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Ping(done_tx))
            .map_err(|_| Error::Closed)?;
        done_rx.await.map_err(|_| Error::Closed)
    }

    /// Asks the connection to send GOAWAY and shut down.
    pub fn close(&self) {
        self.commands.send(Command::Close).ok();
    }
}

enum Tick {
    Read(usize),
    Command(Option<Command>),
    Request(Option<PendingRequest>),
}

/// The per-connection protocol engine.
///
/// One task owns all connection state and processes, in arrival order:
/// inbound bytes from the transport, queued requests (pulled under admission
/// demand), and control calls. Nothing else mutates the state, so there are
/// no locks. The socket is read once per loop turn and re-armed by the next
/// turn, and all writes funnel through the engine's write buffer.
pub struct Connection<S> {
    socket: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    local_settings: Settings,
    flow: FlowControl,
    streams: HashMap<NonZeroStreamId, Stream>,
    header_codec: HeaderCodec,
    queue: QueueReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pending_pings: VecDeque<oneshot::Sender<()>>,
    ping_counter: u64,
    /// While a header block is unfinished, only CONTINUATION for this stream
    /// is legal on the whole connection.
    expect_continuation: Option<StreamId>,
    /// Set when the peer said GOAWAY; we finish the surviving streams and
    /// stop pulling new work.
    goaway: Option<(StreamId, ErrorCode)>,
    last_local_stream: StreamId,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wraps an established transport. The preface and our SETTINGS go out
    /// when [`Connection::run`] starts.
    pub fn new(
        socket: S,
        local_settings: Settings,
    ) -> (Self, Handle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, queue) = queue::channel();
        let connection = Self {
            socket,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            local_settings,
            flow: FlowControl::new(),
            streams: HashMap::new(),
            header_codec: HeaderCodec::new(),
            queue,
            commands: commands_rx,
            commands_closed: false,
            events: events_tx,
            pending_pings: VecDeque::new(),
            ping_counter: 0,
            expect_continuation: None,
            goaway: None,
            last_local_stream: 0,
        };
        let handle = Handle {
            commands: commands_tx,
            requests: requests_tx,
        };
        (connection, handle, events_rx)
    }

    /// Drives the connection until it closes. In-flight requests are failed
    /// and a `Closed` event is emitted on every exit path.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.drive().await;
        if let Err(err) = &result {
            match err {
                // the transport is gone, there is nobody to tell
                Error::Transport(_) | Error::Closed => {}
                other => {
                    let code = other.goaway_code();
                    if let Err(send_err) = self.send_goaway(code).await {
                        debug!("GOAWAY send failed: {}", send_err);
                    }
                }
            }
            error!("connection terminated: {}", err);
        }
        self.fail_in_flight();
        self.emit(ConnectionEvent::Closed);
        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        // 24-octet client preface, then our settings, in one write
        self.write_buf.extend_from_slice(PREFACE);
        self.write_frame(Frame::Settings {
            flags: SettingsFlags::empty(),
            params: self.local_settings.to_params(),
        })?;
        self.flush().await?;

        loop {
            let want_pull = self.queue.has_demand() && self.goaway.is_none();
            let commands_open = !self.commands_closed;
            let tick = {
                let Connection {
                    socket,
                    read_buf,
                    commands,
                    queue,
                    ..
                } = &mut *self;
                read_buf.reserve(READ_CHUNK);
                tokio::select! {
                    read = socket.read_buf(read_buf) => Tick::Read(read?),
                    command = commands.recv(), if commands_open => Tick::Command(command),
                    pending = queue.pull(), if want_pull => Tick::Request(pending),
                }
            };
            match tick {
                Tick::Read(0) => {
                    debug!("transport closed by peer");
                    return Ok(());
                }
                Tick::Read(_) => self.on_bytes()?,
                Tick::Command(Some(Command::Ping(done))) => self.send_ping(done)?,
                Tick::Command(Some(Command::Close)) => {
                    self.send_goaway(ErrorCode::NoError).await?;
                    return Ok(());
                }
                Tick::Command(None) => self.commands_closed = true,
                Tick::Request(Some(pending)) => self.flow.add(pending),
                Tick::Request(None) => {}
            }
            self.pump()?;
            self.flush().await?;
            if self.goaway.is_some() && self.flow.active_count() == 0 {
                debug!("all surviving streams finished after GOAWAY");
                return Ok(());
            }
        }
    }

    /// Drains the frame codec over everything buffered so far, dispatching
    /// each frame in wire order.
    fn on_bytes(&mut self) -> Result<(), Error> {
        loop {
            match Frame::decode(&mut self.read_buf, self.local_settings.max_frame_size)? {
                Decoded::Frame(frame) => self.dispatch(frame)?,
                Decoded::Ignored(typ) => debug!("ignoring unknown frame type {:#x}", typ),
                Decoded::Unfinished => return Ok(()),
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), Error> {
        trace!("recv {:?}", frame);
        if let Some(expected) = self.expect_continuation {
            match &frame {
                Frame::Continuation { stream, .. } if stream.get() == expected => {}
                _ => return Err(Error::Protocol("expected CONTINUATION for open header block")),
            }
        }
        match frame {
            Frame::Settings { flags, params } => self.on_settings(flags, &params)?,
            Frame::Ping { flags, data } => self.on_ping(flags, data)?,
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => self.on_goaway(last_stream, error, &debug),
            Frame::WindowUpdate { stream: 0, increment } => {
                self.flow.increment_send_window(increment.get())?;
            }
            Frame::WindowUpdate { stream, increment } => {
                self.on_stream_window_update(stream, increment)?;
            }
            Frame::Data {
                stream,
                flags,
                data,
            } => self.on_data(stream, flags, data)?,
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => self.on_headers(stream, flags, priority, &fragment)?,
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => self.on_continuation(stream, flags, &fragment)?,
            Frame::ResetStream { stream, error } => self.on_reset(stream, error),
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => self.on_push_promise(stream, flags, promised, &fragment)?,
            Frame::Priority { stream, priority } => self.on_priority(stream, priority),
        }
        Ok(())
    }

    fn on_settings(
        &mut self,
        flags: SettingsFlags,
        params: &[(SettingsParameter, u32)],
    ) -> Result<(), Error> {
        if flags.contains(SettingsFlags::ACK) {
            // our settings are in effect; open the connection receive window
            // wide so downloads are not throttled by the 65,535 octet default
            self.flow.replenish_recv(CONNECTION_WINDOW_BOOST)?;
            self.write_frame(Frame::WindowUpdate {
                stream: 0,
                increment: NonZeroU32::new(CONNECTION_WINDOW_BOOST)
                    .ok_or(Error::Protocol("zero window boost"))?,
            })?;
            return Ok(());
        }

        let update = self.flow.update_settings(params)?;
        if let Some(size) = update.header_table_size {
            self.header_codec.update_max_table_size(size);
        }
        if update.initial_window_delta != 0 {
            // https://httpwg.org/specs/rfc7540.html#InitialWindowSize applies
            // the delta to every stream with an active flow-control window
            for stream in self.streams.values_mut() {
                let updated =
                    i64::from(stream.send_window) + i64::from(update.initial_window_delta);
                if updated > i64::from(U31_MAX) {
                    return Err(Error::FlowControl(
                        "initial window change overflows a stream window",
                    ));
                }
                stream.send_window = updated as i32;
            }
        }
        self.write_frame(Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        })?;
        if self.goaway.is_none() {
            self.queue.set_demand(self.flow.available_slots());
        }
        Ok(())
    }

    fn on_ping(&mut self, flags: PingFlags, data: [u8; 8]) -> Result<(), Error> {
        if flags.contains(PingFlags::ACK) {
            if let Some(done) = self.pending_pings.pop_front() {
                done.send(()).ok();
            }
            self.emit(ConnectionEvent::Pong);
            Ok(())
        } else {
            self.emit(ConnectionEvent::Ping);
            self.write_frame(Frame::Ping {
                flags: PingFlags::ACK,
                data,
            })
        }
    }

    fn on_goaway(&mut self, last_stream: StreamId, error: ErrorCode, debug_data: &Bytes) {
        error!("GOAWAY received: last stream {}, {:?}", last_stream, error);
        if !debug_data.is_empty() {
            if let Ok(text) = std::str::from_utf8(debug_data) {
                debug!("GOAWAY debug data: {}", text);
            }
        }
        self.goaway = Some((last_stream, error));
        self.queue.set_demand(0);

        // streams above the peer's high-water mark were never processed
        let cancelled: Vec<NonZeroStreamId> = self
            .streams
            .keys()
            .copied()
            .filter(|id| id.get() > last_stream)
            .collect();
        for id in cancelled {
            if let Some(mut stream) = self.streams.remove(&id) {
                stream.fail(Error::CancelledByGoaway { last_stream, error });
                self.flow.remove_active(id.get());
            }
        }
        while let Some(pending) = self.flow.pop_pending() {
            pending
                .response_tx
                .send(Err(Error::CancelledByGoaway { last_stream, error }))
                .ok();
        }
    }

    fn on_stream_window_update(
        &mut self,
        stream_id: StreamId,
        increment: NonZeroU32,
    ) -> Result<(), Error> {
        let id = match NonZeroStreamId::new(stream_id) {
            Some(id) => id,
            None => return Ok(()),
        };
        let overflowed = match self.streams.get_mut(&id) {
            Some(stream) => stream.on_window_update(increment).is_err(),
            None => {
                debug!("WINDOW_UPDATE for unknown stream {}, dropping", stream_id);
                return Ok(());
            }
        };
        if overflowed {
            // stream-scoped flow-control violation: reset it, keep the
            // connection up
            warn!("stream {} send window overflow, resetting", stream_id);
            self.write_frame(Frame::ResetStream {
                stream: id,
                error: ErrorCode::FlowControlError,
            })?;
            if let Some(mut stream) = self.streams.remove(&id) {
                stream.fail(Error::FlowControl("stream send window overflow"));
            }
            self.finish_stream_slot(id);
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
    ) -> Result<(), Error> {
        let length = data.len() as u32;
        self.flow.charge_recv(length)?;
        let signal = match self.streams.get_mut(&stream_id) {
            Some(stream) => {
                let signal = stream.on_data(flags, data);
                stream.recv_window += length as i32;
                signal
            }
            None => {
                warn!("DATA for unknown stream {}, dropping", stream_id);
                self.flow.replenish_recv(length)?;
                return Ok(());
            }
        };
        if length > 0 {
            // replenish both windows right away so the peer can keep sending;
            // zero-length DATA carries no flow-control cost
            let increment =
                NonZeroU32::new(length).ok_or(Error::Protocol("zero window increment"))?;
            self.write_frame(Frame::WindowUpdate {
                stream: stream_id.get(),
                increment,
            })?;
            self.write_frame(Frame::WindowUpdate {
                stream: 0,
                increment,
            })?;
            self.flow.replenish_recv(length)?;
        }
        self.on_signal(stream_id, signal);
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream_id: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: &[u8],
    ) -> Result<(), Error> {
        self.expect_continuation = if flags.contains(HeadersFlags::END_HEADERS) {
            None
        } else {
            Some(stream_id.get())
        };
        let signal = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream.on_headers(flags, priority, fragment, &mut self.header_codec)?,
            None => {
                warn!("HEADERS for unknown stream {}, dropping", stream_id);
                return Ok(());
            }
        };
        self.on_signal(stream_id, signal);
        Ok(())
    }

    fn on_continuation(
        &mut self,
        stream_id: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: &[u8],
    ) -> Result<(), Error> {
        if self.expect_continuation.is_none() {
            return Err(Error::Protocol("CONTINUATION without an open header block"));
        }
        if flags.contains(ContinuationFlags::END_HEADERS) {
            self.expect_continuation = None;
        }
        let signal = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream.on_continuation(flags, fragment, &mut self.header_codec)?,
            None => {
                warn!("CONTINUATION for unknown stream {}, dropping", stream_id);
                return Ok(());
            }
        };
        self.on_signal(stream_id, signal);
        Ok(())
    }

    fn on_reset(&mut self, stream_id: NonZeroStreamId, error: ErrorCode) {
        // a reset for a stream we never started mutates nothing
        let signal = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream.on_reset(error),
            None => {
                warn!("RST_STREAM for unknown stream {}, dropping", stream_id);
                return;
            }
        };
        self.on_signal(stream_id, signal);
    }

    fn on_push_promise(
        &mut self,
        stream_id: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: &[u8],
    ) -> Result<(), Error> {
        if !self.local_settings.enable_push {
            return Err(Error::Protocol("PUSH_PROMISE with push disabled"));
        }
        if promised.get() % 2 == 1 {
            return Err(Error::Protocol("promised stream id must be even"));
        }
        if !self.streams.contains_key(&stream_id) {
            warn!("PUSH_PROMISE on unknown stream {}, dropping", stream_id);
            return Ok(());
        }
        trace!("stream {} promises stream {}", stream_id, promised);
        let send_window = self.flow.settings().initial_window_size as i32;
        let recv_window = self.local_settings.initial_window_size as i32;
        let stream = self
            .streams
            .entry(promised)
            .or_insert_with(|| Stream::new(promised, 0, send_window, recv_window));
        let signal = stream.on_push_promise(flags, fragment, &mut self.header_codec)?;
        self.flow.add_active(promised.get());
        self.expect_continuation = if flags.contains(PushPromiseFlags::END_HEADERS) {
            None
        } else {
            Some(promised.get())
        };
        self.on_signal(promised, signal);
        Ok(())
    }

    fn on_priority(&mut self, stream_id: NonZeroStreamId, priority: Priority) {
        // observed, not optimized
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.on_priority(priority);
        }
    }

    fn on_signal(&mut self, stream_id: NonZeroStreamId, signal: Option<StreamSignal>) {
        match signal {
            Some(StreamSignal::Finished) => {
                self.streams.remove(&stream_id);
                self.finish_stream_slot(stream_id);
            }
            Some(StreamSignal::PromiseHeaders(headers)) => {
                self.emit(ConnectionEvent::PushPromise {
                    stream: stream_id.get(),
                    headers,
                });
            }
            None => {}
        }
    }

    /// Releases the admission slot a finished stream held.
    fn finish_stream_slot(&mut self, stream_id: NonZeroStreamId) {
        self.flow.remove_active(stream_id.get());
        if self.goaway.is_none() {
            self.queue.grant(1);
        }
    }

    /// Starts admitted requests and drains queued bodies as far as the
    /// windows allow. Cheap when there is nothing to do.
    fn pump(&mut self) -> Result<(), Error> {
        while self.flow.has_pending() && self.flow.connection_send_window() > 0 {
            let pending = match self.flow.pop_pending() {
                Some(pending) => pending,
                None => break,
            };
            self.start_request(pending)?;
        }
        self.drain_stream_sends()
    }

    fn start_request(&mut self, pending: PendingRequest) -> Result<(), Error> {
        let PendingRequest {
            request,
            response_tx,
        } = pending;
        let id = self.flow.allocate_stream_id()?;
        self.last_local_stream = id.get();

        let mut stream = Stream::new(
            id,
            request.id,
            self.flow.settings().initial_window_size as i32,
            self.local_settings.initial_window_size as i32,
        );
        stream.response_tx = Some(response_tx);
        stream.open_send();

        let block = Bytes::from(self.header_codec.encode(&request.headers));
        let end_stream = request.body.is_empty();
        self.write_header_block(id, block, end_stream)?;
        if end_stream {
            stream.sent_end_stream();
        } else {
            stream.queue_body(request.body);
        }

        self.streams.insert(id, stream);
        self.flow.add_active(id.get());
        debug!("request {} -> stream {}", request.id, id);
        Ok(())
    }

    /// Writes one HEADERS frame, splitting the tail over CONTINUATION frames
    /// when the block exceeds the peer's frame limit.
    fn write_header_block(
        &mut self,
        id: NonZeroStreamId,
        mut block: Bytes,
        end_stream: bool,
    ) -> Result<(), Error> {
        let max = self.flow.settings().max_frame_size as usize;
        let first = block.split_to(block.len().min(max));
        let mut flags = HeadersFlags::empty();
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        if block.is_empty() {
            flags |= HeadersFlags::END_HEADERS;
        }
        self.write_frame(Frame::Headers {
            stream: id,
            flags,
            priority: None,
            fragment: first,
        })?;
        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max));
            self.write_frame(Frame::Continuation {
                stream: id,
                flags: if block.is_empty() {
                    ContinuationFlags::END_HEADERS
                } else {
                    ContinuationFlags::empty()
                },
                fragment,
            })?;
        }
        Ok(())
    }

    fn drain_stream_sends(&mut self) -> Result<(), Error> {
        let mut ids: Vec<NonZeroStreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.has_pending_body())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            loop {
                if self.flow.connection_send_window() <= 0 {
                    return Ok(());
                }
                let (chunk, done) = {
                    let stream = match self.streams.get_mut(&id) {
                        Some(stream) => stream,
                        None => break,
                    };
                    let budget = self.flow.send_budget(stream.send_window);
                    match stream.next_chunk(budget) {
                        Some(next) => next,
                        None => break,
                    }
                };
                self.flow.charge_send(chunk.len() as u32);
                self.write_frame(Frame::Data {
                    stream: id,
                    flags: if done {
                        DataFlags::END_STREAM
                    } else {
                        DataFlags::empty()
                    },
                    data: chunk,
                })?;
                if done {
                    if self.streams.get(&id).map_or(false, Stream::is_closed) {
                        self.streams.remove(&id);
                        self.finish_stream_slot(id);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    fn send_ping(&mut self, done: oneshot::Sender<()>) -> Result<(), Error> {
        self.ping_counter += 1;
        self.pending_pings.push_back(done);
        self.write_frame(Frame::Ping {
            flags: PingFlags::empty(),
            data: self.ping_counter.to_be_bytes(),
        })
    }

    async fn send_goaway(&mut self, code: ErrorCode) -> Result<(), Error> {
        debug!(
            "sending GOAWAY, last local stream {}, {:?}",
            self.last_local_stream, code
        );
        self.write_frame(Frame::GoAway {
            last_stream: self.last_local_stream,
            error: code,
            debug: Bytes::new(),
        })?;
        self.flush().await
    }

    fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        trace!("send {:?}", frame);
        frame.encode(&mut self.write_buf, self.flow.settings().max_frame_size)?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if !self.write_buf.is_empty() {
            self.socket.write_all(&self.write_buf).await?;
            self.socket.flush().await?;
            self.write_buf.clear();
        }
        Ok(())
    }

    fn fail_in_flight(&mut self) {
        for (_, mut stream) in self.streams.drain() {
            stream.fail(Error::Closed);
        }
        while let Some(pending) = self.flow.pop_pending() {
            pending.response_tx.send(Err(Error::Closed)).ok();
        }
        self.pending_pings.clear();
    }

    fn emit(&self, event: ConnectionEvent) {
        self.events.send(event).ok();
    }
}
