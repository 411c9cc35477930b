use crate::{flags::*, frame::Priority, hpack::HeaderCodec, response::Response, types::*};
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use log::{trace, warn};
use std::num::NonZeroU32;
use tokio::sync::oneshot;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum StreamState {
    Idle,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Which kind of header block an unfinished CONTINUATION sequence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuing {
    Headers,
    PushPromise,
}

/// What a dispatched frame did to the stream, for the connection to act on.
#[derive(Debug)]
pub(crate) enum StreamSignal {
    /// Both directions are done; the stream id can be released.
    Finished,
    /// A pushed stream finished assembling its promised request headers.
    PromiseHeaders(Headers),
}

/// One logical request/response exchange, client role.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Stream {
    pub id: NonZeroStreamId,
    pub request_id: usize,
    state: StreamState,
    pub send_window: i32,
    pub recv_window: i32,
    continuing: Option<Continuing>,
    recv_end_stream: bool,
    priority: Option<Priority>,
    headers_buffer: BytesMut,
    body_buffer: BytesMut,
    response_headers: Headers,
    #[derivative(Debug = "ignore")]
    pub response_tx: Option<oneshot::Sender<Result<Response, Error>>>,
    pending_body: Option<Bytes>,
}

impl Stream {
    pub fn new(id: NonZeroStreamId, request_id: usize, send_window: i32, recv_window: i32) -> Self {
        Self {
            id,
            request_id,
            state: StreamState::Idle,
            send_window,
            recv_window,
            continuing: None,
            recv_end_stream: false,
            priority: None,
            headers_buffer: BytesMut::new(),
            body_buffer: BytesMut::new(),
            response_headers: Headers::new(),
            response_tx: None,
            pending_body: None,
        }
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            trace!("stream {} {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn awaiting_continuation(&self) -> bool {
        self.continuing.is_some()
    }

    /// Sending HEADERS opens the stream.
    pub fn open_send(&mut self) {
        if self.state == StreamState::Idle {
            self.set_state(StreamState::Open);
        }
    }

    /// A PUSH_PROMISE reserves the promised stream on the remote side.
    pub fn reserve_remote(&mut self) {
        if self.state == StreamState::Idle {
            self.set_state(StreamState::ReservedRemote);
        }
    }

    /// Local END_STREAM was written to the wire.
    pub fn sent_end_stream(&mut self) {
        match self.state {
            StreamState::Open => self.set_state(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.set_state(StreamState::Closed),
            _ => {}
        }
    }

    /// Stashes a request body to be sent as the windows allow.
    pub fn queue_body(&mut self, body: Bytes) {
        if !body.is_empty() {
            self.pending_body = Some(body);
        }
    }

    pub fn has_pending_body(&self) -> bool {
        self.pending_body.is_some()
    }

    /// Carves the next DATA payload out of the queued body, debiting the
    /// stream send window. Returns the chunk and whether it is the last one.
    pub fn next_chunk(&mut self, budget: u32) -> Option<(Bytes, bool)> {
        if budget == 0 {
            return None;
        }
        let body = self.pending_body.as_mut()?;
        let take = body.len().min(budget as usize);
        let chunk = body.split_to(take);
        self.send_window -= chunk.len() as i32;
        let done = body.is_empty();
        if done {
            self.pending_body = None;
            self.sent_end_stream();
        }
        Some((chunk, done))
    }

    pub fn on_data(&mut self, flags: DataFlags, data: Bytes) -> Option<StreamSignal> {
        // the engine replenishes this right after via WINDOW_UPDATE
        self.recv_window -= data.len() as i32;
        if self.recv_window < 0 {
            warn!(
                "stream {} receive window at {} after {} octets",
                self.id,
                self.recv_window,
                data.len()
            );
        }
        self.body_buffer.extend_from_slice(&data);
        if flags.contains(DataFlags::END_STREAM) {
            self.finish_recv()
        } else {
            None
        }
    }

    pub fn on_headers(
        &mut self,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: &[u8],
        codec: &mut HeaderCodec,
    ) -> Result<Option<StreamSignal>, Error> {
        if priority.is_some() {
            self.priority = priority;
        }
        match self.state {
            StreamState::Idle => self.set_state(StreamState::Open),
            StreamState::ReservedRemote => self.set_state(StreamState::HalfClosedLocal),
            _ => {}
        }
        if flags.contains(HeadersFlags::END_STREAM) {
            self.recv_end_stream = true;
        }
        self.headers_buffer.extend_from_slice(fragment);
        if flags.contains(HeadersFlags::END_HEADERS) {
            let headers = self.decode_headers(codec)?;
            self.response_headers.extend(headers);
            if self.recv_end_stream {
                return Ok(self.finish_recv());
            }
        } else {
            self.continuing = Some(Continuing::Headers);
        }
        Ok(None)
    }

    pub fn on_push_promise(
        &mut self,
        flags: PushPromiseFlags,
        fragment: &[u8],
        codec: &mut HeaderCodec,
    ) -> Result<Option<StreamSignal>, Error> {
        self.reserve_remote();
        self.headers_buffer.extend_from_slice(fragment);
        if flags.contains(PushPromiseFlags::END_HEADERS) {
            let headers = self.decode_headers(codec)?;
            Ok(Some(StreamSignal::PromiseHeaders(headers)))
        } else {
            self.continuing = Some(Continuing::PushPromise);
            Ok(None)
        }
    }

    pub fn on_continuation(
        &mut self,
        flags: ContinuationFlags,
        fragment: &[u8],
        codec: &mut HeaderCodec,
    ) -> Result<Option<StreamSignal>, Error> {
        let continuing = self
            .continuing
            .ok_or(Error::Protocol("CONTINUATION without an open header block"))?;
        self.headers_buffer.extend_from_slice(fragment);
        if !flags.contains(ContinuationFlags::END_HEADERS) {
            return Ok(None);
        }
        self.continuing = None;
        let headers = self.decode_headers(codec)?;
        match continuing {
            Continuing::Headers => {
                self.response_headers.extend(headers);
                if self.recv_end_stream {
                    return Ok(self.finish_recv());
                }
                Ok(None)
            }
            Continuing::PushPromise => Ok(Some(StreamSignal::PromiseHeaders(headers))),
        }
    }

    pub fn on_priority(&mut self, priority: Priority) {
        self.priority = Some(priority);
        trace!("stream {} priority {:?}", self.id, self.priority);
    }

    pub fn on_reset(&mut self, error: ErrorCode) -> Option<StreamSignal> {
        warn!("stream {} reset by peer: {:?}", self.id, error);
        self.fail(Error::Stream {
            id: self.id.get(),
            error,
        });
        self.set_state(StreamState::Closed);
        Some(StreamSignal::Finished)
    }

    /// Credits the stream send window from a WINDOW_UPDATE.
    pub fn on_window_update(&mut self, increment: NonZeroU32) -> Result<(), Error> {
        let updated = i64::from(self.send_window) + i64::from(increment.get());
        if updated > i64::from(U31_MAX) {
            return Err(Error::FlowControl("stream send window overflow"));
        }
        self.send_window = updated as i32;
        Ok(())
    }

    /// Fails the pending request, if any part of it is still in flight.
    pub fn fail(&mut self, error: Error) {
        if let Some(tx) = self.response_tx.take() {
            tx.send(Err(error)).ok();
        }
    }

    fn decode_headers(&mut self, codec: &mut HeaderCodec) -> Result<Headers, Error> {
        let headers = codec.decode(&self.headers_buffer)?;
        self.headers_buffer.clear();
        Ok(headers)
    }

    /// Remote END_STREAM: the response is complete, deliver it.
    fn finish_recv(&mut self) -> Option<StreamSignal> {
        match self.state {
            StreamState::Open => self.set_state(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal | StreamState::ReservedRemote => {
                self.set_state(StreamState::Closed);
            }
            _ => {}
        }
        self.deliver_response();
        if self.state == StreamState::Closed {
            Some(StreamSignal::Finished)
        } else {
            // the request body is still uploading; closed once it drains
            None
        }
    }

    fn deliver_response(&mut self) {
        if let Some(tx) = self.response_tx.take() {
            let response = Response {
                request_id: self.request_id,
                headers: self.response_headers.clone(),
                body: self.body_buffer.clone().freeze(),
            };
            trace!("stream {} response: {:#?}", self.id, response);
            // if the sender isn't interested in the response anymore, no need to error out hard
            tx.send(Ok(response)).ok();
        }
    }
}
