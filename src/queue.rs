use crate::{request::Request, response::Response, types::Error};
use log::trace;
use tokio::sync::{mpsc, oneshot};

/// A queued request together with the channel its response is delivered on.
pub(crate) struct PendingRequest {
    pub request: Request,
    pub response_tx: oneshot::Sender<Result<Response, Error>>,
}

pub(crate) fn channel() -> (mpsc::UnboundedSender<PendingRequest>, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        tx,
        QueueReceiver {
            rx,
            demand: 0,
            closed: false,
        },
    )
}

/// The connection side of the request queue.
///
/// The producer pushes eagerly; the connection only pulls while it has
/// demand, so admission stays bounded by the peer's stream limit. Demand
/// starts at zero and is first granted when the peer's settings arrive.
pub(crate) struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    demand: u64,
    closed: bool,
}

impl QueueReceiver {
    pub fn has_demand(&self) -> bool {
        self.demand > 0 && !self.closed
    }

    pub fn set_demand(&mut self, demand: u64) {
        if self.demand != demand {
            trace!("queue demand {} -> {}", self.demand, demand);
        }
        self.demand = demand;
    }

    /// Returns one unit of demand, e.g. when a stream slot frees up.
    pub fn grant(&mut self, units: u64) {
        self.demand = self.demand.saturating_add(units);
    }

    /// Waits for the next request, consuming one unit of demand. `None` means
    /// every producer handle is gone.
    pub async fn pull(&mut self) -> Option<PendingRequest> {
        match self.rx.recv().await {
            Some(pending) => {
                self.demand -= 1;
                Some(pending)
            }
            None => {
                self.closed = true;
                None
            }
        }
    }
}
