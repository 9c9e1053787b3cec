//! Channel-based owner for async callers.
//!
//! A [`Connection`] is single-threaded and its waits block. To use one from
//! async code, move it onto a dedicated thread and talk to that thread
//! through messages:
//!
//! ```text
//! async callers ── mpsc<Request> ──> owner thread (Connection + EventBase)
//!               <── oneshot reply ──┘
//! ```
//!
//! Requests are served one at a time in arrival order. Dropping every handle
//! closes the connection and ends the thread.

use std::thread;

use busline_proto::Message;
use tokio::sync::{mpsc, oneshot};

use crate::{connection::Connection, error::ConnectionError};

const REQUEST_QUEUE: usize = 64;

enum Request {
    Call { message: Message, reply: oneshot::Sender<Result<Message, ConnectionError>> },
    Send { message: Message, reply: oneshot::Sender<Result<u32, ConnectionError>> },
    Drain { reply: oneshot::Sender<Vec<Message>> },
    Shutdown { reply: oneshot::Sender<Result<(), ConnectionError>> },
}

/// Cloneable handle to a connection owned by its own thread.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    requests: mpsc::Sender<Request>,
}

impl ConnectionHandle {
    /// Start the owner thread and build the connection on it with `open`.
    ///
    /// `open` runs on the owner thread, so the connection and its event base
    /// never cross threads.
    ///
    /// # Errors
    ///
    /// Whatever `open` returns, or [`ConnectionError::Transport`] if the
    /// thread cannot be spawned.
    pub async fn spawn<F>(open: F) -> Result<Self, ConnectionError>
    where
        F: FnOnce() -> Result<Connection, ConnectionError> + Send + 'static,
    {
        let (requests, inbox) = mpsc::channel(REQUEST_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new().name("busline-connection".to_string()).spawn(move || {
            let connection = match open() {
                Ok(connection) => connection,
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                    return;
                },
            };

            if ready_tx.send(Ok(())).is_ok() {
                serve(connection, inbox);
            }
        })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { requests }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    /// Send `message` with a fresh serial and wait for its reply.
    ///
    /// # Errors
    ///
    /// Anything [`Connection::call`] returns, or [`ConnectionError::Closed`]
    /// if the owner thread is gone.
    pub async fn call(&self, message: Message) -> Result<Message, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Call { message, reply }).await?;
        response.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Send `message` with a fresh serial and return the serial.
    ///
    /// # Errors
    ///
    /// Anything [`Connection::send_request`] returns, or
    /// [`ConnectionError::Closed`] if the owner thread is gone.
    pub async fn send(&self, message: Message) -> Result<u32, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Send { message, reply }).await?;
        response.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Take every message queued on the connection.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] if the owner thread is gone.
    pub async fn drain_pending(&self) -> Result<Vec<Message>, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Drain { reply }).await?;
        response.await.map_err(|_| ConnectionError::Closed)
    }

    /// Close the connection and stop the owner thread.
    ///
    /// Other clones of this handle get [`ConnectionError::Closed`] afterwards.
    ///
    /// # Errors
    ///
    /// The error from [`Connection::close`], or [`ConnectionError::Closed`]
    /// if the owner thread was already gone.
    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Shutdown { reply }).await?;
        response.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Whether the owner thread has stopped
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    async fn request(&self, request: Request) -> Result<(), ConnectionError> {
        self.requests.send(request).await.map_err(|_| ConnectionError::Closed)
    }
}

fn serve(mut connection: Connection, mut inbox: mpsc::Receiver<Request>) {
    tracing::debug!(address = %connection.server_address(), "connection owner started");

    while let Some(request) = inbox.blocking_recv() {
        match request {
            Request::Call { message, reply } => {
                let _ = reply.send(connection.call(message));
            },
            Request::Send { message, reply } => {
                let _ = reply.send(connection.send_request(message));
            },
            Request::Drain { reply } => {
                let _ = reply.send(connection.drain_pending());
            },
            Request::Shutdown { reply } => {
                let _ = reply.send(connection.close());
                break;
            },
        }
    }

    inbox.close();
    if let Err(error) = connection.close() {
        tracing::warn!(%error, "connection owner failed to close");
    }
    tracing::debug!(address = %connection.server_address(), "connection owner stopped");
}
