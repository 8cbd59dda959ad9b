use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::frame::{
    CancelledParams, Frame, METHOD_CALL_TOOL, METHOD_CANCELLED, METHOD_NOT_FOUND,
    METHOD_PING, Request, RequestId, Response, RpcError,
};
use crate::error::Error;

type Reply = Result<Value, Error>;

#[derive(Default)]
struct Shared {
    pending: HashMap<RequestId, oneshot::Sender<Reply>>,
    broken: Option<Error>,
}

impl Shared {
    /// Fails every pending request and refuses new ones. Only the first
    /// reason is kept.
    fn fail(&mut self, reason: Error) {
        if self.broken.is_some() {
            return;
        }
        for (_, tx) in self.pending.drain() {
            tx.send(Err(reason.clone())).ok();
        }
        self.broken = Some(reason);
    }
}

/// A bidirectional JSON-RPC channel over a byte stream.
///
/// Frames are written by a dedicated task in submission order. Another
/// task reads incoming lines and routes responses to their requests by
/// id. Any malformed line, read failure or end of stream breaks the
/// channel: in-flight requests fail with a transport error and so does
/// every later submission.
pub(crate) struct Channel {
    name: Arc<str>,
    shared: Arc<Mutex<Shared>>,
    outgoing: mpsc::UnboundedSender<String>,
    reader_task: JoinHandle<()>,
}

impl Channel {
    pub fn new<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name);
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_frames(
            writer,
            outgoing_rx,
            Arc::clone(&shared),
            Arc::clone(&name),
        ));
        let reader_task = tokio::spawn(read_frames(
            reader,
            outgoing.clone(),
            Arc::clone(&shared),
            Arc::clone(&name),
        ));

        Self {
            name,
            shared,
            outgoing,
            reader_task,
        }
    }

    /// Queues a request for writing and returns a handle to its response.
    ///
    /// The request is queued before this method returns, so requests
    /// submitted one after another are written in that order.
    pub fn submit(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingReply, Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock();
            if let Some(reason) = &shared.broken {
                return Err(reason.clone());
            }
            if shared.pending.contains_key(&id) {
                return Err(Error::tool_execution()
                    .with_reason(format!("request `{id}` is already in flight")));
            }
            shared.pending.insert(id.clone(), tx);
            let line = Frame::Request(Request::new(id.clone(), method, params))
                .to_line();
            if self.outgoing.send(line).is_err() {
                shared.pending.remove(&id);
                let reason =
                    Error::transport().with_reason("channel writer has stopped");
                shared.fail(reason.clone());
                return Err(reason);
            }
        }
        trace!("[{}] submitted `{method}` as {id}", self.name);

        let cancel = (method == METHOD_CALL_TOOL).then(|| self.outgoing.clone());
        Ok(PendingReply {
            id,
            rx,
            shared: Arc::clone(&self.shared),
            cancel,
        })
    }

    /// Sends a notification, which has no response.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        if let Some(reason) = &self.shared.lock().broken {
            return Err(reason.clone());
        }
        let line = Frame::Request(Request::notification(method, params)).to_line();
        self.outgoing
            .send(line)
            .map_err(|_| Error::transport().with_reason("channel writer has stopped"))
    }

    /// Returns the reason this channel broke, if it did.
    pub fn broken(&self) -> Option<Error> {
        self.shared.lock().broken.clone()
    }

    /// Breaks the channel on purpose.
    pub fn close(&self, reason: Error) {
        self.shared.lock().fail(reason);
        self.reader_task.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// The response slot of a submitted request.
///
/// Dropping it before the response arrives forgets the request, and a
/// late response is then discarded by the reader. An abandoned tool call
/// is also cancelled on the server, so that it stops working on it.
pub(crate) struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
    shared: Arc<Mutex<Shared>>,
    cancel: Option<mpsc::UnboundedSender<String>>,
}

impl PendingReply {
    pub async fn wait(mut self) -> Result<Value, Error> {
        match (&mut self.rx).await {
            Ok(reply) => reply,
            Err(_) => Err(Error::transport().with_reason("channel closed")),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let abandoned = {
            let mut shared = self.shared.lock();
            shared.pending.remove(&self.id).is_some() && shared.broken.is_none()
        };
        let Some(outgoing) = self.cancel.take().filter(|_| abandoned) else {
            return;
        };
        let params = CancelledParams {
            request_id: self.id.clone(),
            reason: Some("the caller stopped waiting".to_owned()),
        };
        let line = Frame::Request(Request::notification(
            METHOD_CANCELLED,
            serde_json::to_value(params).ok(),
        ))
        .to_line();
        trace!("cancelling abandoned request {}", self.id);
        outgoing.send(line).ok();
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: Arc<Mutex<Shared>>,
    name: Arc<str>,
) {
    while let Some(line) = outgoing.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!("[{name}] failed to write a frame: {err}");
            shared
                .lock()
                .fail(Error::transport().with_reason(format!("write failed: {err}")));
            return;
        }
    }
    trace!("[{name}] writer finished");
}

async fn read_frames<R: AsyncRead + Unpin>(
    reader: R,
    outgoing: mpsc::UnboundedSender<String>,
    shared: Arc<Mutex<Shared>>,
    name: Arc<str>,
) {
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                break Error::transport().with_reason("tool server closed the channel");
            }
            Err(err) => {
                break Error::transport().with_reason(format!("read failed: {err}"));
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Frame::parse(&line) {
            Ok(Frame::Response(resp)) => dispatch_response(&shared, resp, &name),
            Ok(Frame::Request(req)) => answer_server_request(&outgoing, req, &name),
            Err(err) => break err,
        }
    };
    warn!("[{name}] channel broke: {reason}");
    shared.lock().fail(reason);
}

fn dispatch_response(shared: &Mutex<Shared>, resp: Response, name: &str) {
    let Some(id) = resp.id else {
        warn!("[{name}] got a response without id: {:?}", resp.error);
        return;
    };
    let Some(tx) = shared.lock().pending.remove(&id) else {
        debug!("[{name}] discarding response to unknown or abandoned request {id}");
        return;
    };
    let reply = match (resp.result, resp.error) {
        (_, Some(error)) => Err(Error::tool_execution()
            .with_reason(error.message)
            .with_code(error.code)),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    };
    tx.send(reply).ok();
}

fn answer_server_request(
    outgoing: &mpsc::UnboundedSender<String>,
    req: Request,
    name: &str,
) {
    let Some(id) = req.id else {
        debug!("[{name}] got notification `{}`", req.method);
        return;
    };
    let resp = if req.method == METHOD_PING {
        Response::success(Some(id), json!({}))
    } else {
        debug!("[{name}] rejecting server request `{}`", req.method);
        Response::failure(
            Some(id),
            RpcError::new(METHOD_NOT_FOUND, format!("method `{}` is not supported", req.method)),
        )
    };
    outgoing.send(Frame::Response(resp).to_line()).ok();
}
