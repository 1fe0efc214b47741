//! Scripted HTTP client.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tidemark_sync_engine::{
    HttpClient, HttpRequest, LineStream, SyncError, SyncResult, SYNC_STREAM_PATH,
    WRITE_CHECKPOINT_PATH,
};
use tokio::sync::{mpsc, watch};

/// Answer to one streaming request.
pub enum StreamScript {
    /// Serve `lines`, then end the body unless `keep_open` is set.
    Lines {
        /// Lines to serve.
        lines: Vec<String>,
        /// Keep the body open after the last line.
        keep_open: bool,
    },
    /// Fail the request with an HTTP status.
    Status {
        /// Status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Fail the request with a transport error.
    Unreachable(String),
    /// Serve lines pushed through a channel until its sender is dropped.
    Channel(mpsc::UnboundedReceiver<String>),
}

impl StreamScript {
    /// Lines followed by the end of the body.
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamScript::Lines {
            lines: lines.into_iter().map(Into::into).collect(),
            keep_open: false,
        }
    }

    /// Lines followed by a body that never ends.
    pub fn lines_then_open<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamScript::Lines {
            lines: lines.into_iter().map(Into::into).collect(),
            keep_open: true,
        }
    }

    /// A stream fed from the returned sender.
    pub fn channel() -> (mpsc::UnboundedSender<String>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, StreamScript::Channel(receiver))
    }

    fn into_result(self) -> SyncResult<LineStream> {
        match self {
            StreamScript::Lines { lines, keep_open } => {
                let served = stream::iter(lines.into_iter().map(Ok));
                if keep_open {
                    Ok(served.chain(stream::pending()).boxed())
                } else {
                    Ok(served.boxed())
                }
            }
            StreamScript::Status { status, body } if status == 401 => {
                Err(SyncError::Unauthorized(body))
            }
            StreamScript::Status { status, body } => Err(SyncError::Http { status, body }),
            StreamScript::Unreachable(message) => Err(SyncError::transport(message)),
            StreamScript::Channel(receiver) => Ok(stream::unfold(receiver, |mut receiver| async {
                receiver.recv().await.map(|line| (Ok(line), receiver))
            })
            .boxed()),
        }
    }
}

/// [`HttpClient`] answering from scripts and recording every request.
///
/// Streaming requests without a script stay open without sending lines.
pub struct ScriptedHttpClient {
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<HttpRequest>>,
    write_checkpoint: Mutex<Option<String>>,
    stream_count: watch::Sender<usize>,
}

impl ScriptedHttpClient {
    /// Creates a client without scripts that serves write checkpoint `"1"`.
    pub fn new() -> Self {
        let (stream_count, _) = watch::channel(0);
        Self {
            streams: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            write_checkpoint: Mutex::new(Some("1".to_string())),
            stream_count,
        }
    }

    /// Queues the answer to the next streaming request.
    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().push_back(script);
    }

    /// Sets the write checkpoint served, or makes the lookup fail with `None`.
    pub fn set_write_checkpoint(&self, checkpoint: Option<&str>) {
        *self.write_checkpoint.lock() = checkpoint.map(str::to_string);
    }

    /// Every request so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Streaming sync requests so far.
    pub fn stream_requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.ends_with(SYNC_STREAM_PATH))
            .cloned()
            .collect()
    }

    /// Write checkpoint lookups so far.
    pub fn write_checkpoint_requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(WRITE_CHECKPOINT_PATH))
            .cloned()
            .collect()
    }

    /// Waits until at least `count` streaming requests were made.
    pub async fn wait_for_streams(&self, count: usize) {
        let mut receiver = self.stream_count.subscribe();
        let _ = receiver.wait_for(|seen| *seen >= count).await;
    }
}

impl Default for ScriptedHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn post_stream(&self, request: HttpRequest) -> SyncResult<LineStream> {
        self.requests.lock().push(request);
        let script = self.streams.lock().pop_front();
        self.stream_count.send_modify(|count| *count += 1);
        match script {
            Some(script) => script.into_result(),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn get(&self, request: HttpRequest) -> SyncResult<Vec<u8>> {
        let is_checkpoint = request.url.contains(WRITE_CHECKPOINT_PATH);
        self.requests.lock().push(request);
        if !is_checkpoint {
            return Err(SyncError::Http {
                status: 404,
                body: "not found".to_string(),
            });
        }
        let checkpoint = self.write_checkpoint.lock().clone();
        match checkpoint {
            Some(checkpoint) => Ok(serde_json::to_vec(&serde_json::json!({
                "data": { "write_checkpoint": checkpoint }
            }))?),
            None => Err(SyncError::transport("write checkpoint unavailable")),
        }
    }
}
