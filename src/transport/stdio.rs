use super::codec::{decode_text, encode_line};
use super::framing::LineFramer;
use super::pending::RequestTable;
use super::{
    DEFAULT_REQUEST_TIMEOUT, ToolRequest, ToolResponse, Transport, TransportFuture, TransportKind,
};
use crate::error::TransportError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 8 * 1024;
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

enum Launch {
    Command(StdioCommand),
    /// Pre-opened streams; usable for exactly one connection.
    Streams(Mutex<Option<(BoxedReader, BoxedWriter)>>),
}

struct Connection {
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    child: Option<Child>,
}

/// Newline-delimited JSON over a child process's stdin/stdout.
pub struct StdioTransport {
    name: String,
    launch: Launch,
    timeout: Duration,
    table: Arc<RequestTable>,
    connected: Arc<AtomicBool>,
    connection: Mutex<Option<Connection>>,
}

impl StdioTransport {
    pub fn new(name: impl Into<String>, command: StdioCommand, timeout: Duration) -> Self {
        Self::with_launch(name.into(), Launch::Command(command), timeout)
    }

    /// Wrap already-open byte streams instead of spawning a process.
    pub fn from_streams<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let streams: (BoxedReader, BoxedWriter) = (Box::new(reader), Box::new(writer));
        Self::with_launch(
            name.into(),
            Launch::Streams(Mutex::new(Some(streams))),
            timeout,
        )
    }

    fn with_launch(name: String, launch: Launch, timeout: Duration) -> Self {
        Self {
            name,
            launch,
            timeout: if timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                timeout
            },
            table: Arc::new(RequestTable::new()),
            connected: Arc::new(AtomicBool::new(false)),
            connection: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    fn open_streams(&self) -> Result<(BoxedReader, BoxedWriter, Option<Child>), TransportError> {
        match &self.launch {
            Launch::Streams(slot) => {
                let (reader, writer) = slot
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .take()
                    .ok_or_else(|| {
                        TransportError::Connect("stream pair already consumed".to_string())
                    })?;
                Ok((reader, writer, None))
            }
            Launch::Command(launch) => {
                let mut child = Command::new(&launch.command)
                    .args(&launch.args)
                    .envs(&launch.env)
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|error| {
                        TransportError::Process(format!("spawn '{}': {error}", launch.command))
                    })?;

                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| TransportError::Process("child stdin unavailable".into()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| TransportError::Process("child stdout unavailable".into()))?;
                if let Some(stderr) = child.stderr.take() {
                    spawn_stderr_logger(self.name.clone(), stderr);
                }

                Ok((Box::new(stdout), Box::new(stdin), Some(child)))
            }
        }
    }

    fn take_connection(&self) -> Option<Connection> {
        self.connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn outbound(&self) -> Result<mpsc::Sender<String>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|connection| connection.outbound.clone())
            .ok_or(TransportError::NotConnected)
    }

    async fn teardown(&self, connection: Option<Connection>) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut connection) = connection {
            drop(connection.outbound);
            connection.reader.abort();
            connection.writer.abort();
            if let Some(child) = connection.child.as_mut()
                && let Err(error) = child.kill().await
            {
                tracing::debug!(server = %self.name, %error, "child already exited");
            }
        }
        self.table.fail_all(&TransportError::ConnectionClosed);
    }
}

impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn connect(&self) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.connected.load(Ordering::SeqCst) {
                return Ok(());
            }
            // A previous connection may have ended on EOF; clear its leftovers.
            let stale = self.take_connection();
            if stale.is_some() {
                self.teardown(stale).await;
            }

            let (reader, writer, child) = self.open_streams()?;
            let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

            self.connected.store(true, Ordering::SeqCst);
            let reader = spawn_reader(
                self.name.clone(),
                reader,
                Arc::clone(&self.table),
                Arc::clone(&self.connected),
            );
            let writer = spawn_writer(self.name.clone(), writer, outbound_rx);

            *self
                .connection
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Connection {
                outbound,
                reader,
                writer,
                child,
            });

            tracing::info!(server = %self.name, "stdio transport connected");
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let connection = self.take_connection();
            self.teardown(connection).await;
            tracing::info!(server = %self.name, "stdio transport disconnected");
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(
        &self,
        request: ToolRequest,
    ) -> TransportFuture<'_, Result<ToolResponse, TransportError>> {
        Box::pin(async move {
            let outbound = self.outbound()?;
            let line = encode_line(&request);
            self.table
                .round_trip(&request.id, self.timeout, async move {
                    outbound
                        .send(line)
                        .await
                        .map_err(|_| TransportError::Send("stdio writer closed".to_string()))
                })
                .await
        })
    }
}

fn spawn_reader(
    name: String,
    mut reader: BoxedReader,
    table: Arc<RequestTable>,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut framer = LineFramer::new();
        let mut chunk = vec![0_u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    tracing::info!(server = %name, "stdio stream reached EOF");
                    break;
                }
                Ok(read) => {
                    for frame in framer.push(&chunk[..read]) {
                        if let Some(response) = decode_text(&frame) {
                            table.complete(response);
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(server = %name, %error, "stdio read failed");
                    break;
                }
            }
        }
        connected.store(false, Ordering::SeqCst);
        table.fail_all(&TransportError::ConnectionClosed);
    })
}

fn spawn_writer(
    name: String,
    mut writer: BoxedWriter,
    mut outbound: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut line) = outbound.recv().await {
            line.push('\n');
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            };
            if let Err(error) = written.await {
                tracing::warn!(server = %name, %error, "stdio write failed");
                break;
            }
        }
    })
}

fn spawn_stderr_logger(name: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, stderr = %line, "server stderr");
        }
    });
}
