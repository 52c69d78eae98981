use anyhow::{Context, Result};
use futures::stream;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachParams;
use serde_json::Value;
use std::future::Future;
use std::io::{self, Cursor, Read};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::k8s::KubeGateway;

const END_OF_TRANSMISSION: u8 = 0x04;
const SUCCESS: &str = "Success";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Inherit,
    Text,
    Json,
}

pub enum ExecInput {
    Bytes(Vec<u8>),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl ExecInput {
    /// Local stdin, read on a dedicated thread so a pending read never holds
    /// up runtime shutdown.
    pub fn stdin() -> Self {
        Self::from_blocking(std::io::stdin())
    }

    pub fn from_blocking<R>(mut reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        let (chunks_tx, mut chunks_rx) = mpsc::channel::<io::Result<Cursor<Vec<u8>>>>(8);
        std::thread::spawn(move || {
            let mut buffer = vec![0; 8 * 1024];
            loop {
                let chunk = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(read) => Ok(Cursor::new(buffer[..read].to_vec())),
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => Err(error),
                };
                let failed = chunk.is_err();
                if chunks_tx.blocking_send(chunk).is_err() || failed {
                    break;
                }
            }
        });
        let chunks = stream::poll_fn(move |cx| chunks_rx.poll_recv(cx));
        Self::Reader(Box::new(StreamReader::new(chunks)))
    }
}

impl From<&str> for ExecInput {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ExecInput {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

pub struct ExecOptions {
    container: Option<String>,
    input: Option<ExecInput>,
    output: OutputMode,
    input_end_delay: Duration,
    cancel: CancellationToken,
}

impl ExecOptions {
    pub fn new(output: OutputMode, input_end_delay: Duration) -> Self {
        Self {
            container: None,
            input: None,
            output,
            input_end_delay,
            cancel: CancellationToken::new(),
        }
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn input(mut self, input: impl Into<ExecInput>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn attach_params(&self) -> AttachParams {
        let interactive = self.input.is_some();
        let params = AttachParams::default()
            .stdin(interactive)
            .stdout(true)
            .stderr(!interactive)
            .tty(interactive);
        match self.container.as_deref() {
            Some(container) => params.container(container),
            None => params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutput {
    Cancelled,
    Inherited,
    Text(String),
    Json(Value),
}

impl ExecOutput {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub struct SessionStreams<W, R, E, F> {
    pub stdin: Option<W>,
    pub stdout: Option<R>,
    pub stderr: Option<E>,
    pub status: Option<F>,
}

impl KubeGateway {
    pub async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        let params = options.attach_params();
        info!(namespace, pod, command = ?command, tty = params.tty, "opening exec session");

        let mut attached = self
            .api::<Pod>(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .with_context(|| format!("failed to exec in pod {namespace}/{pod}"))?;

        let streams = SessionStreams {
            stdin: attached.stdin(),
            stdout: attached.stdout(),
            stderr: attached.stderr(),
            status: attached.take_status(),
        };
        let ExecOptions {
            input,
            output,
            input_end_delay,
            cancel,
            ..
        } = options;

        let result = drive_session(pod, streams, input, output, input_end_delay, &cancel).await;
        match &result {
            Ok(ExecOutput::Cancelled) | Err(_) => attached.abort(),
            Ok(_) => attached
                .join()
                .await
                .with_context(|| format!("exec session on {namespace}/{pod} did not close cleanly"))?,
        }
        debug!(namespace, pod, "exec session closed");
        result
    }
}

/// Feeds input, collects output and checks the terminal status. Cancellation
/// wins over everything else and discards whatever was captured.
pub async fn drive_session<W, R, E, F>(
    pod: &str,
    streams: SessionStreams<W, R, E, F>,
    input: Option<ExecInput>,
    output: OutputMode,
    input_end_delay: Duration,
    cancel: &CancellationToken,
) -> Result<ExecOutput>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
    E: AsyncRead + Unpin + Send,
    F: Future<Output = Option<Status>> + Send,
{
    let SessionStreams {
        stdin,
        stdout,
        stderr,
        status,
    } = streams;

    let session = async {
        let (fed, captured, relayed) = tokio::join!(
            feed_input(stdin, input, input_end_delay),
            collect_stdout(stdout, output),
            relay_stderr(stderr),
        );
        fed?;
        relayed?;
        let captured = captured?;
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        Ok::<_, anyhow::Error>((captured, status))
    };

    let (captured, status) = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(pod, "exec cancelled");
            return Ok(ExecOutput::Cancelled);
        }
        result = session => result?,
    };

    check_status(pod, status)?;
    match output {
        OutputMode::Inherit => Ok(ExecOutput::Inherited),
        OutputMode::Text => Ok(ExecOutput::Text(
            String::from_utf8_lossy(&captured).into_owned(),
        )),
        OutputMode::Json => serde_json::from_slice(&captured)
            .map(ExecOutput::Json)
            .with_context(|| format!("output of exec on {pod} is not valid JSON")),
    }
}

/// Writes all input in order, then EOT, then holds the stream open for
/// `delay` before closing it so trailing remote output is not cut off.
async fn feed_input<W>(stdin: Option<W>, input: Option<ExecInput>, delay: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (Some(mut stdin), Some(input)) = (stdin, input) else {
        return Ok(());
    };

    match input {
        ExecInput::Bytes(bytes) => stdin.write_all(&bytes).await,
        ExecInput::Reader(mut reader) => tokio::io::copy(&mut reader, &mut stdin).await.map(drop),
    }
    .context("failed to write exec input")?;
    stdin
        .write_all(&[END_OF_TRANSMISSION])
        .await
        .context("failed to signal end of exec input")?;
    stdin.flush().await.context("failed to flush exec input")?;

    tokio::time::sleep(delay).await;
    stdin.shutdown().await.context("failed to close exec input")?;
    Ok(())
}

async fn collect_stdout<R>(stdout: Option<R>, output: OutputMode) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stdout) = stdout else {
        return Ok(Vec::new());
    };

    let mut captured = Vec::new();
    match output {
        OutputMode::Inherit => {
            tokio::io::copy(&mut stdout, &mut tokio::io::stdout())
                .await
                .context("failed to relay exec stdout")?;
        }
        OutputMode::Text | OutputMode::Json => {
            stdout
                .read_to_end(&mut captured)
                .await
                .context("failed to read exec stdout")?;
        }
    }
    Ok(captured)
}

async fn relay_stderr<E>(stderr: Option<E>) -> Result<()>
where
    E: AsyncRead + Unpin,
{
    if let Some(mut stderr) = stderr {
        tokio::io::copy(&mut stderr, &mut tokio::io::stderr())
            .await
            .context("failed to relay exec stderr")?;
    }
    Ok(())
}

fn check_status(pod: &str, status: Option<Status>) -> Result<(), GatewayError> {
    match status {
        None => {
            debug!(pod, "exec finished without a status");
            Ok(())
        }
        Some(status) if status.status.as_deref() == Some(SUCCESS) => Ok(()),
        Some(status) => Err(GatewayError::RemoteCommand {
            pod: pod.to_string(),
            status: Box::new(status),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecInput, ExecOptions, ExecOutput, OutputMode, SessionStreams, drive_session};
    use crate::error::GatewayError;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
    use serde_json::json;
    use std::future::{Ready, pending, ready};
    use std::io::{Cursor, Read};
    use std::sync::mpsc as std_mpsc;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio_util::sync::CancellationToken;

    fn success() -> Ready<Option<Status>> {
        ready(Some(Status {
            status: Some("Success".to_string()),
            ..Status::default()
        }))
    }

    fn streams_with_output(
        output: &[u8],
    ) -> SessionStreams<DuplexStream, DuplexStream, DuplexStream, Ready<Option<Status>>> {
        let (stdout, mut remote_stdout) = duplex(1024);
        let output = output.to_vec();
        tokio::spawn(async move {
            remote_stdout.write_all(&output).await.unwrap();
        });
        SessionStreams {
            stdin: None,
            stdout: Some(stdout),
            stderr: None,
            status: Some(success()),
        }
    }

    #[test]
    fn input_switches_to_interactive_tty() {
        let plain = ExecOptions::new(OutputMode::Text, Duration::ZERO).container("app");
        let params = plain.attach_params();
        assert!(!params.stdin && !params.tty && params.stderr);
        assert_eq!(params.container.as_deref(), Some("app"));

        let interactive = ExecOptions::new(OutputMode::Text, Duration::ZERO).input("1+1");
        let params = interactive.attach_params();
        assert!(params.stdin && params.tty && !params.stderr);
    }

    #[tokio::test]
    async fn text_output_is_buffered() {
        let output = drive_session(
            "web-1",
            streams_with_output(b"HOME=/root\nPATH=/bin\n"),
            None,
            OutputMode::Text,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output, ExecOutput::Text("HOME=/root\nPATH=/bin\n".to_string()));
    }

    #[tokio::test]
    async fn json_output_is_parsed_once_complete() {
        let output = drive_session(
            "web-1",
            streams_with_output(br#"{"users": [1, 2], "ok": true}"#),
            None,
            OutputMode::Json,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output, ExecOutput::Json(json!({ "users": [1, 2], "ok": true })));
    }

    #[tokio::test]
    async fn failure_status_is_a_typed_error() {
        let (stdout, remote_stdout) = duplex(64);
        drop(remote_stdout);
        let streams = SessionStreams::<DuplexStream, _, DuplexStream, _> {
            stdin: None,
            stdout: Some(stdout),
            stderr: None,
            status: Some(ready(Some(Status {
                status: Some("Failure".to_string()),
                reason: Some("NonZeroExitCode".to_string()),
                ..Status::default()
            }))),
        };

        let error = drive_session(
            "web-1",
            streams,
            None,
            OutputMode::Text,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        let gateway_error = error.downcast_ref::<GatewayError>().unwrap();
        let status = gateway_error.remote_status().unwrap();
        assert_eq!(status.reason.as_deref(), Some("NonZeroExitCode"));
    }

    #[tokio::test]
    async fn missing_status_counts_as_success() {
        let (stdout, mut remote_stdout) = duplex(64);
        remote_stdout.write_all(b"done").await.unwrap();
        drop(remote_stdout);
        let streams = SessionStreams::<DuplexStream, _, DuplexStream, _> {
            stdin: None,
            stdout: Some(stdout),
            stderr: None,
            status: Some(ready(None)),
        };

        let output = drive_session(
            "web-1",
            streams,
            None,
            OutputMode::Text,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output, ExecOutput::Text("done".to_string()));
    }

    #[tokio::test]
    async fn cancellation_resolves_neutrally_without_output() {
        let (stdout, mut remote_stdout) = duplex(64);
        remote_stdout.write_all(b"partial").await.unwrap();
        let streams = SessionStreams::<DuplexStream, _, DuplexStream, _> {
            stdin: None,
            stdout: Some(stdout),
            stderr: None,
            status: Some(pending::<Option<Status>>()),
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let output = drive_session(
            "web-1",
            streams,
            None,
            OutputMode::Text,
            Duration::ZERO,
            &cancel,
        )
        .await
        .unwrap();
        assert!(output.is_cancelled());
        // the remote side is still open; nothing was delivered
        drop(remote_stdout);
    }

    #[tokio::test]
    async fn output_written_within_the_grace_delay_is_captured() {
        let (stdin, mut remote_stdin) = duplex(1024);
        let (stdout, mut remote_stdout) = duplex(1024);

        // echoes its input, then emits a trailer shortly after EOT unless its
        // stdin is closed first
        let remote = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut chunk = [0u8; 64];
            while !received.contains(&0x04) {
                let read = remote_stdin.read(&mut chunk).await.unwrap();
                assert!(read > 0, "stdin closed before EOT");
                received.extend_from_slice(&chunk[..read]);
            }
            let echoed = received
                .iter()
                .copied()
                .filter(|byte| *byte != 0x04)
                .collect::<Vec<_>>();
            remote_stdout.write_all(&echoed).await.unwrap();

            let mut rest = Vec::new();
            tokio::select! {
                biased;
                _ = remote_stdin.read_to_end(&mut rest) => {}
                _ = tokio::time::sleep(Duration::from_millis(30)) => {
                    remote_stdout.write_all(b" trailer").await.unwrap();
                }
            }
            received
        });

        let streams = SessionStreams::<_, _, DuplexStream, _> {
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: None,
            status: Some(success()),
        };
        let output = drive_session(
            "web-1",
            streams,
            Some("console.log(1)".into()),
            OutputMode::Text,
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(output, ExecOutput::Text("console.log(1) trailer".to_string()));
        let received = remote.await.unwrap();
        assert_eq!(received.last(), Some(&0x04));
        assert_eq!(&received[..received.len() - 1], b"console.log(1)");
    }

    #[tokio::test]
    async fn reader_input_is_streamed_in_order() {
        let (stdin, mut remote_stdin) = duplex(16);
        let (stdout, remote_stdout) = duplex(16);
        let remote = tokio::spawn(async move {
            let mut received = Vec::new();
            remote_stdin.read_to_end(&mut received).await.unwrap();
            drop(remote_stdout);
            received
        });

        let source: &'static [u8] = b"line one\nline two\nline three\n";
        let streams = SessionStreams::<_, _, DuplexStream, _> {
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: None,
            status: Some(success()),
        };
        drive_session(
            "web-1",
            streams,
            Some(super::ExecInput::Reader(Box::new(source))),
            OutputMode::Text,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let received = remote.await.unwrap();
        assert_eq!(received, b"line one\nline two\nline three\n\x04");
    }

    struct StuckReader(std_mpsc::Receiver<()>);

    impl Read for StuckReader {
        fn read(&mut self, _buffer: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[tokio::test]
    async fn blocking_readers_are_streamed_in_order() {
        let ExecInput::Reader(mut reader) =
            ExecInput::from_blocking(Cursor::new(b"first line\nsecond line\n".to_vec()))
        else {
            panic!("expected a reader");
        };
        let mut received = String::new();
        reader.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "first line\nsecond line\n");
    }

    #[test]
    fn pending_blocking_read_does_not_hold_up_runtime_shutdown() {
        let (_keep_blocked, blocked) = std_mpsc::channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let ExecInput::Reader(mut reader) = ExecInput::from_blocking(StuckReader(blocked))
            else {
                panic!("expected a reader");
            };
            let mut buffer = [0; 16];
            let read = tokio::time::timeout(Duration::from_millis(50), reader.read(&mut buffer)).await;
            assert!(read.is_err());
        });

        let started = Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
