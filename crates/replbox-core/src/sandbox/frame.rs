//! Demultiplexed exec output
//!
//! A non-tty exec interleaves the process's stdout and stderr on one
//! connection. The engine client splits that stream into [`Frame`]s tagged
//! with the stream they came from; sessions only ever see frames.

use bollard::container::LogOutput;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::error::SandboxError;

/// Which process stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

/// One demultiplexed chunk of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn stdout(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: StreamKind::Stderr,
            payload: payload.into(),
        }
    }
}

impl From<LogOutput> for Frame {
    fn from(output: LogOutput) -> Self {
        match output {
            LogOutput::StdOut { message } => Frame::stdout(message.to_vec()),
            LogOutput::StdErr { message } => Frame::stderr(message.to_vec()),
            LogOutput::StdIn { message } => Frame {
                kind: StreamKind::Stdin,
                payload: message.to_vec(),
            },
            // Only produced for tty execs, which carry no stream tag
            LogOutput::Console { message } => Frame::stdout(message.to_vec()),
        }
    }
}

/// Output side of an exec channel. Ends when the process closes its output.
pub type FrameStream = BoxStream<'static, Result<Frame, SandboxError>>;

/// Drain a stream to its end, concatenating stdout and stderr payloads in
/// arrival order
pub async fn collect_output(mut frames: FrameStream) -> Result<Vec<u8>, SandboxError> {
    let mut output = Vec::new();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if frame.kind != StreamKind::Stdin {
            output.extend_from_slice(&frame.payload);
        }
    }
    Ok(output)
}
