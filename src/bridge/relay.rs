//! Byte relays between the SSH session and the exec stream.
//!
//! Both directions are plain copies; the only policy lives in how output
//! chunks are routed:
//!
//! | Mode          | Used for  | Stdout chunk | Stderr chunk | Console chunk |
//! |---------------|-----------|--------------|--------------|---------------|
//! | `Passthrough` | TTY execs | stdout       | stdout       | stdout        |
//! | `Demux`       | plain     | stdout       | stderr       | stdout        |

use crate::error::{Error, RelayDirection, Result};
use crate::runtime::{OutputChunk, OutputStream};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// How output chunks are routed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Terminal semantics: everything goes to the session's stdout.
    Passthrough,
    /// Stdout and stderr frames go to their own session channels.
    Demux,
}

impl RelayMode {
    /// Mode for an exec with or without a TTY.
    pub fn for_tty(tty: bool) -> Self {
        if tty { Self::Passthrough } else { Self::Demux }
    }
}

fn input_error(source: std::io::Error) -> Error {
    Error::Relay {
        direction: RelayDirection::Input,
        source,
    }
}

fn output_error(source: std::io::Error) -> Error {
    Error::Relay {
        direction: RelayDirection::Output,
        source,
    }
}

/// Copies session input into the exec until the session's input ends.
///
/// The exec's write side is shut down afterwards, also after a failed copy,
/// so the command sees EOF on stdin exactly once. The read side of the exec
/// stream is untouched. Returns the number of bytes copied.
pub async fn relay_input<R, W>(mut session_input: R, mut exec_input: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut session_input, &mut exec_input).await;
    let closed = exec_input.shutdown().await;
    let copied = copied.map_err(input_error)?;
    closed.map_err(input_error)?;
    Ok(copied)
}

/// Copies exec output to the session until the exec stream ends.
///
/// The first read or write error ends the relay. Returns the number of
/// bytes delivered.
pub async fn relay_output<O, E>(
    mode: RelayMode,
    mut output: OutputStream,
    mut stdout: O,
    mut stderr: E,
) -> Result<u64>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut delivered = 0u64;
    while let Some(chunk) = output.next().await {
        let chunk = chunk.map_err(output_error)?;
        let sink_is_stderr = mode == RelayMode::Demux && matches!(chunk, OutputChunk::Stderr(_));
        let bytes = chunk.bytes();
        if sink_is_stderr {
            stderr.write_all(bytes).await.map_err(output_error)?;
        } else {
            stdout.write_all(bytes).await.map_err(output_error)?;
        }
        delivered += bytes.len() as u64;
    }
    stdout.flush().await.map_err(output_error)?;
    stderr.flush().await.map_err(output_error)?;
    Ok(delivered)
}
