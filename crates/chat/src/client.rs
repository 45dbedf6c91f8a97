//! Terminal relay between a chatterbox server and the user.
//!
//! Server lines are copied to the output as they arrive. Input lines are
//! forwarded to the server, each terminated with `\n`. The relay ends when the
//! server closes the connection or sends a bare `exit` line.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// A server line that asks the client to quit.
pub const EXIT_LINE: &str = "exit";

/// Why the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    ServerClosed,
    ExitRequested,
}

/// Copy server lines to `output` until the server closes or says `exit`.
pub async fn relay_server<R, W>(server: R, mut output: W) -> io::Result<Ending>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = server.lines();
    while let Some(line) = lines.next_line().await? {
        if line == EXIT_LINE {
            return Ok(Ending::ExitRequested);
        }
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(Ending::ServerClosed)
}

/// Forward input lines to the server, then half-close the connection.
pub async fn forward_input<R, W>(input: R, mut server: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        server.write_all(line.as_bytes()).await?;
        server.write_all(b"\n").await?;
        server.flush().await?;
    }
    server.shutdown().await
}

/// Run both directions over `stream` until the server side ends.
///
/// Running out of input only half-closes the connection; the server then ends
/// the session and the relay drains whatever it still sends.
pub async fn run<S, I, O>(stream: S, input: I, output: O) -> io::Result<Ending>
where
    S: AsyncRead + AsyncWrite,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let relay = relay_server(BufReader::new(read_half), output);
    let forward = forward_input(BufReader::new(input), write_half);
    tokio::pin!(relay);
    tokio::pin!(forward);

    let mut input_open = true;
    loop {
        tokio::select! {
            ending = &mut relay => return ending,
            result = &mut forward, if input_open => {
                input_open = false;
                match result {
                    Ok(()) => debug!("Input closed"),
                    Err(e) => debug!("Input forwarding stopped: {e}"),
                }
            }
        }
    }
}
