use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::DEFAULT_MAX_LINE_BYTES,
    frame::{Frame, LineReader, write_line},
};

/// Longest line the client will print; well above anything the relay forwards.
const MAX_INBOUND_LINE: usize = 64 * 1024;
/// Longest line the user may type, matching what a default relay accepts.
const MAX_TYPED_LINE: usize = DEFAULT_MAX_LINE_BYTES;
const QUIT_COMMAND: &str = "quit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut server, mut writer) = establish_connection(args.server).await?;
    let mut typed = LineReader::new(BufReader::new(tokio::io::stdin()), MAX_TYPED_LINE);

    let name = match args.name {
        Some(name) => name,
        None => prompt_for_name(&mut typed).await?,
    };

    let mut stdout = tokio::io::stdout();
    run_client_loop(&mut server, &mut typed, &mut writer, &mut stdout, &name).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    server: SocketAddr,
) -> Result<(LineReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {server}");

    let (reader, writer) = stream.into_split();
    Ok((LineReader::new(BufReader::new(reader), MAX_INBOUND_LINE), writer))
}

async fn prompt_for_name<R>(typed: &mut LineReader<R>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter your username: ").await?;
    stdout.flush().await?;

    match typed.next_frame().await? {
        Frame::Line(name) => {
            let name = name.trim();
            Ok(if name.is_empty() { "anonymous" } else { name }.to_string())
        }
        Frame::TooLong => bail!("username longer than {MAX_TYPED_LINE} bytes"),
        Frame::Eof => bail!("stdin closed before a username was entered"),
    }
}

/// Both line readers keep partial input across loop turns, so a line that
/// arrives in pieces while the other branch wins is still printed or sent whole.
async fn run_client_loop<S, T, W, O>(
    server: &mut LineReader<S>,
    typed: &mut LineReader<T>,
    writer: &mut W,
    out: &mut O,
    name: &str,
) -> Result<()>
where
    S: AsyncBufRead + Unpin,
    T: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        select! {
            frame = server.next_frame() => {
                if !handle_server_frame(frame, out).await? {
                    break;
                }
            }
            frame = typed.next_frame() => {
                if !handle_stdin_frame(frame, name, writer, out).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame<O>(frame: io::Result<Frame>, out: &mut O) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    match frame? {
        Frame::Line(line) => {
            write_line(out, &line).await?;
            Ok(true)
        }
        Frame::TooLong => bail!("server sent a line longer than {MAX_INBOUND_LINE} bytes"),
        Frame::Eof => {
            write_line(out, "*** server closed the connection").await?;
            Ok(false)
        }
    }
}

/// Sends one typed line as `<name>: <line>`. Returns `false` once the user is done.
async fn handle_stdin_frame<W, O>(
    frame: io::Result<Frame>,
    name: &str,
    writer: &mut W,
    out: &mut O,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let text = match frame? {
        Frame::Line(text) => text,
        Frame::TooLong => {
            write_line(out, &format!("*** line longer than {MAX_TYPED_LINE} bytes was not sent")).await?;
            return Ok(true);
        }
        Frame::Eof => return Ok(false),
    };

    write_line(writer, &format_outgoing(name, &text)).await?;

    if text.trim().eq_ignore_ascii_case(QUIT_COMMAND) {
        write_line(out, "*** leaving chat").await?;
        return Ok(false);
    }
    Ok(true)
}

pub fn format_outgoing(name: &str, text: &str) -> String {
    format!("{name}: {text}")
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}
