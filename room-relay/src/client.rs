use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{Envelope, MessageType, read_message, write_line, write_message},
    transfer::TransferId,
};

/// Bytes carried by each outgoing `file-chunk` envelope.
pub const CHUNK_SIZE: usize = 8 * 1024;

const SENDFILE_USAGE: &str = "Usage: /sendfile username filepath";

/// Local bookkeeping for files this terminal is sending or receiving.
#[derive(Debug)]
struct FileState {
    downloads: PathBuf,
    /// Offered file name -> local path, until the recipient answers.
    outgoing: HashMap<String, PathBuf>,
    /// Accepted transfers still waiting to send more chunks.
    sending: HashMap<TransferId, OutgoingFile>,
    /// Downloads that have received at least one chunk.
    receiving: HashSet<String>,
}

impl FileState {
    fn new(downloads: PathBuf) -> Self {
        Self {
            downloads,
            outgoing: HashMap::new(),
            sending: HashMap::new(),
            receiving: HashSet::new(),
        }
    }
}

/// A file being streamed to its receiver, one chunk per `file-ack`.
#[derive(Debug)]
struct OutgoingFile {
    file: File,
    file_name: String,
    transfer_id: TransferId,
    /// Read ahead by one chunk so the final chunk can be flagged.
    pending: Vec<u8>,
    sent: u64,
}

impl OutgoingFile {
    async fn open(path: &Path, file_name: &str, transfer_id: TransferId) -> Result<Self> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        let pending = read_chunk(&mut file).await?;
        Ok(Self {
            file,
            file_name: file_name.to_string(),
            transfer_id,
            pending,
            sent: 0,
        })
    }

    /// Writes the next chunk. Returns `true` once the last one is out.
    async fn send_next<W>(&mut self, writer: &mut W) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let next = read_chunk(&mut self.file).await?;
        let is_last = next.is_empty();
        let data = std::mem::replace(&mut self.pending, next);
        self.sent += data.len() as u64;
        let chunk = Envelope::chunk("", &self.file_name, Some(self.transfer_id), data, is_last);
        write_message(writer, &chunk).await?;
        Ok(is_last)
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let mut state = FileState::new(args.downloads.clone());

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, &mut state).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    state: &mut FileState,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = read_message::<_, Envelope>(reader) => {
                if !handle_server_message(server_message, writer, state).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, state).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message<W>(
    message: io::Result<Option<Envelope>>,
    writer: &mut W,
    state: &mut FileState,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(envelope) = message? else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    match envelope.kind {
        MessageType::FileAccepted => match (state.outgoing.remove(&envelope.file_name), envelope.transfer_id) {
            (Some(path), Some(id)) => match OutgoingFile::open(&path, &envelope.file_name, id).await {
                Ok(outgoing) => {
                    state.sending.insert(id, outgoing);
                    send_next_chunk(writer, state, id).await?;
                }
                Err(error) => write_stderr(&format!("!!! {error:#}")).await?,
            },
            (Some(_), None) => warn!(file = %envelope.file_name, "accepted transfer carries no id"),
            (None, _) => warn!(file = %envelope.file_name, "accepted a file that was never offered"),
        },
        MessageType::FileAck => {
            if let Some(id) = envelope.transfer_id {
                send_next_chunk(writer, state, id).await?;
            }
        }
        MessageType::FileRejected => {
            state.outgoing.remove(&envelope.file_name);
        }
        MessageType::FileChunk => {
            if let Err(error) = save_chunk(state, &envelope).await {
                write_stderr(&format!("!!! could not save {}: {error:#}", envelope.file_name)).await?;
            }
        }
        MessageType::FileComplete => {
            if let Some(id) = envelope.transfer_id {
                state.sending.remove(&id);
            }
            if state.receiving.remove(&envelope.file_name) {
                let path = download_path(&state.downloads, &envelope.file_name)?;
                write_stdout(&format!("*** saved {}", path.display())).await?;
            }
        }
        _ => {}
    }

    if let Some(line) = render(&envelope) {
        write_stdout(&line).await?;
    }
    Ok(true)
}

async fn handle_stdin_input<W>(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut W,
    state: &mut FileState,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if text.starts_with("/sendfile") {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let [_, recipient, path] = parts.as_slice() else {
            write_stdout(SENDFILE_USAGE).await?;
            return Ok(true);
        };
        if let Err(error) = offer_file(writer, state, recipient, Path::new(path)).await {
            write_stderr(&format!("!!! {error:#}")).await?;
        }
        return Ok(true);
    }

    write_line(writer, text).await?;
    Ok(true)
}

/// Announces a local file to `recipient`. Bytes follow once it is accepted.
async fn offer_file<W>(writer: &mut W, state: &mut FileState, recipient: &str, path: &Path) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let metadata = fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a file", path.display());
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();

    write_stdout(&format!(
        "*** offering {file_name} ({:.2} KB) to {recipient}",
        metadata.len() as f64 / 1024.0
    ))
    .await?;
    write_line(writer, &format!("/sendfile {recipient} {file_name} {}", metadata.len())).await?;
    state.outgoing.insert(file_name, path.to_path_buf());
    Ok(())
}

/// Sends one more chunk of an accepted transfer and forgets it after the
/// last. Acknowledgements for unknown transfers are ignored.
async fn send_next_chunk<W>(writer: &mut W, state: &mut FileState, id: TransferId) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Some(outgoing) = state.sending.get_mut(&id) else {
        debug!(transfer = %id, "acknowledgement for a transfer that is not sending");
        return Ok(());
    };
    if outgoing.send_next(writer).await? {
        if let Some(done) = state.sending.remove(&id) {
            debug!(file = %done.file_name, bytes = done.sent, "file streamed");
        }
    }
    Ok(())
}

async fn read_chunk(file: &mut File) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(CHUNK_SIZE);
    (&mut *file).take(CHUNK_SIZE as u64).read_to_end(&mut buffer).await?;
    Ok(buffer)
}

async fn save_chunk(state: &mut FileState, envelope: &Envelope) -> Result<()> {
    let path = download_path(&state.downloads, &envelope.file_name)?;
    fs::create_dir_all(&state.downloads)
        .await
        .with_context(|| format!("cannot create {}", state.downloads.display()))?;

    // The first chunk of a download replaces any older file of the same name.
    let first = state.receiving.insert(envelope.file_name.clone());
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!first)
        .truncate(first)
        .open(&path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    if let Some(data) = &envelope.file_data {
        file.write_all(data).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Where a received file lands. Directory components in the offered name
/// are dropped.
fn download_path(downloads: &Path, file_name: &str) -> Result<PathBuf> {
    let base = Path::new(file_name)
        .file_name()
        .with_context(|| format!("refusing to save {file_name:?}"))?;
    Ok(downloads.join(base))
}

/// Terminal rendering of an envelope. Chunks and acknowledgements print nothing.
fn render(envelope: &Envelope) -> Option<String> {
    match envelope.kind {
        MessageType::FileChunk | MessageType::FileAck => None,
        MessageType::Text if !envelope.is_from_server() => Some(format!(
            "[{}] {}: {}",
            envelope.room_name, envelope.sender, envelope.content
        )),
        _ => Some(format!("*** {}", envelope.content.trim_end())),
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
