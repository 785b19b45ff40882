//! H.264 encoding through an external process.
//!
//! Raw frames are written to the encoder's stdin; a reader thread
//! splits its Annex-B stdout into NAL units, which `encode` hands out
//! as they become available.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use cortex_core::{CortexError, NalSplitter, RawFrame, VideoEncoder};

struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    nals: mpsc::Receiver<Bytes>,
}

impl EncoderProcess {
    fn start(command: &[String]) -> Result<Self, CortexError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CortexError::Config("empty encoder command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| CortexError::Encoder(format!("{program}: {e}")))?;
        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CortexError::Encoder("encoder stdout unavailable".into()))?;

        let (tx, nals) = mpsc::channel();
        std::thread::Builder::new()
            .name("cortex-encoder".into())
            .spawn(move || {
                let mut splitter = NalSplitter::new();
                let mut buf = [0u8; 16 * 1024];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            splitter.push(&buf[..n]);
                            for nal in splitter.drain() {
                                if tx.send(nal).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                if let Some(nal) = splitter.flush() {
                    let _ = tx.send(nal);
                }
                debug!("encoder output closed");
            })?;

        info!(%program, "encoder started");
        Ok(Self {
            child,
            stdin,
            nals,
        })
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// [`VideoEncoder`] backed by a child process such as `ffmpeg`.
pub struct CommandEncoder {
    command: Vec<String>,
    restart_on_refresh: bool,
    process: EncoderProcess,
    refresh: bool,
}

impl CommandEncoder {
    pub fn spawn(command: Vec<String>, restart_on_refresh: bool) -> Result<Self, CortexError> {
        let process = EncoderProcess::start(&command)?;
        Ok(Self {
            command,
            restart_on_refresh,
            process,
            refresh: false,
        })
    }

    /// NAL units produced since the last call, without feeding a frame.
    pub fn ready(&mut self) -> Vec<Bytes> {
        self.process.nals.try_iter().collect()
    }
}

impl VideoEncoder for CommandEncoder {
    fn request_intra_refresh(&mut self) {
        self.refresh = true;
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<Bytes>, CortexError> {
        if std::mem::take(&mut self.refresh) && self.restart_on_refresh {
            debug!("restarting encoder for a keyframe");
            self.process = EncoderProcess::start(&self.command)?;
        }
        let stdin = self
            .process
            .stdin
            .as_mut()
            .ok_or_else(|| CortexError::Encoder("encoder input closed".into()))?;
        if let Err(e) = stdin.write_all(&frame.data) {
            warn!("encoder input failed: {e}");
            return Err(CortexError::Encoder(e.to_string()));
        }
        Ok(self.ready())
    }
}
