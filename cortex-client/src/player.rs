//! Video sink: hands received access units to an external player
//! (`ffplay` by default) and optionally records them.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use cortex_core::{CortexError, RawFrame, VideoDecoder};

/// [`VideoDecoder`] that renders through a child process.
///
/// Writes happen on a helper thread, so a slow player never stalls
/// the tick loop; it only loses frames.
pub struct PlayerSink {
    child: Option<Child>,
    feed: Option<mpsc::SyncSender<Bytes>>,
    record: Option<BufWriter<File>>,
    units: u64,
}

impl PlayerSink {
    /// Start `command` (empty: no player) and open `record` (empty: no
    /// recording).
    pub fn spawn(command: &[String], record: &str) -> Result<Self, CortexError> {
        let (child, feed) = match command.split_first() {
            Some((program, args)) => {
                let mut child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| CortexError::Decoder(format!("{program}: {e}")))?;
                let mut stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| CortexError::Decoder("player stdin unavailable".into()))?;
                let (tx, rx) = mpsc::sync_channel::<Bytes>(32);
                std::thread::Builder::new()
                    .name("cortex-player".into())
                    .spawn(move || {
                        for unit in rx {
                            if stdin.write_all(&unit).and_then(|()| stdin.flush()).is_err() {
                                break;
                            }
                        }
                        debug!("player feed closed");
                    })?;
                info!(%program, "video player started");
                (Some(child), Some(tx))
            }
            None => {
                info!("no video player configured");
                (None, None)
            }
        };

        let record = match record {
            "" => None,
            path => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Path::new(path))?;
                info!(path, "recording video");
                Some(BufWriter::new(file))
            }
        };

        Ok(Self {
            child,
            feed,
            record,
            units: 0,
        })
    }

    /// Access units accepted so far.
    pub fn units(&self) -> u64 {
        self.units
    }
}

impl VideoDecoder for PlayerSink {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RawFrame>, CortexError> {
        self.units += 1;
        if let Some(record) = self.record.as_mut() {
            if let Err(e) = record.write_all(access_unit) {
                warn!("recording failed, stopping: {e}");
                self.record = None;
            }
        }
        if let Some(feed) = &self.feed {
            match feed.try_send(Bytes::copy_from_slice(access_unit)) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    return Err(CortexError::Decoder("player is behind, unit dropped".into()));
                }
                Err(mpsc::TrySendError::Disconnected(_)) => {
                    self.feed = None;
                    return Err(CortexError::Decoder("player exited".into()));
                }
            }
        }
        Ok(None)
    }
}

impl Drop for PlayerSink {
    fn drop(&mut self) {
        drop(self.feed.take());
        if let Some(record) = self.record.as_mut() {
            let _ = record.flush();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_player_units_are_counted_and_recorded() {
        let path = std::env::temp_dir().join(format!("cortex-player-{}.h264", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut sink = PlayerSink::spawn(&[], path.to_str().unwrap()).unwrap();
            assert!(sink.decode(&[0, 0, 0, 1, 0x65]).unwrap().is_none());
            assert!(sink.decode(&[0, 0, 0, 1, 0x41]).unwrap().is_none());
            assert_eq!(sink.units(), 2);
        }
        let written = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(written, vec![0u8, 0, 0, 1, 0x65, 0, 0, 0, 1, 0x41]);
    }

    #[test]
    fn missing_player_is_a_decoder_error() {
        let err = PlayerSink::spawn(&["/nonexistent/cortex-player".into()], "")
            .err()
            .unwrap();
        assert!(matches!(err, CortexError::Decoder(_)));
    }

    #[cfg(unix)]
    #[test]
    fn units_reach_the_player() {
        let mut sink = PlayerSink::spawn(&["cat".into()], "").unwrap();
        assert!(sink.decode(&[0, 0, 0, 1, 0x65]).is_ok());
    }
}
