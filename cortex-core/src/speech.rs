//! Speech queue backed by an external text-to-speech command.
//!
//! Utterances are spoken one at a time by a background task, so
//! `speak` never blocks the tick loop. The configured command gets the
//! text as its last argument (for example `espeak -s 140 <text>`).
//! Without a command the text is only logged.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CortexError;
use crate::media::Speech;

#[derive(Debug, Clone)]
pub struct SpeechQueue {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<AtomicUsize>,
}

impl SpeechQueue {
    /// Start the speaking task on the current Tokio runtime.
    pub fn spawn(command: Vec<String>) -> Result<Self, CortexError> {
        if command.first().is_some_and(|program| program.trim().is_empty()) {
            return Err(CortexError::Speech("empty speech program".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CortexError::Speech(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        runtime.spawn(run(rx, command, pending.clone()));
        Ok(Self { tx, pending })
    }

    /// Utterances queued or being spoken.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Speech for SpeechQueue {
    fn speak(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(text.to_string()).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("speech task gone, dropping utterance");
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<String>, command: Vec<String>, pending: Arc<AtomicUsize>) {
    while let Some(text) = rx.recv().await {
        match command.split_first() {
            Some((program, args)) => {
                let status = tokio::process::Command::new(program)
                    .args(args)
                    .arg(&text)
                    .kill_on_drop(true)
                    .status()
                    .await;
                match status {
                    Ok(s) if s.success() => debug!(%text, "spoken"),
                    Ok(s) => warn!(%text, code = ?s.code(), "speech command failed"),
                    Err(e) => warn!(%program, "cannot run speech command: {e}"),
                }
            }
            None => info!(%text, "say"),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn utterances_drain_without_command() {
        let speech = SpeechQueue::spawn(Vec::new()).unwrap();
        speech.speak("HELLO");
        speech.speak("   ");
        speech.speak("WORLD");

        tokio::time::timeout(Duration::from_secs(2), async {
            while speech.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("speech queue did not drain");
    }

    #[test]
    fn blank_program_is_refused() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = runtime.enter();
        let err = SpeechQueue::spawn(vec![" ".into()]).err().unwrap();
        assert!(matches!(err, CortexError::Speech(_)));
    }

    #[test]
    fn spawning_outside_a_runtime_is_an_error() {
        let err = SpeechQueue::spawn(Vec::new()).err().unwrap();
        assert!(matches!(err, CortexError::Speech(_)));
    }
}
