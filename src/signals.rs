/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
/// Any of them asks the recorder to stop the capture process and exit.
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    StopFile,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "SIGINT"),
            ShutdownReason::Terminate => write!(f, "SIGTERM"),
            ShutdownReason::StopFile => write!(f, "STOP file"),
        }
    }
}

pub struct SignalHandler {
    sigint: Signal,
    sigterm: Signal,
    stop_file: PathBuf,
    poll: Duration,
}

impl SignalHandler {
    /// Register the signal streams. A STOP file left over from an earlier
    /// run is removed so it does not end this one immediately.
    pub fn install(stop_file: PathBuf, poll: Duration) -> std::io::Result<Self> {
        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;
        if stop_file.exists() {
            tracing::warn!(path = %stop_file.display(), "removing stale STOP file");
            std::fs::remove_file(&stop_file)?;
        }
        Ok(Self {
            sigint,
            sigterm,
            stop_file,
            poll,
        })
    }

    /// Resolves on the first shutdown request.
    pub async fn wait(&mut self) -> ShutdownReason {
        let reason = tokio::select! {
            _ = self.sigint.recv() => ShutdownReason::Interrupt,
            _ = self.sigterm.recv() => ShutdownReason::Terminate,
            _ = poll_stop_file(&self.stop_file, self.poll) => ShutdownReason::StopFile,
        };
        tracing::info!(reason = %reason, "shutdown requested");
        if reason == ShutdownReason::StopFile {
            let _ = std::fs::remove_file(&self.stop_file);
        }
        reason
    }
}

async fn poll_stop_file(path: &Path, poll: Duration) {
    loop {
        if path.exists() {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_stop_file_is_cleared_at_install() {
        let dir = tempfile::tempdir().unwrap();
        let stop = dir.path().join("STOP");
        std::fs::write(&stop, "").unwrap();
        let _handler = SignalHandler::install(stop.clone(), Duration::from_millis(10)).unwrap();
        assert!(!stop.exists());
    }

    #[tokio::test]
    async fn test_stop_file_triggers_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let stop = dir.path().join("STOP");
        let mut handler = SignalHandler::install(stop.clone(), Duration::from_millis(10)).unwrap();

        let writer = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(stop, "").unwrap();
            })
        };
        let reason = tokio::time::timeout(Duration::from_secs(5), handler.wait())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(reason, ShutdownReason::StopFile);
        // Consumed so the next run starts clean
        assert!(!stop.exists());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownReason::StopFile.to_string(), "STOP file");
    }
}
