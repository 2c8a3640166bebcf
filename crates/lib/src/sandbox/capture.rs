//! Bounded capture of a child's output stream.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::warn;

/// Reads a stream to the end in the background, keeping only the last
/// `limit` bytes.
pub(super) struct BoundedCapture {
  handle: Option<JoinHandle<Vec<u8>>>,
}

impl BoundedCapture {
  pub(super) fn spawn<R>(stream: Option<R>, limit: usize) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let handle = stream.map(|stream| tokio::spawn(read_tail(stream, limit)));
    Self { handle }
  }

  /// Wait for the stream to close and return what was kept.
  pub(super) async fn finish(self) -> String {
    let Some(handle) = self.handle else {
      return String::new();
    };
    match handle.await {
      Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
      Err(e) => {
        warn!(error = %e, "output capture task failed");
        String::new()
      }
    }
  }
}

async fn read_tail<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> Vec<u8> {
  let mut kept = Vec::new();
  let mut chunk = [0u8; 8192];

  loop {
    match stream.read(&mut chunk).await {
      Ok(0) => break,
      Ok(n) => {
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > limit {
          let excess = kept.len() - limit;
          kept.drain(..excess);
        }
      }
      Err(e) => {
        warn!(error = %e, "failed to read build output");
        break;
      }
    }
  }

  kept
}
