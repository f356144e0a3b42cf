use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::{SendFailurePolicy, Timing};
use crate::message::{Message, Outbound};
use crate::wire::{self, WireError};

#[derive(Error, Debug)]
pub enum SendError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("send to {0} exceeded its deadline")]
    Deadline(String),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        match self {
            SendError::ConnectTimeout(_) | SendError::Deadline(_) => true,
            SendError::Io(e) | SendError::Wire(WireError::Io(e)) => {
                e.kind() == io::ErrorKind::TimedOut
            }
            SendError::Wire(_) => false,
        }
    }

    /// Should this failure mark the destination as bad?
    pub fn counts_as_failure(&self, policy: SendFailurePolicy) -> bool {
        match policy {
            SendFailurePolicy::TimeoutOnly => self.is_timeout(),
            SendFailurePolicy::AllErrors => true,
        }
    }
}

/// Open a fresh connection to `addr`, write one frame and close.
/// Returns the number of bytes written.
pub async fn send_once(
    addr: &str,
    msg: &Message,
    connect_timeout: Duration,
) -> Result<usize, SendError> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SendError::ConnectTimeout(addr.to_string()))??;
    stream.set_nodelay(true)?;
    let written = wire::write_message(&mut stream, msg).await?;
    stream.shutdown().await?;
    Ok(written)
}

/// Deliver one queued message, cancelling the attempt once
/// `timing.send_timeout` has passed.
pub async fn deliver(out: &Outbound, timing: Timing) -> Result<usize, SendError> {
    let addr = out.dest.socket_addr();
    let attempt = send_once(&addr, &out.message, timing.connect_timeout);
    match tokio::time::timeout(timing.send_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Deadline(addr)),
    }
}
