//! Session handling for the RouterOS API.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::shaping::{QueueState, ShapingError, ShapingTarget};

use super::wire::{parse_bits, Reply, Sentence, SentenceCodec, WireError};

/// A logged-in API session with one RouterOS device.
///
/// Owned by exactly one pipeline invocation; there is no pooling and no
/// reconnect. The API has no logout command, so [`ShapingTarget::close`]
/// simply shuts the stream down.
pub struct RouterOsClient {
    framed: Framed<TcpStream, SentenceCodec>,
    target: SocketAddr,
    timeout: Duration,
}

impl RouterOsClient {
    /// Open a TCP connection, then authenticate with the plaintext `/login`
    /// form (RouterOS 6.43 and later).
    pub async fn connect(
        target: SocketAddr,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ShapingError> {
        info!(address = %target, "connecting to shaping device");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| ShapingError::Timeout {
                target: target.to_string(),
                timeout,
            })?
            .map_err(|source| ShapingError::Connection {
                target: target.to_string(),
                source,
            })?;

        let mut client = Self {
            framed: Framed::new(stream, SentenceCodec::new()),
            target,
            timeout,
        };

        let login: Sentence = vec![
            "/login".to_string(),
            format!("=name={}", username),
            format!("=password={}", password),
        ];
        match client.command(login).await {
            Ok(replies) => {
                // A =ret= in the !done means the device fell back to the
                // pre-6.43 challenge scheme, which this client does not speak.
                if replies
                    .iter()
                    .any(|r| matches!(r, Reply::Done(_)) && r.attribute("ret").is_some())
                {
                    return Err(ShapingError::AuthRejected {
                        username: username.to_string(),
                        message: "device requested challenge-response login (RouterOS \
                                  6.43+ required)"
                            .to_string(),
                    });
                }
                debug!(address = %target, "login accepted");
                Ok(client)
            }
            Err(ShapingError::Trap { message }) => Err(ShapingError::AuthRejected {
                username: username.to_string(),
                message,
            }),
            Err(e) => Err(e),
        }
    }

    fn map_wire(&self, error: WireError) -> ShapingError {
        match error {
            WireError::Io(source) => ShapingError::Connection {
                target: self.target.to_string(),
                source,
            },
            other => ShapingError::Protocol(other.to_string()),
        }
    }

    /// Send one command sentence and drain replies until `!done`.
    ///
    /// A `!trap` surfaces as [`ShapingError::Trap`] after the exchange
    /// completes; `!fatal` means the device is hanging up on us.
    async fn command(&mut self, sentence: Sentence) -> Result<Vec<Reply>, ShapingError> {
        debug!(command = %sentence.first().map(String::as_str).unwrap_or(""), "sending API sentence");
        self.framed
            .send(sentence)
            .await
            .map_err(|e| self.map_wire(e))?;

        let mut replies = Vec::new();
        let mut trap: Option<String> = None;
        loop {
            let next = tokio::time::timeout(self.timeout, self.framed.next())
                .await
                .map_err(|_| ShapingError::Timeout {
                    target: self.target.to_string(),
                    timeout: self.timeout,
                })?;
            let sentence = next
                .ok_or(ShapingError::ConnectionClosed)?
                .map_err(|e| self.map_wire(e))?;
            let reply = Reply::from_sentence(&sentence).ok_or_else(|| {
                ShapingError::Protocol(format!("unexpected sentence from device: {:?}", sentence))
            })?;
            match reply {
                Reply::Fatal(message) => {
                    return Err(ShapingError::Protocol(format!("device sent !fatal: {}", message)))
                }
                Reply::Trap(attrs) => {
                    trap = Some(
                        attrs
                            .get("message")
                            .cloned()
                            .unwrap_or_else(|| "unspecified trap".to_string()),
                    );
                }
                Reply::Done(_) => {
                    replies.push(reply);
                    break;
                }
                Reply::Re(_) => replies.push(reply),
            }
        }

        if let Some(message) = trap {
            return Err(ShapingError::Trap { message });
        }
        Ok(replies)
    }

    /// `/queue/tree/print` filtered to one name.
    async fn fetch_queue(&mut self, name: &str) -> Result<Option<QueueState>, ShapingError> {
        let print: Sentence = vec![
            "/queue/tree/print".to_string(),
            format!("?name={}", name),
        ];
        let replies = self.command(print).await?;

        let Some(record) = replies.iter().find(|r| matches!(r, Reply::Re(_))) else {
            return Ok(None);
        };
        let id = record
            .attribute(".id")
            .ok_or_else(|| {
                ShapingError::Protocol(format!("queue record for {:?} carries no .id", name))
            })?
            .to_string();
        let max_limit_bits = record.attribute("max-limit").and_then(parse_bits);
        Ok(Some(QueueState {
            id,
            name: record.attribute("name").unwrap_or(name).to_string(),
            max_limit_bits,
        }))
    }
}

#[async_trait::async_trait]
impl ShapingTarget for RouterOsClient {
    async fn get_queue(&mut self, name: &str) -> Result<Option<QueueState>, ShapingError> {
        self.fetch_queue(name).await
    }

    async fn set_limit(
        &mut self,
        name: &str,
        limit_bits: u64,
    ) -> Result<QueueState, ShapingError> {
        let current = self
            .fetch_queue(name)
            .await?
            .ok_or_else(|| ShapingError::QueueNotFound(name.to_string()))?;

        let set: Sentence = vec![
            "/queue/tree/set".to_string(),
            format!("=.id={}", current.id),
            format!("=max-limit={}", limit_bits),
        ];
        self.command(set).await?;

        // Confirmation re-read; the device's view is the one that counts.
        self.fetch_queue(name)
            .await?
            .ok_or_else(|| ShapingError::QueueNotFound(name.to_string()))
    }

    async fn close(&mut self) -> Result<(), ShapingError> {
        self.framed
            .get_mut()
            .shutdown()
            .await
            .map_err(|source| ShapingError::Connection {
                target: self.target.to_string(),
                source,
            })
    }
}
