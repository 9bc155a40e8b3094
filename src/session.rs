//! Queue-like session abstractions over a byte stream: framing, message-id
//! correlation, the in-place TLS upgrade and the server's atomic
//! multi-response send.

use crate::asn1::frame_length;
use crate::codec::{decode_message, encode_message};
use crate::controls::Controls;
use crate::error::LdapError;
use crate::message::{LdapMessage, ProtocolOp};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// The byte stream a session runs over. Blanket-implemented; in-memory
/// duplex pipes work the same as TCP or TLS streams.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// Swaps a plaintext stream for a secured one. Injected into sessions that
/// need StartTLS; the rustls implementations live in [`crate::tls`].
#[async_trait]
pub trait SecurityLayer: Send + Sync {
    async fn secure(&self, stream: BoxStream) -> Result<BoxStream, LdapError>;
}

/// Accumulates socket reads until a whole BER frame is available, then
/// decodes it. One frame is one LDAP message.
struct MessageStream {
    stream: BoxStream,
    buffer: BytesMut,
}

impl MessageStream {
    fn new(stream: BoxStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// The next message, or None on a clean end of stream.
    async fn read_message(&mut self) -> Result<Option<LdapMessage>, LdapError> {
        loop {
            if let Some(frame_len) = frame_length(&self.buffer)? {
                if self.buffer.len() >= frame_len {
                    let frame = self.buffer.split_to(frame_len);
                    return Ok(Some(decode_message(&frame)?));
                }
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(LdapError::Connection(
                    "connection closed mid-message".into(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), LdapError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Client end of a connection. Strictly sequential: `receive` blocks until
/// the response correlated to the given id arrives; responses for other ids
/// are buffered, never discarded.
pub struct ClientSession {
    stream: Option<MessageStream>,
    pending: HashMap<u32, VecDeque<LdapMessage>>,
    next_id: u32,
    security: Option<Arc<dyn SecurityLayer>>,
    encrypted: bool,
}

impl ClientSession {
    pub fn new(stream: impl Stream + 'static) -> Self {
        Self {
            stream: Some(MessageStream::new(Box::new(stream))),
            pending: HashMap::new(),
            next_id: 1,
            security: None,
            encrypted: false,
        }
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityLayer>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn stream(&mut self) -> Result<&mut MessageStream, LdapError> {
        self.stream
            .as_mut()
            .ok_or_else(|| LdapError::Connection("the session is closed".into()))
    }

    /// Send one operation and return the message id it was assigned.
    pub async fn send(&mut self, op: ProtocolOp, controls: Controls) -> Result<u32, LdapError> {
        let id = self.next_id;
        // id 0 is reserved for unsolicited notifications
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        let message = LdapMessage::with_controls(id, op, controls);
        let encoded = encode_message(&message)?;
        debug!(id, "sending request");
        self.stream()?.write_all(&encoded).await?;
        Ok(id)
    }

    /// Block until the next message correlated to `id` arrives. Responses
    /// to other ids are buffered FIFO per id.
    pub async fn receive(&mut self, id: u32) -> Result<LdapMessage, LdapError> {
        if let Some(message) = self.pending.get_mut(&id).and_then(VecDeque::pop_front) {
            return Ok(message);
        }
        loop {
            let message = self
                .stream()?
                .read_message()
                .await?
                .ok_or_else(|| LdapError::Connection("the server closed the connection".into()))?;
            if message.id == id {
                return Ok(message);
            }
            if message.id == 0 {
                self.handle_unsolicited(message)?;
                continue;
            }
            debug!(got = message.id, waiting_for = id, "buffering out-of-order response");
            self.pending.entry(message.id).or_default().push_back(message);
        }
    }

    pub async fn send_and_receive(
        &mut self,
        op: ProtocolOp,
        controls: Controls,
    ) -> Result<LdapMessage, LdapError> {
        let id = self.send(op, controls).await?;
        self.receive(id).await
    }

    /// Swap the transport for a TLS-wrapped one in place. Valid exactly once,
    /// after a successful StartTLS exchange.
    pub async fn encrypt(&mut self) -> Result<(), LdapError> {
        if self.encrypted {
            return Err(LdapError::Protocol(
                "the session is already encrypted".into(),
            ));
        }
        let security = self
            .security
            .clone()
            .ok_or_else(|| LdapError::Connection("no security layer configured".into()))?;
        let message_stream = self
            .stream
            .take()
            .ok_or_else(|| LdapError::Connection("the session is closed".into()))?;
        if !message_stream.buffer.is_empty() {
            return Err(LdapError::Protocol(
                "buffered plaintext during the TLS upgrade".into(),
            ));
        }
        let secured = security.secure(message_stream.stream).await?;
        self.stream = Some(MessageStream::new(secured));
        self.encrypted = true;
        debug!("session upgraded to TLS");
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
    }

    /// Message id 0 carries unsolicited notifications. A Notice of
    /// Disconnection means the server is about to drop us.
    fn handle_unsolicited(&mut self, message: LdapMessage) -> Result<(), LdapError> {
        if let ProtocolOp::ExtendedResponse(response) = &message.op {
            if response.is_notice_of_disconnection() {
                return Err(LdapError::Protocol(format!(
                    "notice of disconnection from the server: {}",
                    response.result.diagnostics
                )));
            }
        }
        warn!("ignoring unsolicited notification");
        Ok(())
    }
}

/// Server end of a connection.
pub struct ServerSession {
    stream: Option<MessageStream>,
}

impl ServerSession {
    pub fn new(stream: impl Stream + 'static) -> Self {
        Self {
            stream: Some(MessageStream::new(Box::new(stream))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The next request from the client, or None once the client has
    /// cleanly closed its end.
    pub async fn next_request(&mut self) -> Result<Option<LdapMessage>, LdapError> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_message().await,
            None => Ok(None),
        }
    }

    /// Send one or more correlated responses as a single write, so a
    /// multi-message answer (entries followed by a done) cannot interleave
    /// with anything else.
    pub async fn send(&mut self, responses: &[LdapMessage]) -> Result<(), LdapError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LdapError::Connection("the session is closed".into()))?;
        let mut bytes = Vec::new();
        for response in responses {
            bytes.extend_from_slice(&encode_message(response)?);
        }
        stream.write_all(&bytes).await
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await;
        }
    }
}
