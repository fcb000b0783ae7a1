// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Noise-over-WebSocket session with one enclave.
//!
//! The router is the NK initiator: it knows the enclave's static key from
//! attestation, the enclave does not authenticate the router.
//!
//! ```text
//! -> e, es      (binary message, empty payload)
//! <- e, ee      (binary message)
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use snow::{Builder, TransportState};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::protocol::{EnclaveEvent, MAX_MESSAGE_SIZE, MAX_PLAINTEXT, NOISE_PATTERN};
use super::RelayError;
use crate::attestation::PublicKey;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// TCP connect, WebSocket upgrade and handshake
    pub connect: Duration,
    /// Wait for each response frame
    pub frame: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            frame: DEFAULT_FRAME_TIMEOUT,
        }
    }
}

/// An established encrypted session.
pub struct SecureSession {
    ws: WsStream,
    transport: TransportState,
    remote_key: PublicKey,
    buf: Vec<u8>,
    frame_timeout: Duration,
}

impl SecureSession {
    /// Connect to `endpoint` and complete the handshake against `remote_key`.
    ///
    /// Every failure up to a completed handshake is reported as
    /// [`RelayError::Handshake`] or [`RelayError::ConnectTimeout`].
    pub async fn open(
        endpoint: &str,
        remote_key: &PublicKey,
        timeouts: SessionTimeouts,
    ) -> Result<Self, RelayError> {
        timeout(timeouts.connect, Self::handshake(endpoint, remote_key, timeouts))
            .await
            .map_err(|_| RelayError::ConnectTimeout)?
    }

    async fn handshake(
        endpoint: &str,
        remote_key: &PublicKey,
        timeouts: SessionTimeouts,
    ) -> Result<Self, RelayError> {
        let (mut ws, _) = connect_async(endpoint)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;

        let params = NOISE_PATTERN
            .parse::<snow::params::NoiseParams>()
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        let mut handshake = Builder::new(params)
            .remote_public_key(remote_key)
            .build_initiator()
            .map_err(|e| RelayError::Handshake(e.to_string()))?;

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        let len = handshake
            .write_message(&[], &mut buf)
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        ws.send(Message::Binary(buf[..len].to_vec()))
            .await
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        debug!(endpoint = %endpoint, bytes = len, "Sent handshake initiator message");

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => break data,
                Some(Ok(Message::Ping(data))) => {
                    ws.send(Message::Pong(data))
                        .await
                        .map_err(|e| RelayError::Handshake(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RelayError::Handshake(
                        "connection closed during handshake".into(),
                    ))
                }
                Some(Ok(other)) => {
                    return Err(RelayError::Handshake(format!(
                        "expected binary handshake message, got {other:?}"
                    )))
                }
                Some(Err(e)) => return Err(RelayError::Handshake(e.to_string())),
            }
        };

        handshake
            .read_message(&reply, &mut buf)
            .map_err(|e| RelayError::Handshake(e.to_string()))?;
        if !handshake.is_handshake_finished() {
            return Err(RelayError::Handshake("handshake incomplete".into()));
        }
        let transport = handshake
            .into_transport_mode()
            .map_err(|e| RelayError::Handshake(e.to_string()))?;

        info!(endpoint = %endpoint, "Noise handshake complete");

        Ok(Self {
            ws,
            transport,
            remote_key: *remote_key,
            buf,
            frame_timeout: timeouts.frame,
        })
    }

    pub fn remote_key(&self) -> &PublicKey {
        &self.remote_key
    }

    /// Encrypt and send one JSON frame.
    pub async fn send_json<T: Serialize>(&mut self, message: &T) -> Result<(), RelayError> {
        let plaintext = serde_json::to_vec(message)
            .map_err(|e| RelayError::Protocol(format!("failed to encode request: {e}")))?;
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(RelayError::RequestTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT,
            });
        }

        let len = self.transport.write_message(&plaintext, &mut self.buf)?;
        self.ws
            .send(Message::Binary(self.buf[..len].to_vec()))
            .await?;
        debug!(bytes = len, "Sent encrypted frame");
        Ok(())
    }

    /// Receive and decrypt the next frame. `Ok(None)` when the enclave closed
    /// the session.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        loop {
            let next = timeout(self.frame_timeout, self.ws.next())
                .await
                .map_err(|_| RelayError::Timeout(self.frame_timeout))?;

            match next {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Binary(ciphertext))) => {
                    let len = self.transport.read_message(&ciphertext, &mut self.buf)?;
                    return Ok(Some(self.buf[..len].to_vec()));
                }
                Some(Ok(Message::Ping(data))) => self.ws.send(Message::Pong(data)).await?,
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    return Err(RelayError::Protocol(format!(
                        "unexpected websocket message: {other:?}"
                    )))
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Receive the next decoded event. A closed session is an error: the
    /// enclave must finish with a terminal event.
    pub async fn recv_event(&mut self) -> Result<EnclaveEvent, RelayError> {
        match self.recv_frame().await? {
            Some(plaintext) => EnclaveEvent::decode(&plaintext),
            None => Err(RelayError::Closed),
        }
    }

    /// Close the WebSocket. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = timeout(Duration::from_secs(2), self.ws.close(None)).await;
        debug!("Enclave session closed");
    }
}
