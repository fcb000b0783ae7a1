// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process enclave for tests: a Noise NK responder behind a WebSocket
//! listener that replies to every request with a scripted frame sequence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use snow::Builder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{MAX_MESSAGE_SIZE, NOISE_PATTERN};
use crate::attestation::PublicKey;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Frames the mock enclave sends in answer to a request.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub frames: Vec<serde_json::Value>,
    /// Pause before each frame
    pub delay: Duration,
    /// Close the WebSocket once the frames are sent
    pub close_after: bool,
}

impl Script {
    pub fn frames(frames: Vec<serde_json::Value>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then_close(mut self) -> Self {
        self.close_after = true;
        self
    }
}

#[derive(Default)]
struct Observed {
    requests: Mutex<Vec<serde_json::Value>>,
    closed_sessions: AtomicUsize,
}

pub(crate) struct MockEnclave {
    pub endpoint: String,
    pub public_key: PublicKey,
    observed: Arc<Observed>,
}

impl MockEnclave {
    pub async fn spawn(script: Script) -> Self {
        let params = NOISE_PATTERN.parse::<snow::params::NoiseParams>().unwrap();
        let keypair = Builder::new(params).generate_keypair().unwrap();
        let public_key: PublicKey = keypair.public.as_slice().try_into().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let observed = Arc::new(Observed::default());

        let private = Arc::new(keypair.private);
        let task_observed = observed.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let private = private.clone();
                let script = script.clone();
                let observed = task_observed.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &private, &script, &observed).await;
                    observed.closed_sessions.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            endpoint,
            public_key,
            observed,
        }
    }

    /// Decrypted request frames received so far.
    pub async fn requests(&self) -> Vec<serde_json::Value> {
        self.observed.requests.lock().await.clone()
    }

    /// Sessions that have ended on the enclave side.
    pub fn closed_sessions(&self) -> usize {
        self.observed.closed_sessions.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` sessions have ended.
    pub async fn wait_closed(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.closed_sessions() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("enclave session was not closed");
    }
}

async fn serve(
    stream: TcpStream,
    private_key: &[u8],
    script: &Script,
    observed: &Observed,
) -> Result<(), BoxError> {
    let mut ws = accept_async(stream).await?;
    let mut handshake = Builder::new(NOISE_PATTERN.parse()?)
        .local_private_key(private_key)
        .build_responder()?;
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    let first = match ws.next().await {
        Some(Ok(Message::Binary(data))) => data,
        _ => return Err("expected handshake message".into()),
    };
    handshake.read_message(&first, &mut buf)?;
    let len = handshake.write_message(&[], &mut buf)?;
    ws.send(Message::Binary(buf[..len].to_vec())).await?;
    let mut transport = handshake.into_transport_mode()?;

    while let Some(message) = ws.next().await {
        match message? {
            Message::Binary(ciphertext) => {
                let len = transport.read_message(&ciphertext, &mut buf)?;
                let request: serde_json::Value = serde_json::from_slice(&buf[..len])?;
                observed.requests.lock().await.push(request);

                for frame in &script.frames {
                    if !script.delay.is_zero() {
                        tokio::time::sleep(script.delay).await;
                    }
                    let plaintext = serde_json::to_vec(frame)?;
                    let len = transport.write_message(&plaintext, &mut buf)?;
                    ws.send(Message::Binary(buf[..len].to_vec())).await?;
                }
                if script.close_after {
                    ws.close(None).await?;
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
