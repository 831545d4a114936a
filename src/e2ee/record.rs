// SPDX-License-Identifier: MIT
//! The authenticated record stream that follows the handshake.
//!
//! Wire format per record (one binary transport message each):
//!
//! ```text
//! type(1) | seq(8 BE) | len(4 BE) | ciphertext (AES-256-GCM, 16-byte tag)
//! ```
//!
//! `0x17` carries application data; `0x15` is close_notify (zero-length
//! plaintext). The nonce is `iv[0..4] ∥ (iv[4..12] XOR seq_be)` and the
//! 13 header bytes are the AAD, so type, sequence, and length are all
//! authenticated. Sequence numbers are strict: a gap, a replay, or a
//! reorder fails authentication and tears the channel down.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::channel::Role;
use crate::error::{ErrorCode, FsError, FsResult, Stage};
use crate::suite::CipherSuite;
use crate::transport::MessageTransport;

use super::keys::RecordKeys;
use super::E2eeConfig;

pub const RECORD_APP: u8 = 0x17;
pub const RECORD_CLOSE: u8 = 0x15;
pub const RECORD_HEADER_LEN: usize = 13;
pub const AEAD_TAG_LEN: usize = 16;

fn nonce_for(iv: &[u8; 12], seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&iv[..4]);
    let seq_be = seq.to_be_bytes();
    for i in 0..8 {
        nonce[4 + i] = iv[4 + i] ^ seq_be[i];
    }
    nonce
}

fn record_header(record_type: u8, seq: u64, ct_len: usize) -> [u8; RECORD_HEADER_LEN] {
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0] = record_type;
    header[1..9].copy_from_slice(&seq.to_be_bytes());
    header[9..13].copy_from_slice(&(ct_len as u32).to_be_bytes());
    header
}

/// Sending half: owns the send key, IV base, and sequence counter.
pub struct SendHalf {
    transport: Arc<dyn MessageTransport>,
    cipher: Aes256Gcm,
    iv: [u8; 12],
    seq: u64,
    max_record: usize,
    closed: bool,
}

impl SendHalf {
    /// Largest plaintext that fits one record under the ciphertext cap.
    pub fn max_plaintext(&self) -> usize {
        self.max_record - AEAD_TAG_LEN
    }

    async fn send_typed(&mut self, record_type: u8, plaintext: &[u8]) -> FsResult<()> {
        if self.closed {
            return Err(FsError::new(Stage::Yamux, ErrorCode::SendFailed)
                .with_message("record stream already closed"));
        }
        if self.seq == u64::MAX {
            // Sequence space exhausted: never reuse a nonce, tear down instead.
            self.closed = true;
            self.transport.close().await;
            return Err(FsError::new(Stage::Yamux, ErrorCode::SendFailed)
                .with_message("record sequence space exhausted"));
        }
        let ct_len = plaintext.len() + AEAD_TAG_LEN;
        if ct_len > self.max_record {
            return Err(FsError::new(Stage::Yamux, ErrorCode::FrameTooLarge)
                .with_message(format!(
                    "record of {ct_len} bytes exceeds cap of {}",
                    self.max_record
                )));
        }

        let header = record_header(record_type, self.seq, ct_len);
        let nonce = nonce_for(&self.iv, self.seq);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| {
                FsError::new(Stage::Yamux, ErrorCode::SendFailed)
                    .with_message("record seal failed")
            })?;

        let mut wire = BytesMut::with_capacity(RECORD_HEADER_LEN + ciphertext.len());
        wire.put_slice(&header);
        wire.put_slice(&ciphertext);

        self.transport
            .send_binary(wire.freeze())
            .await
            .map_err(|e| e.at_stage(Stage::Yamux))?;
        self.seq += 1;
        Ok(())
    }

    /// Encrypt and send one application record.
    pub async fn send(&mut self, plaintext: &[u8]) -> FsResult<()> {
        self.send_typed(RECORD_APP, plaintext).await
    }

    /// Graceful close: send close_notify, then close the transport.
    pub async fn close(&mut self) {
        if !self.closed {
            if let Err(e) = self.send_typed(RECORD_CLOSE, &[]).await {
                debug!(err = %e, "close_notify not delivered");
            }
            self.closed = true;
        }
        self.transport.close().await;
    }
}

/// Receiving half: owns the receive key, IV base, and expected sequence.
pub struct RecvHalf {
    transport: Arc<dyn MessageTransport>,
    cipher: Aes256Gcm,
    iv: [u8; 12],
    seq: u64,
    max_record: usize,
    closed: bool,
}

impl RecvHalf {
    /// Receive and open the next application record. `Ok(None)` means the
    /// peer closed — either close_notify or a clean transport EOF. Any
    /// authentication or framing failure closes the transport and is fatal;
    /// key material is dropped (and thereby wiped) with the half.
    pub async fn recv(&mut self) -> FsResult<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        let msg = match self.transport.recv_binary().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                self.closed = true;
                return Ok(None);
            }
            Err(e) => {
                self.closed = true;
                return Err(e.at_stage(Stage::Yamux));
            }
        };

        match self.open_record(&msg) {
            Ok(item) => Ok(item),
            Err(e) => {
                self.closed = true;
                self.transport.close().await;
                Err(e)
            }
        }
    }

    fn open_record(&mut self, msg: &[u8]) -> FsResult<Option<Bytes>> {
        let fatal = |code: ErrorCode, text: &str| {
            FsError::new(Stage::Yamux, code).with_message(text.to_string())
        };

        if msg.len() < RECORD_HEADER_LEN {
            return Err(fatal(ErrorCode::HandshakeError, "record shorter than header"));
        }
        let record_type = msg[0];
        if record_type != RECORD_APP && record_type != RECORD_CLOSE {
            return Err(fatal(
                ErrorCode::HandshakeError,
                "reserved record type",
            ));
        }
        let seq = u64::from_be_bytes(msg[1..9].try_into().expect("8 bytes"));
        let ct_len = u32::from_be_bytes(msg[9..13].try_into().expect("4 bytes")) as usize;
        if ct_len > self.max_record {
            return Err(fatal(ErrorCode::FrameTooLarge, "record exceeds size cap"));
        }
        if msg.len() - RECORD_HEADER_LEN != ct_len {
            return Err(fatal(ErrorCode::HandshakeError, "record length mismatch"));
        }
        if seq != self.seq {
            return Err(fatal(
                ErrorCode::HandshakeError,
                "record sequence gap or reorder",
            ));
        }

        let nonce = nonce_for(&self.iv, self.seq);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &msg[RECORD_HEADER_LEN..],
                    aad: &msg[..RECORD_HEADER_LEN],
                },
            )
            .map_err(|_| fatal(ErrorCode::HandshakeError, "record authentication failed"))?;
        self.seq += 1;

        if record_type == RECORD_CLOSE {
            if !plaintext.is_empty() {
                return Err(fatal(
                    ErrorCode::HandshakeError,
                    "close_notify carries payload",
                ));
            }
            self.closed = true;
            return Ok(None);
        }
        Ok(Some(Bytes::from(plaintext)))
    }
}

/// A fully established secure channel: both record directions plus close.
pub struct SecureChannel {
    send: SendHalf,
    recv: RecvHalf,
    suite: CipherSuite,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    pub(crate) fn new(
        transport: Arc<dyn MessageTransport>,
        keys: RecordKeys,
        role: Role,
        cfg: &E2eeConfig,
        suite: CipherSuite,
    ) -> Self {
        // client-send = c2s = server-receive, and the mirror image.
        let (send_keys, recv_keys) = match role {
            Role::Client => (keys.c2s, keys.s2c),
            Role::Server => (keys.s2c, keys.c2s),
        };
        let send = SendHalf {
            transport: transport.clone(),
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&send_keys.key)),
            iv: send_keys.iv,
            seq: 0,
            max_record: cfg.max_record_bytes,
            closed: false,
        };
        let recv = RecvHalf {
            transport,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&recv_keys.key)),
            iv: recv_keys.iv,
            seq: 0,
            max_record: cfg.max_record_bytes,
            closed: false,
        };
        // DirectionKeys drop (and zeroize) here; only the ciphers live on.
        Self { send, recv, suite }
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> FsResult<()> {
        self.send.send(plaintext).await
    }

    pub async fn recv(&mut self) -> FsResult<Option<Bytes>> {
        self.recv.recv().await
    }

    pub async fn close(&mut self) {
        self.send.close().await;
    }

    pub fn split(self) -> (SendHalf, RecvHalf) {
        (self.send, self.recv)
    }

    /// Turn the channel into an ordered byte stream (`AsyncRead +
    /// AsyncWrite`) suitable for running a stream multiplexer on top.
    ///
    /// Two pump tasks bridge an in-memory pipe to the record halves: every
    /// chunk written by the caller becomes one record, and decrypted record
    /// payloads are surfaced in order on the read side. Dropping the
    /// returned stream (or reading EOF from the peer) triggers a graceful
    /// close_notify teardown.
    pub fn into_stream(self) -> tokio::io::DuplexStream {
        let (app_io, pump_io) = tokio::io::duplex(64 * 1024);
        let (mut pump_read, mut pump_write) = tokio::io::split(pump_io);
        let (mut send, mut recv) = self.split();

        tokio::spawn(async move {
            let chunk = send.max_plaintext().min(16 * 1024);
            let mut buf = vec![0u8; chunk];
            loop {
                match pump_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = send.send(&buf[..n]).await {
                            warn!(err = %e, "record send failed");
                            return;
                        }
                    }
                }
            }
            send.close().await;
        });

        tokio::spawn(async move {
            loop {
                match recv.recv().await {
                    Ok(Some(payload)) => {
                        if pump_write.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(err = %e, "record stream failed");
                        break;
                    }
                }
            }
            // Dropping the write half EOFs the application side.
            let _ = pump_write.shutdown().await;
        });

        app_io
    }
}
