// SPDX-License-Identifier: MIT
//! Error taxonomy shared by every layer of the stack.
//!
//! Every failure is a `FsError` carrying the connection path it happened on,
//! the pipeline stage that produced it, and one code from a closed set. The
//! code is what callers and tests match on; `message` and `source` are for
//! humans and logs only.

use std::fmt;

/// Which connection path the error happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPath {
    Tunnel,
    Direct,
    /// Path not yet decided (or not applicable — e.g. token verification).
    Auto,
}

impl ErrorPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPath::Tunnel => "tunnel",
            ErrorPath::Direct => "direct",
            ErrorPath::Auto => "auto",
        }
    }
}

impl fmt::Display for ErrorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Connect,
    Attach,
    Handshake,
    Yamux,
    Rpc,
    Close,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Connect => "connect",
            Stage::Attach => "attach",
            Stage::Handshake => "handshake",
            Stage::Yamux => "yamux",
            Stage::Rpc => "rpc",
            Stage::Close => "close",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of error codes. Tests and callers match on these; never on
/// message strings. The `#[error]` strings are the canonical wire/log names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorCode {
    #[error("canceled")]
    Canceled,
    #[error("timeout")]
    Timeout,
    #[error("missing_origin")]
    MissingOrigin,
    #[error("origin_mismatch")]
    OriginMismatch,
    #[error("missing_channel_id")]
    MissingChannelId,
    #[error("channel_id_too_long")]
    ChannelIdTooLong,
    #[error("missing_attach")]
    MissingAttach,
    #[error("missing_stream_kind")]
    MissingStreamKind,
    #[error("missing_handler")]
    MissingHandler,
    #[error("invalid_psk")]
    InvalidPsk,
    #[error("invalid_suite")]
    InvalidSuite,
    #[error("invalid_endpoint_instance_id")]
    InvalidEndpointInstanceId,
    #[error("role_mismatch")]
    RoleMismatch,
    #[error("handshake_error")]
    HandshakeError,
    #[error("open_stream_failed")]
    OpenStreamFailed,
    #[error("stream_hello_failed")]
    StreamHelloFailed,
    #[error("websocket_init_failed")]
    WebsocketInitFailed,
    #[error("websocket_error")]
    WebsocketError,
    #[error("websocket_closed")]
    WebsocketClosed,
    #[error("send_failed")]
    SendFailed,
    #[error("rpc_failed")]
    RpcFailed,
    #[error("frame_too_large")]
    FrameTooLarge,
    #[error("input_too_large")]
    InputTooLarge,
    #[error("unknown_kid")]
    UnknownKid,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("invalid_audience")]
    InvalidAudience,
    #[error("invalid_issuer")]
    InvalidIssuer,
    #[error("expired")]
    Expired,
    #[error("init_expired")]
    InitExpired,
    #[error("iat_in_future")]
    IatInFuture,
    #[error("exp_after_init")]
    ExpAfterInit,
    #[error("invalid_format")]
    InvalidFormat,
    #[error("invalid_b64")]
    InvalidB64,
    #[error("invalid_json")]
    InvalidJson,
}

/// The error type carried across the whole stack.
#[derive(Debug, thiserror::Error)]
#[error("{}", render(.path, .stage, .code, .message))]
pub struct FsError {
    pub path: ErrorPath,
    pub stage: Stage,
    pub code: ErrorCode,
    pub message: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn render(path: &ErrorPath, stage: &Stage, code: &ErrorCode, message: &Option<String>) -> String {
    match message {
        Some(msg) => format!("{path}/{stage}: {code} ({msg})"),
        None => format!("{path}/{stage}: {code}"),
    }
}

impl FsError {
    pub fn new(stage: Stage, code: ErrorCode) -> Self {
        Self {
            path: ErrorPath::Auto,
            stage,
            code,
            message: None,
            source: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Stamp the connection path. Set once by the endpoint layer; lower
    /// layers construct errors with `ErrorPath::Auto`.
    pub fn on_path(mut self, path: ErrorPath) -> Self {
        self.path = path;
        self
    }

    /// Re-stamp the stage. Transports raise I/O errors without knowing which
    /// stage drove them; the driving layer corrects the stage here.
    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code == code
    }
}

/// Shorthand used throughout the crate.
pub type FsResult<T> = std::result::Result<T, FsError>;
