//! Endpoint orchestration: from a grant or direct connect info to a live
//! multiplexed secure session.
//!
//! The sequence is the same on both paths — dial, (tunnel only) attach,
//! E2EE handshake, mux — and every failure is stamped with the path and the
//! stage it died in.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::{ChannelId, Psk, Role};
use crate::e2ee::{self, ChannelParams, E2eeConfig};
use crate::error::{ErrorCode, ErrorPath, FsError, FsResult, Stage};
use crate::grant::{AttachRequest, ChannelGrant, DirectConnectInfo};
use crate::mux::{Dispatcher, MuxConfig, MuxSession};
use crate::observer::ObserverCell;
use crate::rpc::{self, Router, RpcClient, RpcConfig};
use crate::timeops::with_timeout;
use crate::token;
use crate::transport::MessageTransport;
use crate::ws;

#[derive(Clone)]
pub struct EndpointConfig {
    pub e2ee: E2eeConfig,
    pub mux: MuxConfig,
    pub rpc: RpcConfig,
    /// WebSocket dial deadline.
    pub connect_timeout: Option<Duration>,
    /// Deadline for the full E2EE exchange.
    pub handshake_timeout: Option<Duration>,
    pub observer: ObserverCell,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            e2ee: E2eeConfig::default(),
            mux: MuxConfig::default(),
            rpc: RpcConfig::default(),
            connect_timeout: Some(Duration::from_secs(10)),
            handshake_timeout: Some(Duration::from_secs(10)),
            observer: ObserverCell::default(),
        }
    }
}

/// A connected endpoint. Holds the mux session and the path it was built
/// over; RPC streams hang off it.
pub struct Connection {
    mux: MuxSession,
    session: JoinHandle<FsResult<()>>,
    path: ErrorPath,
    cfg: EndpointConfig,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn mux(&self) -> &MuxSession {
        &self.mux
    }

    pub fn path(&self) -> ErrorPath {
        self.path
    }

    /// Open an `"rpc"` stream and bind a session to it. The router serves
    /// calls the peer makes back over the same stream.
    pub async fn open_rpc(
        &self,
        router: Arc<Router>,
    ) -> FsResult<(RpcClient, JoinHandle<FsResult<()>>)> {
        let frames = self
            .mux
            .open_typed("rpc")
            .await
            .map_err(|e| e.on_path(self.path))?;
        Ok(rpc::attach(
            frames,
            router,
            self.cfg.rpc.clone(),
            self.cfg.observer.clone(),
            self.mux.cancellation(),
        ))
    }

    /// Close the session and wait for it to wind down.
    pub async fn close(self) {
        self.mux.close();
        let _ = self.session.await;
    }

    /// Wait until the session ends on its own (peer close or error).
    pub async fn join(self) -> FsResult<()> {
        match self.session.await {
            Ok(outcome) => outcome.map_err(|e| e.on_path(self.path)),
            Err(_) => Err(FsError::new(Stage::Yamux, ErrorCode::WebsocketError)
                .with_message("mux driver aborted")
                .on_path(self.path)),
        }
    }
}

/// Builder for one endpoint: configuration plus an optional dispatcher for
/// inbound streams.
pub struct Endpoint {
    cfg: EndpointConfig,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl Endpoint {
    pub fn new(cfg: EndpointConfig) -> Self {
        Self {
            cfg,
            dispatcher: None,
        }
    }

    /// Attach a dispatcher so this endpoint accepts greeted inbound streams.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Build a dispatcher wired to this endpoint's caps and observer, with
    /// an `"rpc"` kind backed by `registrar`.
    pub fn rpc_dispatcher(
        cfg: &EndpointConfig,
        registrar: Arc<dyn Fn(&mut Router) + Send + Sync>,
        parent: &CancellationToken,
    ) -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::new(
            cfg.observer.clone(),
            cfg.mux.max_hello,
            cfg.mux.max_frame,
        ));
        dispatcher.handle(
            "rpc",
            rpc::RpcStreamHandler::new(
                registrar,
                cfg.rpc.clone(),
                cfg.observer.clone(),
                parent.child_token(),
            ),
        );
        dispatcher
    }

    /// Join a channel through the tunnel named in the grant.
    pub async fn connect_tunnel(
        &self,
        grant: &ChannelGrant,
        parent: &CancellationToken,
    ) -> FsResult<Connection> {
        let path = ErrorPath::Tunnel;
        let tunnel_url = grant
            .tunnel_url
            .as_deref()
            .ok_or_else(|| {
                FsError::new(Stage::Validate, ErrorCode::MissingAttach)
                    .with_message("grant carries no tunnel_url")
                    .on_path(path)
            })?
            .to_string();
        let params = grant_params(grant).map_err(|e| e.on_path(path))?;

        let transport = ws::connect(&tunnel_url, self.cfg.connect_timeout)
            .await
            .map_err(|e| e.on_path(path))?;

        let attach = AttachRequest::new(params.channel_id.as_str(), grant.role, &grant.token);
        let attach_json = attach.to_json().map_err(|e| e.on_path(path))?;
        transport
            .send_text(attach_json)
            .await
            .map_err(|e| e.on_path(path))?;

        self.establish(Arc::new(transport), params, grant.role, path, parent)
            .await
    }

    /// Join a channel directly (the peer serves the WebSocket itself).
    pub async fn connect_direct(
        &self,
        info: &DirectConnectInfo,
        role: Role,
        parent: &CancellationToken,
    ) -> FsResult<Connection> {
        let path = ErrorPath::Direct;
        let params = direct_params(info).map_err(|e| e.on_path(path))?;
        let transport = ws::connect(&info.ws_url, self.cfg.connect_timeout)
            .await
            .map_err(|e| e.on_path(path))?;
        self.establish(Arc::new(transport), params, role, path, parent)
            .await
    }

    /// Run the tail shared by every path: handshake, then mux. Also the
    /// entry point for callers that bring their own transport (a direct
    /// server accepting sockets, tests over in-memory pairs).
    pub async fn establish(
        &self,
        transport: Arc<dyn MessageTransport>,
        params: ChannelParams,
        role: Role,
        path: ErrorPath,
        parent: &CancellationToken,
    ) -> FsResult<Connection> {
        let handshake = async {
            match role {
                Role::Client => {
                    e2ee::handshake::client_handshake(
                        transport,
                        &params,
                        &self.cfg.e2ee,
                        &self.cfg.observer,
                    )
                    .await
                }
                Role::Server => {
                    e2ee::handshake::server_handshake(
                        transport,
                        &params,
                        &self.cfg.e2ee,
                        &self.cfg.observer,
                    )
                    .await
                }
            }
        };
        let channel = with_timeout(self.cfg.handshake_timeout, handshake)
            .await
            .map_err(|e| e.at_stage(Stage::Handshake).on_path(path))?;

        info!(
            channel_id = %params.channel_id,
            role = role.wire_id(),
            path = path.as_str(),
            "secure channel established"
        );

        let (mux, session) = MuxSession::start(
            channel.into_stream(),
            role,
            self.dispatcher.clone(),
            self.cfg.mux.clone(),
            parent,
        );
        Ok(Connection {
            mux,
            session,
            path,
            cfg: self.cfg.clone(),
        })
    }
}

fn grant_params(grant: &ChannelGrant) -> FsResult<ChannelParams> {
    let channel_id = ChannelId::parse(&grant.channel_id)?;
    let psk = Psk::from_b64u(&grant.e2ee_psk_b64u)?;
    // The token is the authoritative carrier of the init deadline; it is
    // parsed (not verified) here — verification is the tunnel's job.
    let init_expire_at = token::parse(&grant.token)?.payload.init_exp;
    Ok(ChannelParams {
        channel_id,
        psk,
        suite: grant.default_suite,
        init_expire_at,
    })
}

fn direct_params(info: &DirectConnectInfo) -> FsResult<ChannelParams> {
    Ok(ChannelParams {
        channel_id: ChannelId::parse(&info.channel_id)?,
        psk: Psk::from_b64u(&info.e2ee_psk_b64u)?,
        suite: info.default_suite,
        init_expire_at: info.channel_init_expire_at_unix_s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_params_need_valid_psk_and_token() {
        let grant = ChannelGrant {
            v: 1,
            role: Role::Client,
            channel_id: "ch_1".into(),
            tunnel_url: Some("wss://t.example/ws".into()),
            e2ee_psk_b64u: "short".into(),
            default_suite: crate::suite::CipherSuite::X25519HkdfSha256Aes256Gcm,
            token: "FST2.x.y".into(),
        };
        let err = grant_params(&grant).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPsk);
    }
}
