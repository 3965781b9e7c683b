// Copyright (C) 2024 RTSP Core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server half of the core: session state machine, connection
//! dispatcher, transport layer, and `ServerStream` fanout (spec §2's
//! "Server session state machine + connection dispatcher", 25% share).

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod digest;
pub mod handler;
#[cfg(feature = "http-tunnel")]
pub mod http_tunnel;
pub mod session;
pub mod stream;
pub mod transport;

use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::TcpListener;

use crate::server::config::ServerOptions;
use crate::server::connection::ConnectionDeps;
use crate::server::coordinator::Coordinator;
use crate::server::handler::Handlers;
use crate::server::transport::{McastTransport, UdpTransport};
use crate::{ConnectionContext, Credentials};

/// The top-level server object: binds the control-connection listener,
/// optionally the UDP unicast listeners, and spawns the coordinator.
pub struct Server {
    options: ServerOptions,
    handlers: Handlers,
    credentials: Option<Credentials>,
    realm: String,
}

impl Server {
    pub fn new(options: ServerOptions, handlers: Handlers) -> Self {
        Server {
            options,
            handlers,
            credentials: None,
            realm: "rtsp-core".to_string(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials, realm: impl Into<String>) -> Self {
        self.credentials = Some(credentials);
        self.realm = realm.into();
        self
    }

    /// Runs the server until the listener errors. Spec §6 `rtsp_address`
    /// is the only required option; UDP/multicast/TLS are enabled by the
    /// presence of their respective options (`ServerOptions::validate`
    /// rejects incompatible combinations before this is reached).
    pub async fn serve(self) -> Result<(), crate::Error> {
        use crate::error::{bail, ErrorInt};

        if let Err(e) = self.options.validate() {
            bail!(ErrorInt::Fatal {
                description: e.to_string(),
            });
        }

        let listener = TcpListener::bind(self.options.rtsp_address)
            .await
            .map_err(|source| {
                crate::error::wrap!(ErrorInt::Io {
                    conn_ctx: ConnectionContext {
                        local_addr: self.options.rtsp_address,
                        peer_addr: self.options.rtsp_address,
                        established: SystemTime::now(),
                    },
                    source,
                })
            })?;

        let coordinator = Coordinator::spawn();
        tokio::spawn(coordinator::run_liveness_ticker(
            coordinator.clone(),
            self.options.check_stream_period,
        ));

        let udp = match self.options.udp_ports {
            Some(ports) => Some(UdpTransport::bind(ports).await.map_err(|source| {
                crate::error::wrap!(ErrorInt::Io {
                    conn_ctx: ConnectionContext {
                        local_addr: self.options.rtsp_address,
                        peer_addr: self.options.rtsp_address,
                        established: SystemTime::now(),
                    },
                    source,
                })
            })?),
            None => None,
        };
        let multicast = match self.options.multicast.clone() {
            Some(config) => Some(McastTransport::bind(config).await.map_err(|source| {
                crate::error::wrap!(ErrorInt::Io {
                    conn_ctx: ConnectionContext {
                        local_addr: self.options.rtsp_address,
                        peer_addr: self.options.rtsp_address,
                        established: SystemTime::now(),
                    },
                    source,
                })
            })?),
            None => None,
        };

        let deps = Arc::new(ConnectionDeps {
            handlers: self.handlers.clone(),
            coordinator: coordinator.clone(),
            realm: self.realm.clone(),
            credentials: self.credentials.clone(),
            udp,
            multicast,
            write_buffer_count: self.options.write_buffer_count,
            session_timeout: self.options.session_timeout,
            send_firewall_openers: self.options.send_firewall_openers,
        });

        loop {
            let (socket, peer_addr) = listener.accept().await.map_err(|source| {
                crate::error::wrap!(ErrorInt::Io {
                    conn_ctx: ConnectionContext {
                        local_addr: self.options.rtsp_address,
                        peer_addr: self.options.rtsp_address,
                        established: SystemTime::now(),
                    },
                    source,
                })
            })?;
            let local_addr = socket.local_addr().unwrap_or(self.options.rtsp_address);
            let conn_ctx = ConnectionContext {
                local_addr,
                peer_addr,
                established: SystemTime::now(),
            };
            let deps = deps.clone();
            tokio::spawn(async move {
                connection::serve(socket, conn_ctx, deps).await;
            });
        }
    }
}
