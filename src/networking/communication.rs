use anyhow::{Context as _, Result};
use log::{debug, error, info, trace, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

// Import generated protobuf code
pub mod warp {
    tonic::include_proto!("warp");
}

use warp::warp_server::{Warp, WarpServer};
use warp::{
    FileChunk, HaveDuplex, LookupName, OpInfo, RemoteMachineAvatar, RemoteMachineInfo, StopInfo, TransferOpRequest,
    VoidType,
};

use super::certificate::CERTIFICATE_DOMAIN;
use super::file_transfer::CHUNK_SIZE;
use super::remote::{Remote, RemoteStatus};
use crate::engine::Engine;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_BUFFER: usize = 4;

/// Authenticated service answering peers' calls
pub struct WarpService {
    engine: Arc<Engine>,
}

impl WarpService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    fn known_remote(&self, id: &str) -> Result<Arc<Remote>, Status> {
        self.engine.remote(id).ok_or_else(|| {
            warn!("Request from unknown remote {}", id);
            Status::not_found(format!("Unknown remote {}", id))
        })
    }
}

fn op_info(info: Option<OpInfo>) -> Result<OpInfo, Status> {
    info.ok_or_else(|| Status::invalid_argument("Missing operation info"))
}

#[tonic::async_trait]
impl Warp for WarpService {
    async fn check_duplex_connection(&self, request: Request<LookupName>) -> Result<Response<HaveDuplex>, Status> {
        let lookup = request.into_inner();
        debug!("{} is checking duplex", lookup.id);

        let response = match self.engine.remote(&lookup.id) {
            Some(remote) => {
                let status = remote.status();
                // A peer asking means it can reach us; make sure we reach it too
                if matches!(status, RemoteStatus::Disconnected | RemoteStatus::Error) {
                    debug!("{} is {:?}, reconnecting", lookup.id, status);
                    self.engine.spawn_connect(remote);
                }
                matches!(status, RemoteStatus::Connected | RemoteStatus::AwaitingDuplex)
            }
            None => false,
        };

        Ok(Response::new(HaveDuplex { response }))
    }

    async fn get_remote_machine_info(
        &self,
        request: Request<LookupName>,
    ) -> Result<Response<RemoteMachineInfo>, Status> {
        trace!("Info requested by {}", request.get_ref().id);
        let local = &self.engine.context().local;
        Ok(Response::new(RemoteMachineInfo {
            display_name: local.display_name.clone(),
            user_name: local.user_name.clone(),
        }))
    }

    type GetRemoteMachineAvatarStream = ReceiverStream<Result<RemoteMachineAvatar, Status>>;

    async fn get_remote_machine_avatar(
        &self,
        request: Request<LookupName>,
    ) -> Result<Response<Self::GetRemoteMachineAvatarStream>, Status> {
        trace!("Avatar requested by {}", request.get_ref().id);
        let source = self
            .engine
            .context()
            .avatar
            .clone()
            .ok_or_else(|| Status::not_found("No avatar"))?;
        let avatar = source
            .avatar()
            .map_err(|e| Status::internal(format!("Failed to load avatar: {:#}", e)))?
            .ok_or_else(|| Status::not_found("No avatar"))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for piece in avatar.chunks(CHUNK_SIZE) {
                let message = RemoteMachineAvatar {
                    avatar_chunk: piece.to_vec(),
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn process_transfer_op_request(
        &self,
        request: Request<TransferOpRequest>,
    ) -> Result<Response<VoidType>, Status> {
        let offer = request.into_inner();
        let info = offer
            .info
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Missing operation info"))?;
        let remote = self.known_remote(&info.ident)?;

        remote.on_transfer_offer(&offer)?;
        Ok(Response::new(VoidType::default()))
    }

    async fn cancel_transfer_op_request(&self, request: Request<OpInfo>) -> Result<Response<VoidType>, Status> {
        let info = request.into_inner();
        let remote = self.known_remote(&info.ident)?;
        match remote.transfer(info.timestamp) {
            Some(transfer) => {
                transfer.make_declined();
            }
            None => warn!("{} cancelled unknown transfer {}", info.ident, info.timestamp),
        }
        Ok(Response::new(VoidType::default()))
    }

    type StartTransferStream = ReceiverStream<Result<FileChunk, Status>>;

    async fn start_transfer(&self, request: Request<OpInfo>) -> Result<Response<Self::StartTransferStream>, Status> {
        let info = request.into_inner();
        let remote = self.known_remote(&info.ident)?;
        let transfer = remote.outgoing_transfer(info.timestamp).ok_or_else(|| {
            warn!("{} asked for unknown transfer {}", info.ident, info.timestamp);
            Status::not_found(format!("Unknown transfer {}", info.timestamp))
        })?;
        if remote.status() != RemoteStatus::Connected {
            warn!("{} asked for transfer {} while {:?}", info.ident, info.timestamp, remote.status());
            return Err(Status::failed_precondition(format!("Not connected to {}", info.ident)));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move { transfer.start_sending(tx).await });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn stop_transfer(&self, request: Request<StopInfo>) -> Result<Response<VoidType>, Status> {
        let stop = request.into_inner();
        let info = op_info(stop.info)?;
        let remote = self.known_remote(&info.ident)?;
        match remote.transfer(info.timestamp) {
            Some(transfer) => {
                info!(
                    "{} stopped transfer {}{}",
                    info.ident,
                    info.timestamp,
                    if stop.error { " with an error" } else { "" }
                );
                transfer.on_stopped(stop.error).await;
            }
            None => warn!("{} stopped unknown transfer {}", info.ident, info.timestamp),
        }
        Ok(Response::new(VoidType::default()))
    }

    async fn ping(&self, request: Request<LookupName>) -> Result<Response<VoidType>, Status> {
        trace!("Ping from {}", request.get_ref().id);
        Ok(Response::new(VoidType::default()))
    }
}

/// Serve the authenticated service on `listener` until `shutdown` fires
pub fn start_grpc_server(
    engine: Arc<Engine>,
    listener: TcpListener,
    shutdown: oneshot::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let addr = listener.local_addr()?;
    let identity = engine.context().certs.server_identity();
    let service = WarpService::new(engine);

    let server = Server::builder()
        .tls_config(ServerTlsConfig::new().identity(identity))
        .context("Invalid server TLS configuration")?
        .add_service(WarpServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
            let _ = shutdown.await;
        });

    let handle = tokio::spawn(async move {
        match server.await {
            Ok(_) => info!("gRPC server shutdown gracefully"),
            Err(e) => error!("gRPC server error: {}", e),
        }
    });

    info!("gRPC server listening on {}", addr);
    Ok(handle)
}

/// Channel to a peer that trusts nothing but the peer's bootstrapped
/// certificate. Connects on first use.
pub fn connect_channel(address: IpAddr, port: u16, certificate: Certificate) -> Result<Channel> {
    let uri = format!("https://{}", SocketAddr::new(address, port));
    let tls = ClientTlsConfig::new()
        .ca_certificate(certificate)
        .domain_name(CERTIFICATE_DOMAIN);

    let endpoint = Endpoint::from_shared(uri.clone())
        .with_context(|| format!("Invalid endpoint {}", uri))?
        .tls_config(tls)
        .context("Invalid client TLS configuration")?
        .connect_timeout(CONNECT_TIMEOUT);

    debug!("Created channel to {}", uri);
    Ok(endpoint.connect_lazy())
}
