//! gRPC transport: generated protobuf code and the server entry points

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use super::gateway::CoderGateway;

// Include the generated proto code
pub mod codexec {
    tonic::include_proto!("codexec");
}

use codexec::coder_service_server::CoderServiceServer;

/// Serve the gateway on `addr` until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    gateway: CoderGateway,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    info!(%addr, "gRPC server listening");
    Server::builder()
        .add_service(CoderServiceServer::new(gateway))
        .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
        .await
}

/// Serve the gateway on an already bound listener (port 0 in tests)
pub async fn serve_listener(
    listener: TcpListener,
    gateway: CoderGateway,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(CoderServiceServer::new(gateway))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
}
