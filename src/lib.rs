//! CIFS Mamont - An SMB1 (CIFS) server protocol engine in Rust.

pub mod config;
pub mod info;
pub mod message_types;
pub mod notify;
pub mod oplock;
pub mod pack;
pub mod packet;
pub mod protocol;
pub mod search;
pub mod session;
pub mod smb1;
pub mod status;
pub mod transact;
pub mod vfs;

mod engine_task;
mod read_task;
mod stream_writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::config::ServerConfig;
use crate::engine_task::EngineTask;
use crate::message_types::{create_engine_channel, create_response_channel};
use crate::read_task::ReadTask;
use crate::session::tree::ShareList;
use crate::session::SmbSession;
use crate::stream_writer::StreamWriter;
use crate::vfs::Authenticator;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Starts the SMB server and processes client connections.
pub async fn handle_forever(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    shares: Arc<ShareList>,
    authenticator: Arc<dyn Authenticator>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        info!(%peer, "connection accepted");
        process_socket(socket, Arc::clone(&config), Arc::clone(&shares), Arc::clone(&authenticator));
    }
}

/// Wires one connection's task pipeline: reader, engine, writer,
/// connected by the session's channels.
pub fn process_socket(
    socket: TcpStream,
    config: Arc<ServerConfig>,
    shares: Arc<ShareList>,
    authenticator: Arc<dyn Authenticator>,
) {
    let (readhalf, writehalf) = socket.into_split();
    let (engine_send, engine_recv) = create_engine_channel();
    let (reply_send, reply_recv) = create_response_channel();

    let session = SmbSession::new(
        NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        config,
        shares,
        authenticator,
        reply_send,
        engine_send.clone(),
    );

    ReadTask::spawn(readhalf, engine_send);
    EngineTask::spawn(session, engine_recv);
    StreamWriter::spawn(writehalf, reply_recv);
}
