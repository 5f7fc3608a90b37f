//! Authoritative DNS over UDP
//!
//! One socket, one task: answer synthesis is pure CPU and sub-millisecond,
//! so a single blocking loop keeps ordering trivial and needs no fan-out.

mod caa;
mod zone;

pub use caa::convert_txt_to_caa;
pub use zone::{ZoneAuthority, MAX_PACKET};

use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Serve the zone until shutdown is signalled.
///
/// Transient receive errors are logged and the loop continues; no packet may
/// take the process down.
pub async fn serve(
    socket: UdpSocket,
    authority: Arc<ZoneAuthority>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = socket.local_addr().ok();
    info!(addr = ?local, "dns server listening");

    let mut buf = [0u8; MAX_PACKET];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "dns receive failed");
                        continue;
                    }
                };

                let Some(reply) = authority.respond(&buf[..len]).await else {
                    debug!(%peer, "dropped unanswerable packet");
                    continue;
                };
                if let Err(e) = socket.send_to(&reply, peer).await {
                    warn!(%peer, error = %e, "dns send failed");
                }
            }
        }
    }

    info!("dns server stopped");
}
