//! Replica challenge sharing
//!
//! A fixed-size UDP request/response RPC that lets a secondary node answer
//! validation queries on behalf of the primary. Requests are JSON padded to
//! 512 bytes with trailing spaces; responses are a JSON array of raw key
//! authorizations and must not exceed the request length, so a peer can
//! always fit its reply in the same buffer. Failures are silent: log and
//! answer with nothing.

use crate::acme::broker::{ChallengeBroker, ChallengeKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Every datagram in the protocol is exactly this long (requests) or at most
/// this long (responses).
pub const PACKET_SIZE: usize = 512;

/// Probe deadline; a slow peer is treated as an empty one.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
struct ReplicaRequest {
    challenge_type: String,
    challenge_id: String,
}

// ============================================================================
// Client
// ============================================================================

/// Fetch a peer's raw key authorizations for a challenge identifier.
pub async fn probe(peer: &str, kind: ChallengeKind, identifier: &str) -> Vec<String> {
    match probe_inner(peer, kind, identifier).await {
        Ok(authorizations) => authorizations,
        Err(e) => {
            warn!(peer, error = %e, "replica probe failed");
            Vec::new()
        }
    }
}

async fn probe_inner(
    peer: &str,
    kind: ChallengeKind,
    identifier: &str,
) -> std::io::Result<Vec<String>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(peer).await?;

    let request = ReplicaRequest {
        challenge_type: kind.as_str().to_string(),
        challenge_id: identifier.to_string(),
    };
    let mut packet = serde_json::to_vec(&request)?;
    if packet.len() > PACKET_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("request size too long: {}", packet.len()),
        ));
    }
    packet.resize(PACKET_SIZE, b' ');
    socket.send(&packet).await?;

    let mut buf = [0u8; PACKET_SIZE];
    let len = tokio::time::timeout(PROBE_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "replica timed out"))??;

    Ok(serde_json::from_slice(&buf[..len])?)
}

// ============================================================================
// Server
// ============================================================================

/// Answer probes from peers with our local key authorizations.
///
/// The response must not exceed the length of the request it answers;
/// anything longer is dropped rather than truncated.
pub async fn serve(
    socket: UdpSocket,
    broker: Arc<ChallengeBroker>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?socket.local_addr().ok(), "replica server listening");

    let mut buf = [0u8; PACKET_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "replica receive failed");
                        continue;
                    }
                };

                // Trailing space padding is JSON whitespace; parse as-is.
                let request: ReplicaRequest = match serde_json::from_slice(&buf[..len]) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(%peer, error = %e, "malformed replica request");
                        continue;
                    }
                };
                let Some(kind) = ChallengeKind::parse(&request.challenge_type) else {
                    debug!(%peer, challenge_type = %request.challenge_type, "unknown challenge type");
                    continue;
                };

                let authorizations = broker.local_authorizations(kind, &request.challenge_id);
                let response = match serde_json::to_vec(&authorizations) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "failed to encode replica response");
                        continue;
                    }
                };
                if response.len() > len {
                    warn!(%peer, len = response.len(), "replica response longer than request");
                    continue;
                }
                if let Err(e) = socket.send_to(&response, peer).await {
                    warn!(%peer, error = %e, "replica send failed");
                }
            }
        }
    }

    info!("replica server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_padded_json() {
        let request = ReplicaRequest {
            challenge_type: "dns-01".into(),
            challenge_id: "example.com".into(),
        };
        let mut packet = serde_json::to_vec(&request).unwrap();
        packet.resize(PACKET_SIZE, b' ');

        assert_eq!(packet.len(), PACKET_SIZE);
        // Padding must not break parsing.
        let parsed: ReplicaRequest = serde_json::from_slice(&packet).unwrap();
        assert_eq!(parsed.challenge_id, "example.com");
    }
}
