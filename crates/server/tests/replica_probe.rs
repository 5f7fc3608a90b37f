//! Replica RPC over real loopback sockets.

use keyless_server::{replica, ChallengeBroker, ChallengeKind, ChallengeRecord};
use tokio::net::UdpSocket;
use tokio::sync::watch;

async fn start_replica(broker: std::sync::Arc<ChallengeBroker>) -> (String, watch::Sender<bool>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(replica::serve(socket, broker, shutdown_rx));
    (addr, shutdown_tx)
}

#[tokio::test]
async fn probe_returns_raw_key_authorizations() {
    let broker = ChallengeBroker::new();
    broker.present(ChallengeRecord::new(
        ChallengeKind::Dns01,
        "example.com",
        "token",
        "token.peer-thumbprint",
    ));
    let (addr, _shutdown) = start_replica(broker).await;

    let authorizations = replica::probe(&addr, ChallengeKind::Dns01, "example.com").await;
    assert_eq!(authorizations, vec!["token.peer-thumbprint".to_string()]);
}

#[tokio::test]
async fn probe_filters_by_transport_and_identifier() {
    let broker = ChallengeBroker::new();
    broker.present(ChallengeRecord::new(
        ChallengeKind::Http01,
        "example.com",
        "token",
        "token.peer-thumbprint",
    ));
    let (addr, _shutdown) = start_replica(broker).await;

    assert!(replica::probe(&addr, ChallengeKind::Dns01, "example.com")
        .await
        .is_empty());
    assert!(replica::probe(&addr, ChallengeKind::Http01, "other.com")
        .await
        .is_empty());
    assert_eq!(
        replica::probe(&addr, ChallengeKind::Http01, "example.com")
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn unreachable_peer_yields_empty() {
    // Nothing is listening here; the probe times out silently.
    let authorizations =
        replica::probe("127.0.0.1:9", ChallengeKind::Dns01, "example.com").await;
    assert!(authorizations.is_empty());
}
