use std::{net::SocketAddr, time::Duration};

use meshroom::{
    app_state::AppState,
    client::SignalingClient,
    config::IceConfig,
    protocol::{ClientMessage, PeerSummary, ServerMessage, SignalEnvelope, SignalType},
    server,
};
use serde_json::json;
use tokio::{net::TcpListener, time::timeout};

async fn start_server() -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(IceConfig::default());
    let app = server::router(state.clone(), "no-such-dir");
    tokio::spawn(async move { server::serve(listener, app).await });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> SignalingClient {
    SignalingClient::connect(&format!("ws://{addr}/ws")).await.unwrap()
}

async fn next(client: &mut SignalingClient) -> ServerMessage {
    timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for relay")
        .expect("relay closed the socket")
}

fn join(name: &str) -> ClientMessage {
    ClientMessage::JoinRoom {
        room_id: "demo".into(),
        display_name: Some(name.into()),
    }
}

fn summary(id: &str, name: &str) -> PeerSummary {
    PeerSummary {
        id: id.into(),
        name: name.into(),
    }
}

#[tokio::test]
async fn host_and_viewer_meet_in_demo_room() {
    let (addr, _state) = start_server().await;
    let mut host = connect(addr).await;
    let mut viewer = connect(addr).await;
    let host_id = host.id().to_string();
    let viewer_id = viewer.id().to_string();
    assert_ne!(host_id, viewer_id);

    host.send(join("Host")).unwrap();
    assert_eq!(next(&mut host).await, ServerMessage::ExistingPeers(vec![]));
    assert_eq!(
        next(&mut host).await,
        ServerMessage::RoomJoined {
            members: vec![summary(&host_id, "Host")]
        }
    );

    viewer.send(join("V1")).unwrap();
    assert_eq!(
        next(&mut host).await,
        ServerMessage::NewPeer(summary(&viewer_id, "V1"))
    );
    assert_eq!(
        next(&mut viewer).await,
        ServerMessage::ExistingPeers(vec![summary(&host_id, "Host")])
    );
    assert_eq!(
        next(&mut viewer).await,
        ServerMessage::RoomJoined {
            members: vec![summary(&host_id, "Host"), summary(&viewer_id, "V1")]
        }
    );
}

#[tokio::test]
async fn signals_are_relayed_verbatim_with_sender_stamped() {
    let (addr, _state) = start_server().await;
    let host = connect(addr).await;
    let mut viewer = connect(addr).await;
    let viewer_id = viewer.id().to_string();

    let offer = json!({ "type": "offer", "sdp": "v=0\r\n" });
    host.send(ClientMessage::Signal(SignalEnvelope {
        to: viewer_id.clone(),
        from: String::new(),
        kind: SignalType::Offer,
        data: offer.clone(),
    }))
    .unwrap();

    let ServerMessage::Signal(envelope) = next(&mut viewer).await else {
        panic!("expected a signal");
    };
    assert_eq!(envelope.from, host.id());
    assert_eq!(envelope.to, viewer_id);
    assert_eq!(envelope.data, offer);
}

#[tokio::test]
async fn disconnect_notifies_the_room() {
    let (addr, state) = start_server().await;
    let mut host = connect(addr).await;
    let viewer = connect(addr).await;
    let viewer_id = viewer.id().to_string();

    host.send(join("Host")).unwrap();
    next(&mut host).await;
    next(&mut host).await;
    viewer.send(join("V1")).unwrap();
    assert!(matches!(next(&mut host).await, ServerMessage::NewPeer(_)));

    viewer.close().await;
    assert_eq!(
        next(&mut host).await,
        ServerMessage::PeerLeft { id: viewer_id }
    );
    let members = state.directory.members("demo").await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].display_name, "Host");
}

#[tokio::test]
async fn playback_reaches_other_members() {
    let (addr, _state) = start_server().await;
    let mut host = connect(addr).await;
    let mut viewer = connect(addr).await;

    host.send(join("Host")).unwrap();
    next(&mut host).await;
    next(&mut host).await;
    viewer.send(join("V1")).unwrap();
    next(&mut viewer).await;
    next(&mut viewer).await;
    next(&mut host).await;

    host.send(ClientMessage::VideoSeek {
        time: 42.5,
        room_id: "demo".into(),
    })
    .unwrap();
    assert_eq!(
        next(&mut viewer).await,
        ServerMessage::VideoSeek {
            time: 42.5,
            room_id: "demo".into()
        }
    );
}
