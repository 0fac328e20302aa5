#![cfg(feature = "signaling-server")]

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;

use screenlink::signal::{signaling_router, SignalClient, SignalEvent};
use screenlink::wire::{Envelope, ROLE_CTL, TYPE_CONNECT, TYPE_ONLINE_ONE};

async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = signaling_router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

fn client(base: &str, peer_id: &str) -> SignalClient {
    let url = url::Url::parse(&format!("{base}?sessionId={peer_id}")).unwrap();
    let (client, _task) = SignalClient::connect(url, Duration::from_secs(30));
    client
}

async fn wait_for<F>(rx: &mut tokio::sync::broadcast::Receiver<SignalEvent>, mut pred: F)
where
    F: FnMut(&SignalEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for event");
}

#[tokio::test]
async fn envelopes_route_between_two_peers() {
    let base = spawn_relay().await;

    let alice = client(&base, "ALICE");
    let mut alice_rx = alice.subscribe();
    wait_for(&mut alice_rx, |event| {
        matches!(event, SignalEvent::Connected)
    })
    .await;

    let bob = client(&base, "BOB");
    let mut bob_rx = bob.subscribe();
    wait_for(&mut bob_rx, |event| matches!(event, SignalEvent::Connected)).await;

    // The relay announces Bob to Alice.
    wait_for(&mut alice_rx, |event| match event {
        SignalEvent::Text(text) => {
            Envelope::decode(text.as_bytes())
                .map(|env| {
                    env.kind == TYPE_ONLINE_ONE
                        && env.data.as_ref().and_then(|d| d.get("sn")).is_some()
                })
                .unwrap_or(false)
        }
        _ => false,
    })
    .await;

    // Alice sends a connect envelope addressed to Bob; only Bob sees it.
    let mut connect = Envelope::new(ROLE_CTL, TYPE_CONNECT);
    connect.sender = Some("ALICE".into());
    connect.receiver = Some("BOB".into());
    connect.receiver_pwd = Some("ABCD1234".into());
    connect.fps = Some(15);
    connect.is_only_file = Some(false);
    alice.send_text(connect.encode().unwrap());

    wait_for(&mut bob_rx, |event| match event {
        SignalEvent::Text(text) => Envelope::decode(text.as_bytes())
            .map(|env| {
                env.kind == TYPE_CONNECT
                    && env.sender.as_deref() == Some("ALICE")
                    && env.receiver_pwd.as_deref() == Some("ABCD1234")
            })
            .unwrap_or(false),
        _ => false,
    })
    .await;

    alice.close();
    bob.close();
}

#[tokio::test]
async fn reconnect_status_fires_when_the_server_is_unreachable() {
    // Nothing listens on this port; the client should report phase-0
    // reconnect attempts with 1 s delays.
    let url = url::Url::parse("ws://127.0.0.1:9/ws?sessionId=LONELY").unwrap();
    let (client, _task) = SignalClient::connect(url, Duration::from_secs(30));
    let mut rx = client.subscribe();

    let mut seen = 0u32;
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(SignalEvent::ReconnectStatus {
                phase,
                attempt,
                next_delay,
            }) = rx.recv().await
            {
                assert_eq!(phase, 0);
                assert!(attempt >= 1);
                assert_eq!(next_delay.as_secs(), 1);
                seen += 1;
                if seen >= 2 {
                    return;
                }
            }
        }
    })
    .await
    .expect("no reconnect status events");

    client.close();
}

#[tokio::test]
async fn binary_envelopes_are_accepted() {
    let base = spawn_relay().await;

    let alice = client(&base, "A2");
    let mut alice_rx = alice.subscribe();
    wait_for(&mut alice_rx, |event| {
        matches!(event, SignalEvent::Connected)
    })
    .await;
    let bob = client(&base, "B2");
    let mut bob_rx = bob.subscribe();
    wait_for(&mut bob_rx, |event| matches!(event, SignalEvent::Connected)).await;

    let mut envelope = Envelope::new(ROLE_CTL, TYPE_CONNECT);
    envelope.sender = Some("A2".into());
    envelope.receiver = Some("B2".into());
    alice.send_binary(envelope.encode().unwrap().into_bytes());

    // The relay re-emits as text; the receiving side accepts either frame
    // kind.
    wait_for(&mut bob_rx, |event| {
        let raw: Option<Vec<u8>> = match event {
            SignalEvent::Text(text) => Some(text.clone().into_bytes()),
            SignalEvent::Binary(bytes) => Some(bytes.clone()),
            _ => None,
        };
        raw.and_then(|bytes| Envelope::decode(&bytes).ok())
            .map(|env| env.kind == TYPE_CONNECT && env.sender.as_deref() == Some("A2"))
            .unwrap_or(false)
    })
    .await;

    alice.close();
    bob.close();
}
