//! End-to-end proxy run: a stub requests a command, the agent dials a mock
//! SSH server through the stub's transport stream, injects the approved
//! command, and reports the handoff offset on the control stream.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Framed;

use kw_agent::mux::{MuxRole, MuxSession};
use kw_core::Approval;
use kw_protocol::{ControlCodec, ExecutionRequest, HandoffComplete, MsgNum};

use common::*;

/// SSH server that accepts any public key and answers `uptime` with a
/// fixed 42-byte payload.
struct MockSshServer;

#[async_trait]
impl russh::server::Handler for MockSshServer {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        assert_eq!(data, b"uptime");
        session.channel_success(channel);
        session.data(channel, CryptoVec::from_slice(&[b'x'; 42]));
        Ok(())
    }
}

/// Client handler for the stub's SSH session with the agent
struct TrustingClient;

#[async_trait]
impl russh::client::Handler for TrustingClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[tokio::test]
async fn proxy_injects_command_and_reports_handoff_offset() {
    tokio::time::timeout(Duration::from_secs(60), run_scenario())
        .await
        .expect("proxy scenario timed out");
}

async fn run_scenario() {
    // The remote server's host key is already in the user's known_hosts
    let host_key = KeyPair::generate_ed25519().unwrap();
    let host_public = host_key.clone_public_key().unwrap();
    let fixture = test_agent(
        Approval::Once,
        &[format!(
            "srv.example ssh-ed25519 {}",
            host_public.public_key_base64()
        )],
        vec![test_signer()],
    );

    let (mut conn, _handle) = connect_stub(&fixture.agent);

    send(&mut conn, laptop_notice().into()).await;
    send(
        &mut conn,
        ExecutionRequest {
            user: "alice".to_string(),
            server: "srv.example".to_string(),
            command: "uptime".to_string(),
        }
        .into(),
    )
    .await;
    expect_msg(&mut conn, MsgNum::ExecutionApproved).await;

    // Promote the connection and open the three streams in order
    let parts = conn.into_parts();
    let mut mux = MuxSession::new(parts.io, MuxRole::Initiator, parts.read_buf, 1);
    let control = mux.open().unwrap();
    let ssh_data = mux.open().unwrap();
    let transport = mux.open().unwrap();

    // The mock sshd sits behind an in-memory socket owned by the stub
    let (server_io, transport_peer) = tokio::io::duplex(1024 * 1024);
    let mut server_config = russh::server::Config::default();
    server_config.keys.push(host_key);
    tokio::spawn(async move {
        match russh::server::run_stream(Arc::new(server_config), server_io, MockSshServer).await {
            Ok(session) => {
                let _ = session.await;
            }
            Err(e) => panic!("mock sshd failed: {}", e),
        }
    });

    // The stub blindly forwards transport bytes both ways, counting what
    // the server produced
    let from_server = Arc::new(AtomicU64::new(0));
    let counted = Arc::clone(&from_server);
    let (mut agent_r, mut agent_w) = tokio::io::split(transport);
    let (mut server_r, mut server_w) = tokio::io::split(transport_peer);
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut agent_r, &mut server_w).await;
    });
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match server_r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    counted.fetch_add(n as u64, Ordering::SeqCst);
                    if agent_w.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // The stub's own SSH view: a client session with the agent over
    // ssh_data, requesting the approved command
    let stub_client = tokio::spawn(async move {
        let config = Arc::new(russh::client::Config::default());
        let mut handle = russh::client::connect_stream(config, ssh_data, TrustingClient)
            .await
            .expect("stub-side SSH handshake failed");
        assert!(handle.authenticate_none("stub").await.unwrap());

        let mut channel = handle.channel_open_session().await.unwrap();
        channel.exec(true, "uptime".as_bytes()).await.unwrap();

        let mut output = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => panic!("agent refused the approved command"),
                Some(ChannelMsg::Data { data }) => output.extend_from_slice(&data),
                Some(_) => continue,
                None => panic!("stub session closed before the exec reply"),
            }
        }
        output
    });

    // The final control message carries the resume offset
    let mut control = Framed::new(control, ControlCodec::new());
    let packet = control
        .next()
        .await
        .expect("control stream closed without a handoff message")
        .expect("control stream error");
    assert_eq!(packet.msg_num, MsgNum::HandoffComplete);

    let handoff = HandoffComplete::decode(&packet.payload).unwrap();
    let forwarded = from_server.load(Ordering::SeqCst);
    assert!(handoff.next_transport_byte > 0);
    assert!(
        u64::from(handoff.next_transport_byte) <= forwarded,
        "offset {} beyond the {} bytes the server produced",
        handoff.next_transport_byte,
        forwarded
    );

    // No second control message follows a completed handoff
    assert!(control.next().await.is_none());

    let _ = stub_client.await;
}
