//! Shared fixtures for the integration tests: a scripted UI, an agent
//! wired to temporary stores, and a framed stub endpoint.
#![allow(dead_code)]

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use kw_agent::Agent;
use kw_core::config::AgentConfig;
use kw_core::{Approval, KnownHostsStore, Policy, Signer, Store, Ui};
use kw_protocol::{ControlCodec, ControlPacket, ForwardingNotice, MsgNum};

/// UI that answers every prompt the same way and records notifications
pub struct ScriptedUi {
    pub answer: Approval,
    pub prompts: AtomicUsize,
    pub informs: Mutex<Vec<String>>,
}

impl ScriptedUi {
    pub fn new(answer: Approval) -> Arc<Self> {
        Arc::new(Self {
            answer,
            prompts: AtomicUsize::new(0),
            informs: Mutex::new(Vec::new()),
        })
    }

    pub fn informed_with(&self, needle: &str) -> bool {
        self.informs
            .lock()
            .unwrap()
            .iter()
            .any(|text| text.contains(needle))
    }
}

#[async_trait]
impl Ui for ScriptedUi {
    async fn inform(&self, text: &str) {
        self.informs.lock().unwrap().push(text.to_string());
    }

    async fn prompt_approval(&self, _text: &str) -> Approval {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.answer
    }

    async fn confirm(&self, _text: &str) -> bool {
        self.answer != Approval::Deny
    }

    async fn ask_secret(&self, _prompt: &str) -> Option<String> {
        None
    }
}

/// A fresh ed25519 signer
pub fn test_signer() -> Signer {
    Signer::new(russh_keys::key::KeyPair::generate_ed25519().unwrap())
}

/// Agent with temporary policy and known_hosts stores
pub struct TestAgent {
    pub agent: Arc<Agent>,
    pub ui: Arc<ScriptedUi>,
    pub known_hosts_path: PathBuf,
    _dir: tempfile::TempDir,
}

/// Build an agent whose UI always gives `answer`, with the given
/// known_hosts lines and signers.
pub fn test_agent(answer: Approval, known_hosts_lines: &[String], signers: Vec<Signer>) -> TestAgent {
    let dir = tempfile::tempdir().unwrap();

    let known_hosts_path = dir.path().join("known_hosts");
    let mut file = std::fs::File::create(&known_hosts_path).unwrap();
    for line in known_hosts_lines {
        writeln!(file, "{}", line).unwrap();
    }
    drop(file);

    let mut config = AgentConfig::default();
    config.known_hosts_path = known_hosts_path.clone();
    config.policy_path = dir.path().join("policy.toml");
    config.socket_path = dir.path().join("agent.sock");
    config.connect_timeout = Duration::from_secs(10);

    let ui = ScriptedUi::new(answer);
    let store = Store::load(&config.policy_path).unwrap();
    let known_hosts = KnownHostsStore::load(&config.known_hosts_path).unwrap();
    let policy = Policy::new(store, ui.clone());

    TestAgent {
        agent: Arc::new(Agent::from_parts(config, policy, known_hosts, signers)),
        ui,
        known_hosts_path,
        _dir: dir,
    }
}

/// The stub's framed view of its connection to the agent
pub type StubConn = Framed<DuplexStream, ControlCodec>;

/// Connect a stub to the agent over an in-memory transport. The agent's
/// handler runs in a background task whose result the caller can await.
pub fn connect_stub(
    agent: &Arc<Agent>,
) -> (StubConn, tokio::task::JoinHandle<Result<(), kw_agent::AgentError>>) {
    let (stub_side, agent_side) = tokio::io::duplex(256 * 1024);
    let agent = Arc::clone(agent);
    let handle = tokio::spawn(async move { agent.handle_connection(agent_side).await });
    (Framed::new(stub_side, ControlCodec::new()), handle)
}

/// Standard forwarding notice used by the scenarios
pub fn laptop_notice() -> ForwardingNotice {
    ForwardingNotice {
        readable_name: "laptop".to_string(),
        host: "10.0.0.2".to_string(),
        port: 2222,
    }
}

/// Send a packet and panic on failure
pub async fn send(conn: &mut StubConn, packet: ControlPacket) {
    conn.send(packet).await.expect("send to agent failed");
}

/// Receive the next packet, asserting its message number
pub async fn expect_msg(conn: &mut StubConn, msg_num: MsgNum) -> ControlPacket {
    let packet = tokio::time::timeout(Duration::from_secs(10), conn.next())
        .await
        .expect("timed out waiting for agent reply")
        .expect("connection closed while awaiting reply")
        .expect("protocol error on stub side");
    assert_eq!(packet.msg_num, msg_num, "unexpected reply {:?}", packet.msg_num);
    packet
}
