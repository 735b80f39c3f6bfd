//! Client connection handling: the per-connection lifecycle from accept
//! through authentication to teardown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::BytesMut;
use chatrelay::Error;
use chatrelay::frame::{decode_frame, frame_text};
use chatrelay::protocol::{AuthMode, AuthRequest, ClientMessage, password_hash};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers::handle_client_message;
use crate::state::{SharedState, UserSession};
use crate::store::Stores;

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: SharedState,
    stores: Arc<Stores>,
    config: Config,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<BytesMut>();

    // Writer task: the only writer of this connection's socket, so
    // outbound frames never interleave. Exits once every sender is gone.
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_half.write_all(&msg).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut read_buf = BytesMut::with_capacity(8192);

    let mut outcome = Ok(());
    let username =
        match authenticate(&mut read_half, &mut read_buf, &tx, &state, &stores, &config).await {
            Ok(username) => username,
            Err(e) => {
                outcome = Err(e);
                None
            }
        };

    if let Some(ref username) = username {
        info!(%addr, user = %username, "user connected");

        outcome = active_loop(
            username,
            &mut read_half,
            &mut read_buf,
            &tx,
            &state,
            &stores,
            &config,
        )
        .await;

        // Removal is idempotent; this handler added the session, this
        // handler is the one that takes it out.
        if state.write().await.remove_session(username).is_some() {
            info!(user = %username, "user disconnected");
        }
    }

    // Dropping our sender lets the writer drain queued notices and close.
    drop(tx);
    let _ = write_handle.await;

    outcome
}

/// Read until one complete frame is buffered. Returns `None` on peer
/// shutdown, including one that truncates a partial frame.
async fn next_frame(
    read_half: &mut OwnedReadHalf,
    read_buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<BytesMut>> {
    loop {
        if let Some(frame) = decode_frame(read_buf, max_len)? {
            return Ok(Some(frame));
        }
        let n = read_half.read_buf(read_buf).await?;
        if n == 0 {
            return Ok(None);
        }
    }
}

fn refuse(tx: &mpsc::UnboundedSender<BytesMut>, notice: &str) {
    let _ = tx.send(frame_text(notice));
}

/// Usernames land in colon-delimited store files and comma-separated
/// member lists, so those delimiters cannot appear in one.
fn valid_username(username: &str) -> bool {
    username.len() <= 30
        && !username
            .chars()
            .any(|c| matches!(c, ':' | ',' | '|') || c.is_control())
}

/// Handle the first-frame authentication handshake. Returns the bound
/// username on success; `None` means the connection was refused and the
/// appropriate notice queued.
async fn authenticate(
    read_half: &mut OwnedReadHalf,
    read_buf: &mut BytesMut,
    tx: &mpsc::UnboundedSender<BytesMut>,
    state: &SharedState,
    stores: &Stores,
    config: &Config,
) -> Result<Option<String>> {
    let Some(frame) = next_frame(read_half, read_buf, config.max_frame_len).await? else {
        return Ok(None);
    };

    let Ok(text) = std::str::from_utf8(&frame) else {
        refuse(tx, "[Server] Authentication failed.");
        return Ok(None);
    };

    let auth = match AuthRequest::parse(text) {
        Ok(auth) => auth,
        Err(Error::InvalidAuthMode(_)) => {
            refuse(tx, "[Server] Invalid mode.");
            return Ok(None);
        }
        Err(_) => {
            refuse(tx, "[Server] Authentication failed.");
            return Ok(None);
        }
    };

    let AuthRequest {
        mode,
        username,
        password,
    } = auth;

    if username.is_empty() || password.is_empty() {
        refuse(tx, "[Server] Authentication failed.");
        return Ok(None);
    }

    let hash = password_hash(&password);

    match mode {
        AuthMode::Register => {
            if !valid_username(&username) {
                refuse(tx, "[Server] Invalid username.");
                return Ok(None);
            }
            if !stores.credentials.register(&username, &hash)? {
                refuse(tx, "[Server] Username already exists.");
                return Ok(None);
            }
        }
        AuthMode::Login => {
            if stores.credentials.lookup(&username).as_deref() != Some(hash.as_str()) {
                refuse(tx, "[Server] Authentication failed.");
                return Ok(None);
            }
        }
    }

    // Check-and-insert happens under one write lock, so two logins for
    // the same name cannot both pass. An existing session is never
    // displaced; the newcomer is the one turned away.
    {
        let mut registry = state.write().await;
        if registry.online_count() >= config.max_users as usize {
            refuse(tx, "[Server] Server is full.");
            return Ok(None);
        }
        if registry.is_online(&username)
            || !registry.add_session(UserSession::new(username.clone(), tx.clone()))
        {
            refuse(
                tx,
                &format!("[Server] User '{username}' is already logged in."),
            );
            return Ok(None);
        }
    }

    let welcome = match mode {
        AuthMode::Register => format!("[Server] Registered successfully. Welcome {username}!"),
        AuthMode::Login => format!("[Server] Welcome {username}!"),
    };
    let _ = tx.send(frame_text(&welcome));
    if !config.motd.is_empty() {
        let _ = tx.send(frame_text(&config.motd));
    }

    Ok(Some(username))
}

/// Receive and dispatch framed messages until logout, peer shutdown, or a
/// read error. Malformed frames draw a notice and leave the connection
/// open.
async fn active_loop(
    username: &str,
    read_half: &mut OwnedReadHalf,
    read_buf: &mut BytesMut,
    tx: &mpsc::UnboundedSender<BytesMut>,
    state: &SharedState,
    stores: &Stores,
    config: &Config,
) -> Result<()> {
    while let Some(frame) = next_frame(read_half, read_buf, config.max_frame_len).await? {
        let parsed = std::str::from_utf8(&frame)
            .map_err(Error::from)
            .and_then(ClientMessage::parse);

        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                warn!(user = %username, error = %e, "unparseable frame");
                let notice = match e {
                    Error::UnknownMessageTag(_) => "[Server] Unknown message type.",
                    Error::MalformedFileMessage | Error::Base64(_) => {
                        "[Server] Invalid file message format."
                    }
                    _ => "[Server] Invalid message format.",
                };
                let _ = tx.send(frame_text(notice));
                continue;
            }
        };

        if !handle_client_message(message, username, tx, state, stores).await {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServerState;
    use chatrelay::frame::DEFAULT_MAX_FRAME_LEN;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::RwLock;
    use tokio::time::{sleep, timeout};

    struct TestServer {
        addr: SocketAddr,
        state: SharedState,
        stores: Arc<Stores>,
        _dir: tempfile::TempDir,
    }

    async fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            users_file: dir.path().join("users.txt"),
            groups_file: dir.path().join("groups.txt"),
            log_file: dir.path().join("chat_log.txt"),
            ..Config::default()
        };
        let state: SharedState = Arc::new(RwLock::new(ServerState::new()));
        let stores = Arc::new(Stores::open(&config).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        {
            let state = state.clone();
            let stores = stores.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    let state = state.clone();
                    let stores = stores.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, peer, state, stores, config).await;
                    });
                }
            });
        }

        TestServer {
            addr,
            state,
            stores,
            _dir: dir,
        }
    }

    struct Client {
        stream: TcpStream,
        buf: BytesMut,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Client {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, text: &str) {
            self.stream.write_all(&frame_text(text)).await.unwrap();
        }

        async fn recv(&mut self) -> String {
            timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(frame) = decode_frame(&mut self.buf, DEFAULT_MAX_FRAME_LEN).unwrap()
                    {
                        return String::from_utf8(frame.to_vec()).unwrap();
                    }
                    let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                    assert!(n > 0, "connection closed while waiting for a frame");
                }
            })
            .await
            .expect("timed out waiting for a frame")
        }

        /// Connect, authenticate, and return the first reply.
        async fn auth(addr: SocketAddr, mode: &str, username: &str, password: &str) -> (Self, String) {
            let mut client = Self::connect(addr).await;
            client.send(&format!("{mode}|{username}:{password}")).await;
            let reply = client.recv().await;
            (client, reply)
        }
    }

    async fn wait_offline(server: &TestServer, username: &str) {
        for _ in 0..250 {
            if !server.state.read().await.is_online(username) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("{username} still online");
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let server = start_server().await;

        let (alice, reply) = Client::auth(server.addr, "register", "alice", "pw").await;
        assert_eq!(reply, "[Server] Registered successfully. Welcome alice!");

        drop(alice);
        wait_offline(&server, "alice").await;

        let (_alice, reply) = Client::auth(server.addr, "login", "alice", "pw").await;
        assert_eq!(reply, "[Server] Welcome alice!");
    }

    #[tokio::test]
    async fn test_login_failures() {
        let server = start_server().await;

        let (_alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;

        let (_c, reply) = Client::auth(server.addr, "login", "alice", "wrong").await;
        assert_eq!(reply, "[Server] Authentication failed.");

        let (_c, reply) = Client::auth(server.addr, "login", "nobody", "pw").await;
        assert_eq!(reply, "[Server] Authentication failed.");

        let (_c, reply) = Client::auth(server.addr, "admin", "alice", "pw").await;
        assert_eq!(reply, "[Server] Invalid mode.");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let server = start_server().await;

        let (_alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (_c, reply) = Client::auth(server.addr, "register", "alice", "other").await;
        assert_eq!(reply, "[Server] Username already exists.");
    }

    #[tokio::test]
    async fn test_duplicate_login_rejected_not_displaced() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (_intruder, reply) = Client::auth(server.addr, "login", "alice", "pw").await;
        assert_eq!(reply, "[Server] User 'alice' is already logged in.");

        // The original connection keeps working.
        let (_bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;
        alice.send("U:bob:still here").await;
        assert!(server.state.read().await.is_online("alice"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_else() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (mut bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;
        let (mut carol, _) = Client::auth(server.addr, "register", "carol", "pw").await;

        alice.send("B::hello everyone").await;
        assert_eq!(bob.recv().await, "[alice -> All]: hello everyone");
        assert_eq!(carol.recv().await, "[alice -> All]: hello everyone");

        // The sender never sees her own broadcast: the next frame alice
        // receives is bob's direct reply, not the broadcast.
        bob.send("U:alice:got it").await;
        assert_eq!(alice.recv().await, "[bob -> You]: got it");
    }

    #[tokio::test]
    async fn test_unicast_resolution() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;

        alice.send("U:ghost:anyone?").await;
        assert_eq!(
            alice.recv().await,
            "[Server] User 'ghost' does not exist."
        );

        // Known to the credential store but never online.
        server
            .stores
            .credentials
            .register("eve", &password_hash("pw"))
            .unwrap();
        alice.send("U:eve:you there?").await;
        assert_eq!(
            alice.recv().await,
            "[Server] User 'eve' exists but is not online."
        );

        let (mut bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;
        alice.send("U:bob:hi bob").await;
        assert_eq!(bob.recv().await, "[alice -> You]: hi bob");
    }

    #[tokio::test]
    async fn test_group_create_and_multicast() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (mut bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;

        alice.send("C:team:bob").await;
        assert_eq!(
            alice.recv().await,
            "[Server] Group 'team' created with members: bob, alice."
        );

        bob.send("M:team:morning").await;
        assert_eq!(alice.recv().await, "[bob -> team]: morning");

        let (mut carol, _) = Client::auth(server.addr, "register", "carol", "pw").await;
        carol.send("M:team:can I join?").await;
        assert_eq!(
            carol.recv().await,
            "[Server] You are not a member of group 'team'."
        );
    }

    #[tokio::test]
    async fn test_group_recreation_replaces_membership() {
        let server = start_server().await;

        let (mut carol, _) = Client::auth(server.addr, "register", "carol", "pw").await;

        carol.send("C:G:alice,bob").await;
        assert_eq!(
            carol.recv().await,
            "[Server] Group 'G' created with members: alice, bob, carol."
        );

        carol.send("C:G:dave").await;
        assert_eq!(
            carol.recv().await,
            "[Server] Group 'G' created with members: dave, carol."
        );
    }

    #[tokio::test]
    async fn test_file_transfer_large_payload_intact() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (mut bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;

        // 2000 raw bytes, well past any single small read.
        let message = ClientMessage::FileTransfer {
            target: "bob".to_string(),
            filename: "data.bin".to_string(),
            payload: (0..2000u32).map(|i| (i % 256) as u8).collect(),
        };
        alice.send(&message.encode()).await;

        assert_eq!(
            bob.recv().await,
            "[alice -> You]: File received: data.bin"
        );

        // Frames stay delimited: a follow-up message arrives separately.
        alice.send("U:bob:after the file").await;
        assert_eq!(bob.recv().await, "[alice -> You]: after the file");
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_open() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (mut bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;

        alice.send("complete nonsense").await;
        assert_eq!(alice.recv().await, "[Server] Invalid message format.");

        alice.send("X:bob:hello").await;
        assert_eq!(alice.recv().await, "[Server] Unknown message type.");

        alice.send("F:bob:file.bin").await;
        assert_eq!(alice.recv().await, "[Server] Invalid file message format.");

        alice.send("B::recovered").await;
        assert_eq!(bob.recv().await, "[alice -> All]: recovered");
    }

    #[tokio::test]
    async fn test_disconnect_removes_only_own_session() {
        let server = start_server().await;

        let (_alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        let (bob, _) = Client::auth(server.addr, "register", "bob", "pw").await;

        drop(bob);
        wait_offline(&server, "bob").await;
        assert!(server.state.read().await.is_online("alice"));

        let (_bob, reply) = Client::auth(server.addr, "login", "bob", "pw").await;
        assert_eq!(reply, "[Server] Welcome bob!");
    }

    #[tokio::test]
    async fn test_logout_frame_ends_session() {
        let server = start_server().await;

        let (mut alice, _) = Client::auth(server.addr, "register", "alice", "pw").await;
        alice.send("Q::").await;
        wait_offline(&server, "alice").await;
    }
}
