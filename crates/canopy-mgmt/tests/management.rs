//! Integration tests driving the management service over real localhost
//! connections: registration races, key exhaustion, and update fan-out.

use std::sync::Arc;

use canopy_mgmt::account::RejectAllTokens;
use canopy_mgmt::setup_key::SetupKeyType;
use canopy_mgmt::{AccountManager, Config, FileStore, PeerUpdateManager, Server};
use canopy_proto::wire::{
    Credential, EncryptedMessage, LoginRequest, LoginResponse, MgmtRequest, MgmtResponse,
    PeerSystemMeta, SyncRequest, SyncResponse,
};
use canopy_proto::{Code, FrameCodec, PublicKey, SecretKey};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

struct TestService {
    addr: std::net::SocketAddr,
    manager: Arc<AccountManager>,
    account_id: String,
    reusable_key: String,
    one_off_key: String,
    shutdown: CancellationToken,
}

async fn start_service() -> TestService {
    let dir = std::env::temp_dir().join(format!("canopy-mgmt-it-{}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();

    let store = FileStore::open(&dir).unwrap();
    let updates = Arc::new(PeerUpdateManager::new());
    let manager = Arc::new(
        AccountManager::new(store, updates.clone(), Box::new(RejectAllTokens)).await,
    );
    let (account_id, keys) = manager.add_account().await.unwrap();
    let reusable_key = keys
        .iter()
        .find(|k| k.key_type == SetupKeyType::Reusable)
        .unwrap()
        .key
        .clone();
    let one_off_key = keys
        .iter()
        .find(|k| k.key_type == SetupKeyType::OneOff)
        .unwrap()
        .key
        .clone();

    let mut config = Config::default();
    config.data_dir = dir;
    let shutdown = CancellationToken::new();
    let server = Arc::new(Server::new(
        manager.clone(),
        updates,
        SecretKey::generate(),
        Arc::new(config),
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run(listener));

    TestService { addr, manager, account_id, reusable_key, one_off_key, shutdown }
}

type ClientFramed = Framed<TcpStream, FrameCodec<MgmtRequest, MgmtResponse>>;

async fn connect(service: &TestService) -> ClientFramed {
    let stream = TcpStream::connect(service.addr).await.unwrap();
    Framed::new(stream, FrameCodec::new())
}

async fn fetch_server_key(framed: &mut ClientFramed) -> PublicKey {
    framed.send(MgmtRequest::GetServerKey).await.unwrap();
    match framed.next().await.unwrap().unwrap() {
        MgmtResponse::ServerKey(sk) => sk.key,
        other => panic!("expected ServerKey, got {other:?}"),
    }
}

async fn login(
    service: &TestService,
    secret: &SecretKey,
    credential: Option<Credential>,
) -> Result<LoginResponse, Code> {
    let mut framed = connect(service).await;
    let server_key = fetch_server_key(&mut framed).await;

    let request = LoginRequest {
        credential,
        meta: PeerSystemMeta { hostname: "it-host".into(), ..Default::default() },
        ssh_pub_key: None,
    };
    let envelope = EncryptedMessage::seal(&request, &server_key, secret).unwrap();
    framed.send(MgmtRequest::Login(envelope)).await.unwrap();

    match framed.next().await.unwrap().unwrap() {
        MgmtResponse::LoginResult(sealed) => Ok(sealed.open(&server_key, secret).unwrap()),
        MgmtResponse::Failure(failure) => Err(failure.code),
        other => panic!("expected login result, got {other:?}"),
    }
}

/// Open a sync stream and read the initial full map.
async fn open_sync(
    service: &TestService,
    secret: &SecretKey,
) -> (ClientFramed, PublicKey, SyncResponse) {
    let mut framed = connect(service).await;
    let server_key = fetch_server_key(&mut framed).await;

    let envelope = EncryptedMessage::seal(&SyncRequest {}, &server_key, secret).unwrap();
    framed.send(MgmtRequest::Sync(envelope)).await.unwrap();

    let initial = next_update(&mut framed, &server_key, secret).await;
    (framed, server_key, initial)
}

async fn next_update(
    framed: &mut ClientFramed,
    server_key: &PublicKey,
    secret: &SecretKey,
) -> SyncResponse {
    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), framed.next())
        .await
        .expect("timed out waiting for update")
        .unwrap()
        .unwrap();
    match frame {
        MgmtResponse::Update(sealed) => sealed.open(server_key, secret).unwrap(),
        other => panic!("expected Update, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_logins_with_same_reusable_key() {
    let service = Arc::new(start_service().await);
    let alice = SecretKey::generate();
    let bob = SecretKey::generate();

    // Race two registrations through the same key.
    let (res_a, res_b) = tokio::join!(
        login(&service, &alice, Some(Credential::SetupKey(service.reusable_key.clone()))),
        login(&service, &bob, Some(Credential::SetupKey(service.reusable_key.clone()))),
    );
    let login_a = res_a.unwrap();
    let login_b = res_b.unwrap();
    assert_ne!(login_a.peer.address, login_b.peer.address);

    let account = service
        .manager
        .account_snapshot(&service.account_id)
        .await
        .unwrap();
    assert_eq!(account.peers.len(), 2);
    assert_eq!(account.network.serial(), 2, "one bump per registration");

    // Each peer's first sync map contains the other.
    let (_fa, _ka, map_a) = open_sync(&service, &alice).await;
    let (_fb, _kb, map_b) = open_sync(&service, &bob).await;
    assert_eq!(map_a.network_map.remote_peers.len(), 1);
    assert_eq!(map_a.network_map.remote_peers[0].pub_key, bob.public_key());
    assert_eq!(map_b.network_map.remote_peers[0].pub_key, alice.public_key());

    service.shutdown.cancel();
}

#[tokio::test]
async fn one_off_key_is_spent_by_first_login() {
    let service = start_service().await;
    let first = SecretKey::generate();
    let second = SecretKey::generate();

    login(&service, &first, Some(Credential::SetupKey(service.one_off_key.clone())))
        .await
        .unwrap();

    let err = login(&service, &second, Some(Credential::SetupKey(service.one_off_key.clone())))
        .await
        .unwrap_err();
    assert_eq!(err, Code::FailedPrecondition);

    let account = service
        .manager
        .account_snapshot(&service.account_id)
        .await
        .unwrap();
    assert_eq!(account.peers.len(), 1, "the rejected login must not create a peer");

    service.shutdown.cancel();
}

#[tokio::test]
async fn login_without_credential_is_invalid_argument() {
    let service = start_service().await;
    let stranger = SecretKey::generate();
    let err = login(&service, &stranger, None).await.unwrap_err();
    assert_eq!(err, Code::InvalidArgument);
    service.shutdown.cancel();
}

#[tokio::test]
async fn identity_token_without_provider_is_permission_denied() {
    let service = start_service().await;
    let stranger = SecretKey::generate();
    let err = login(
        &service,
        &stranger,
        Some(Credential::IdentityToken("jwt".into())),
    )
    .await
    .unwrap_err();
    assert_eq!(err, Code::PermissionDenied);
    service.shutdown.cancel();
}

#[tokio::test]
async fn sync_from_unregistered_peer_is_rejected() {
    let service = start_service().await;
    let stranger = SecretKey::generate();

    let mut framed = connect(&service).await;
    let server_key = fetch_server_key(&mut framed).await;
    let envelope = EncryptedMessage::seal(&SyncRequest {}, &server_key, &stranger).unwrap();
    framed.send(MgmtRequest::Sync(envelope)).await.unwrap();

    match framed.next().await.unwrap().unwrap() {
        MgmtResponse::Failure(failure) => assert_eq!(failure.code, Code::PermissionDenied),
        other => panic!("expected Failure, got {other:?}"),
    }
    service.shutdown.cancel();
}

#[tokio::test]
async fn removal_fans_out_to_every_stream() {
    let service = start_service().await;

    // Ten peers, all registered and all holding live streams.
    let mut secrets = Vec::new();
    for _ in 0..10 {
        let secret = SecretKey::generate();
        login(&service, &secret, Some(Credential::SetupKey(service.reusable_key.clone())))
            .await
            .unwrap();
        secrets.push(secret);
    }

    let mut streams = Vec::new();
    for secret in &secrets {
        let (framed, server_key, initial) = open_sync(&service, secret).await;
        assert_eq!(initial.network_map.remote_peers.len(), 9);
        streams.push((framed, server_key, initial.network_map.serial));
    }

    // Remove the last peer.
    let removed = secrets.pop().unwrap();
    let (mut removed_stream, removed_server_key, _) = streams.pop().unwrap();
    service
        .manager
        .delete_peer(&removed.public_key())
        .await
        .unwrap();

    // The removed peer gets the one-shot empty-map notice.
    let notice = next_update(&mut removed_stream, &removed_server_key, &removed).await;
    assert!(notice.remote_peers_is_empty);
    assert!(notice.network_map.remote_peers.is_empty());

    // Every remaining peer gets a smaller map at a higher serial.
    for ((mut framed, server_key, serial_before), secret) in streams.into_iter().zip(&secrets) {
        let update = next_update(&mut framed, &server_key, secret).await;
        assert_eq!(update.network_map.remote_peers.len(), 8);
        assert!(update.network_map.serial > serial_before);
        assert!(!update
            .network_map
            .remote_peers
            .iter()
            .any(|p| p.pub_key == removed.public_key()));
    }

    service.shutdown.cancel();
}

#[tokio::test]
async fn connected_stream_observes_post_mutation_serial() {
    let service = start_service().await;
    let watcher = SecretKey::generate();
    login(&service, &watcher, Some(Credential::SetupKey(service.reusable_key.clone())))
        .await
        .unwrap();

    let (mut framed, server_key, initial) = open_sync(&service, &watcher).await;
    let serial_before = initial.network_map.serial;

    // A registration elsewhere in the account bumps the serial.
    let newcomer = SecretKey::generate();
    login(&service, &newcomer, Some(Credential::SetupKey(service.reusable_key.clone())))
        .await
        .unwrap();

    let update = next_update(&mut framed, &server_key, &watcher).await;
    assert!(update.network_map.serial > serial_before);
    assert_eq!(update.network_map.remote_peers.len(), 1);

    service.shutdown.cancel();
}

#[tokio::test]
async fn second_sync_stream_displaces_the_first() {
    let service = start_service().await;
    let peer = SecretKey::generate();
    login(&service, &peer, Some(Credential::SetupKey(service.reusable_key.clone())))
        .await
        .unwrap();

    let (mut first, _, _) = open_sync(&service, &peer).await;
    let (_second, _, _) = open_sync(&service, &peer).await;

    // The displaced stream ends; the server closes it once its mailbox is
    // replaced.
    let end = tokio::time::timeout(std::time::Duration::from_secs(5), first.next()).await;
    match end {
        Ok(None) => {}
        Ok(Some(_)) => panic!("displaced stream should not receive further frames"),
        Err(_) => panic!("displaced stream did not close"),
    }

    service.shutdown.cancel();
}
