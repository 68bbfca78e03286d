// SPDX-License-Identifier: AGPL-3.0
// End-to-end exchanges between a client and a server on loopback

use lanshare_core::{
    ClientConfig, ConnectionServer, DownloadOutcome, ErrorKind, ItemKind, PeerScanner, ScanConfig,
    ServerHandle, ServerState, SharedStore, TransferClient, Visibility,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Peer {
    dir: TempDir,
    store: Arc<SharedStore>,
    handle: ServerHandle,
}

impl Peer {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SharedStore::open(dir.path().join("share"), "127.0.0.1", true).unwrap());
        let state = Arc::new(ServerState::new(Arc::clone(&store), Duration::from_secs(5)));
        let server = ConnectionServer::bind(state, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let handle = server.spawn().unwrap();
        Self { dir, store, handle }
    }

    fn port(&self) -> u16 {
        self.handle.local_addr().port()
    }

    fn client(&self) -> TransferClient {
        TransferClient::new(ClientConfig {
            port: self.port(),
            list_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(5),
            max_manifest_bytes: 1024 * 1024,
        })
    }

    fn share(&self) -> PathBuf {
        self.dir.path().join("share")
    }

    /// Write a file outside the share so it can be added to it
    fn source_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let src = self.dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let path = src.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

/// Deterministic bytes that gzip cannot shrink much
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed as u8
        })
        .collect()
}

/// Relative path to contents for every file below `root`
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, files);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                files.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }

    let mut files = BTreeMap::new();
    walk(root, root, &mut files);
    files
}

async fn wait_for_file(path: &Path) -> Vec<u8> {
    for _ in 0..100 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn listing_shows_public_items_only() {
    let peer = Peer::start().await;
    peer.store.put_file(&peer.source_file("a.txt", b"alpha")).unwrap();
    peer.store.create_folder("Music").unwrap();
    peer.store.create_folder("Private").unwrap();
    peer.store
        .add_files_to_folder("Music", &[peer.source_file("song.mp3", b"la la")])
        .unwrap();
    assert_eq!(
        peer.store.toggle_visibility("Private").unwrap(),
        Some(Visibility::Private)
    );

    let manifest = peer.client().request_file_list(LOCALHOST).await.unwrap();
    let names: Vec<&str> = manifest.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"a.txt"));
    assert!(names.contains(&"Music"));
    assert!(names.contains(&"Music/song.mp3"));
    assert!(!names.iter().any(|n| n.starts_with("Private")));

    peer.handle.stop().await;
}

#[tokio::test]
async fn file_download_matches_source() {
    let peer = Peer::start().await;
    let contents: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    peer.store.put_file(&peer.source_file("data.bin", &contents)).unwrap();

    let dest = TempDir::new().unwrap();
    let outcome = peer
        .client()
        .download(LOCALHOST, "data.bin", ItemKind::File, dest.path(), &CancellationToken::new())
        .await
        .unwrap();

    let path = outcome.into_result().unwrap();
    assert_eq!(path, dest.path().join("data.bin"));
    assert_eq!(std::fs::read(path).unwrap(), contents);
    peer.handle.stop().await;
}

#[tokio::test]
async fn folder_download_reproduces_tree() {
    let peer = Peer::start().await;
    peer.store.create_folder("Photos").unwrap();
    peer.store
        .add_files_to_folder(
            "Photos",
            &[
                peer.source_file("one.jpg", b"first"),
                peer.source_file("two.jpg", b"second"),
            ],
        )
        .unwrap();

    let dest = TempDir::new().unwrap();
    let outcome = peer
        .client()
        .download(LOCALHOST, "Photos", ItemKind::Folder, dest.path(), &CancellationToken::new())
        .await
        .unwrap();

    let folder = outcome.into_result().unwrap();
    assert_eq!(std::fs::read(folder.join("one.jpg")).unwrap(), b"first");
    assert_eq!(std::fs::read(folder.join("two.jpg")).unwrap(), b"second");
    peer.handle.stop().await;
}

#[tokio::test]
async fn nested_file_download_uses_last_segment() {
    let peer = Peer::start().await;
    peer.store.create_folder("Docs").unwrap();
    peer.store
        .add_files_to_folder("Docs", &[peer.source_file("notes.txt", b"remember")])
        .unwrap();

    let dest = TempDir::new().unwrap();
    let path = peer
        .client()
        .download(LOCALHOST, "Docs/notes.txt", ItemKind::File, dest.path(), &CancellationToken::new())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(path, dest.path().join("notes.txt"));
    assert_eq!(std::fs::read(path).unwrap(), b"remember");
    peer.handle.stop().await;
}

#[tokio::test]
async fn missing_item_is_reported_without_hanging() {
    let peer = Peer::start().await;
    let dest = TempDir::new().unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        peer.client().download(
            LOCALHOST,
            "ghost.txt",
            ItemKind::File,
            dest.path(),
            &CancellationToken::new(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        outcome,
        DownloadOutcome::NotFound {
            name: "ghost.txt".to_string()
        }
    );
    assert!(!dest.path().join("ghost.txt").exists());
    peer.handle.stop().await;
}

#[tokio::test]
async fn private_folder_needs_access_grant() {
    let peer = Peer::start().await;
    peer.store.create_folder("Secret").unwrap();
    peer.store
        .add_files_to_folder("Secret", &[peer.source_file("plan.txt", b"hidden")])
        .unwrap();
    peer.store.toggle_visibility("Secret").unwrap();

    let dest = TempDir::new().unwrap();
    let client = peer.client();
    let cancel = CancellationToken::new();

    let refused = client
        .download(LOCALHOST, "Secret", ItemKind::Folder, dest.path(), &cancel)
        .await
        .unwrap();
    assert!(matches!(refused, DownloadOutcome::NotFound { .. }));

    assert!(peer.store.add_to_access_list("127.0.0.1"));
    let granted = client
        .download(LOCALHOST, "Secret", ItemKind::Folder, dest.path(), &cancel)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(std::fs::read(granted.join("plan.txt")).unwrap(), b"hidden");
    peer.handle.stop().await;
}

#[tokio::test]
async fn listings_stay_consistent_during_mutation() {
    let peer = Peer::start().await;
    peer.store.put_file(&peer.source_file("base.txt", b"base")).unwrap();
    let inside = peer.source_file("inside.txt", b"inside");
    let blobs: Vec<PathBuf> = (0..5)
        .map(|i| peer.source_file(&format!("blob{}.bin", i), &noise(256 * 1024, i + 1)))
        .collect();

    let mut requests = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let client = peer.client();
        requests.spawn(async move {
            let mut manifests = Vec::new();
            for _ in 0..3 {
                manifests.push(client.request_file_list(LOCALHOST).await?);
            }
            Ok::<_, lanshare_core::AppError>(manifests)
        });
    }

    let store = Arc::clone(&peer.store);
    tokio::task::spawn_blocking(move || {
        for (i, blob) in blobs.iter().enumerate() {
            let folder = format!("Folder{}", i);
            store.create_folder(&folder).unwrap();
            store.add_files_to_folder(&folder, &[inside.clone()]).unwrap();
            store.put_file(blob).unwrap();
        }
    })
    .await
    .unwrap();

    let mut checked = 0;
    while let Some(joined) = requests.join_next().await {
        for manifest in joined.unwrap().unwrap() {
            let entries: BTreeMap<&str, &lanshare_core::ManifestEntry> =
                manifest.iter().map(|e| (e.name.as_str(), e)).collect();
            assert!(entries.contains_key("base.txt"));

            for entry in &manifest {
                assert!(!entry.name.contains(".lanshare-partial-"), "{}", entry.name);
                assert!(entry.public);
                if let Some((folder, _)) = entry.name.split_once('/') {
                    let parent = entries.get(folder).expect("file listed without its folder");
                    assert_eq!(parent.kind, ItemKind::Folder);
                } else if entry.name.starts_with("Folder") {
                    assert_eq!(entry.kind, ItemKind::Folder);
                } else {
                    assert_eq!(entry.kind, ItemKind::File);
                }
            }
            checked += 1;
        }
    }
    assert_eq!(checked, 24);

    let settled = peer.client().request_file_list(LOCALHOST).await.unwrap();
    for i in 0..5 {
        assert!(settled.iter().any(|e| e.name == format!("Folder{}/inside.txt", i)));
        assert!(settled.iter().any(|e| e.name == format!("blob{}.bin", i)));
    }
    for i in 0..5u64 {
        let stored = std::fs::read(peer.share().join(format!("blob{}.bin", i))).unwrap();
        assert_eq!(stored, noise(256 * 1024, i + 1));
    }
    peer.handle.stop().await;
}

#[tokio::test]
async fn folder_round_trip_through_second_peer() {
    let first = Peer::start().await;
    first.store.create_folder("Album").unwrap();
    let album = first.share().join("Album");
    std::fs::create_dir_all(album.join("disc1")).unwrap();
    std::fs::create_dir_all(album.join("disc2/extras")).unwrap();
    std::fs::write(album.join("cover.jpg"), noise(40_000, 7)).unwrap();
    std::fs::write(album.join("disc1/track01.flac"), noise(150_000, 8)).unwrap();
    std::fs::write(album.join("disc2/extras/notes.txt"), b"liner notes").unwrap();
    std::fs::write(album.join("disc2/empty.bin"), b"").unwrap();

    let second = Peer::start().await;
    let cancel = CancellationToken::new();
    first
        .client()
        .download(LOCALHOST, "Album", ItemKind::Folder, &second.share(), &cancel)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let listed = second.client().request_file_list(LOCALHOST).await.unwrap();
    assert!(listed.iter().any(|e| e.name == "Album" && e.kind == ItemKind::Folder));

    let dest = TempDir::new().unwrap();
    let copy = second
        .client()
        .download(LOCALHOST, "Album", ItemKind::Folder, dest.path(), &cancel)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let original = snapshot(&album);
    assert_eq!(original.len(), 4);
    assert_eq!(snapshot(&second.share().join("Album")), original);
    assert_eq!(snapshot(&copy), original);

    first.handle.stop().await;
    second.handle.stop().await;
}

#[tokio::test]
async fn listing_answers_while_folder_is_packed() {
    let peer = Peer::start().await;
    peer.store.create_folder("Big").unwrap();
    for i in 0..4u64 {
        let path = peer.share().join("Big").join(format!("part{}.bin", i));
        std::fs::write(path, noise(16 * 1024 * 1024, i + 1)).unwrap();
    }

    let mut download = TcpStream::connect(("127.0.0.1", peer.port())).await.unwrap();
    download.write_all(b"DOWNLOAD:Big\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let manifest = tokio::time::timeout(
        Duration::from_secs(1),
        peer.client().request_file_list(LOCALHOST),
    )
    .await
    .expect("listing waited for the folder archive")
    .unwrap();
    assert!(manifest.iter().any(|e| e.name == "Big/part0.bin"));

    let local = tokio::task::spawn_blocking({
        let store = Arc::clone(&peer.store);
        move || store.list_local_tree()
    });
    let tree = tokio::time::timeout(Duration::from_secs(1), local)
        .await
        .expect("local listing waited for the folder archive")
        .unwrap()
        .unwrap();
    assert_eq!(tree[0].children.len(), 4);

    let mut prefix = [0u8; 8];
    tokio::time::timeout(Duration::from_secs(120), download.read_exact(&mut prefix))
        .await
        .unwrap()
        .unwrap();
    assert!(u64::from_be_bytes(prefix) > 0);
    drop(download);
    peer.handle.stop().await;
}

#[tokio::test]
async fn upload_reaches_peer_share() {
    let peer = Peer::start().await;
    let outside = TempDir::new().unwrap();
    let path = outside.path().join("gift.txt");
    std::fs::write(&path, b"for you").unwrap();

    let sent = peer.client().upload(LOCALHOST, &path).await.unwrap();
    assert_eq!(sent, 7);

    assert_eq!(wait_for_file(&peer.share().join("gift.txt")).await, b"for you");
    peer.handle.stop().await;
}

#[tokio::test]
async fn upload_sent_in_pieces_is_stored() {
    let peer = Peer::start().await;
    let mut stream = TcpStream::connect(("127.0.0.1", peer.port())).await.unwrap();

    stream.write_all(b"UPLOAD:x.txt").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&10u64.to_be_bytes()).await.unwrap();
    stream.write_all(b"0123456789").await.unwrap();
    stream.shutdown().await.unwrap();

    assert_eq!(wait_for_file(&peer.share().join("x.txt")).await, b"0123456789");
    peer.handle.stop().await;
}

#[tokio::test]
async fn probe_answers_connection_ok() {
    let peer = Peer::start().await;
    assert!(peer.client().check_peer(LOCALHOST).await.unwrap());
    peer.handle.stop().await;
}

#[tokio::test]
async fn stopped_peer_is_unreachable() {
    let peer = Peer::start().await;
    let client = peer.client();
    peer.handle.stop().await;

    let err = client.request_file_list(LOCALHOST).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerUnreachable);
}

fn scan_config(port: u16) -> ScanConfig {
    ScanConfig {
        port,
        connect_timeout: Duration::from_millis(300),
        concurrency: 64,
        verify: true,
        resolve_names: false,
    }
}

#[tokio::test]
async fn scan_finds_peer_on_loopback_subnet() {
    let peer = Peer::start().await;
    let scanner = PeerScanner::new(scan_config(peer.port()));

    let report = scanner
        .scan_subnet(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 5)), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.probed, 253);
    assert_eq!(report.peers.len(), 1);
    assert_eq!(report.peers[0].address, LOCALHOST);
    assert_eq!(report.summary(), "Found 1 device");
    peer.handle.stop().await;
}

#[tokio::test]
async fn scan_skips_own_address() {
    let peer = Peer::start().await;
    let scanner = PeerScanner::new(scan_config(peer.port()));

    let report = scanner
        .scan_subnet(LOCALHOST, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_empty());
    assert_eq!(report.summary(), "No devices found");
    peer.handle.stop().await;
}
