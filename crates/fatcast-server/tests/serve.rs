//! End-to-end NBD exchanges against a scanned temporary tree.
//!
//! The serve loop and a scripted client share an in-memory duplex
//! stream; no real nbd device is involved.

use std::path::Path;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use fatcast_engine::{scan, Geometry, Volume};
use fatcast_server::nbd::{self, Request, CMD_READ, CMD_TRIM, CMD_WRITE, REPLY_MAGIC};

const FILE_CONTENT: &[u8] = b"hello nbd world";

fn build_volume(root: &Path) -> Volume {
    let geometry = Geometry::plan(1_000_000, 512).unwrap();
    let mut volume = Volume::new(geometry, None).unwrap();
    scan::populate(&mut volume, root).unwrap();
    let clusters = volume.geometry().data_clusters;
    volume.finalize(clusters);
    volume
}

/// A tree with one file and one empty subdirectory.
fn small_tree() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("hello.txt"), FILE_CONTENT).unwrap();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();
    tmp
}

async fn reply_error(client: &mut DuplexStream) -> u32 {
    let mut reply = [0u8; 16];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(
        u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]),
        REPLY_MAGIC
    );
    u32::from_be_bytes([reply[4], reply[5], reply[6], reply[7]])
}

/// Issue a READ; returns (error, payload).
async fn read_at(client: &mut DuplexStream, from: u64, len: u32) -> (u32, Vec<u8>) {
    let request = Request {
        kind: CMD_READ,
        handle: *b"read!!!!",
        from,
        len,
    };
    client.write_all(&request.encode()).await.unwrap();
    let error = reply_error(client).await;
    let mut payload = Vec::new();
    if error == 0 {
        payload = vec![0u8; len as usize];
        client.read_exact(&mut payload).await.unwrap();
    }
    (error, payload)
}

/// Issue a WRITE; returns the reply error.
async fn write_at(client: &mut DuplexStream, from: u64, data: &[u8]) -> u32 {
    let request = Request {
        kind: CMD_WRITE,
        handle: *b"write!!!",
        from,
        len: data.len() as u32,
    };
    client.write_all(&request.encode()).await.unwrap();
    client.write_all(data).await.unwrap();
    reply_error(client).await
}

/// Run the serve loop against a scripted client on a duplex stream.
async fn with_server<F, Fut>(mut volume: Volume, script: F)
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (client, mut server) = duplex(1 << 20);
    let serving = async {
        nbd::serve(&mut server, &mut volume).await.unwrap();
    };
    // The script drops its stream end when done, which ends the loop.
    let ((), ()) = tokio::join!(serving, script(client));
}

#[tokio::test]
async fn boot_and_fsinfo_sectors() {
    let tmp = small_tree();
    with_server(build_volume(tmp.path()), |mut client| async move {
        let (error, boot) = read_at(&mut client, 0, 512).await;
        assert_eq!(error, 0);
        assert_eq!(&boot[0..3], &[0xeb, 0xfe, 0x90]);
        assert_eq!(&boot[0x47..0x52], b"FATCAST    ");
        assert_eq!(&boot[0x52..0x5a], b"FAT32   ");

        let (error, fsinfo) = read_at(&mut client, 512, 512).await;
        assert_eq!(error, 0);
        assert_eq!(&fsinfo[0..4], b"RRaA");
        assert_eq!(&fsinfo[0x1fc..0x200], &[0x00, 0x00, 0x55, 0xaa]);
    })
    .await;
}

#[tokio::test]
async fn fat_reflects_the_scan() {
    let tmp = small_tree();
    let volume = build_volume(tmp.path());
    let geometry = *volume.geometry();
    let clusters = geometry.data_clusters;
    with_server(volume, |mut client| async move {
        let (error, fat) = read_at(&mut client, geometry.fat_start(), 512).await;
        assert_eq!(error, 0);
        let entry = |i: usize| {
            u32::from_le_bytes([fat[i * 4], fat[i * 4 + 1], fat[i * 4 + 2], fat[i * 4 + 3]])
        };
        assert_eq!(entry(0), 0x0fff_fff8); // media marker
        assert_eq!(entry(1), 0x0fff_ffff); // end of chain
        assert_eq!(entry(2), 0x0fff_ffff); // root directory
        assert_eq!(entry(3), 0x0fff_ffff); // the subdirectory
        assert_eq!(entry(4), 0);

        // The file's single cluster sits at the very end of the volume.
        let file_cluster = clusters + 1;
        let (error, word) = read_at(
            &mut client,
            geometry.fat_start() + file_cluster as u64 * 4,
            4,
        )
        .await;
        assert_eq!(error, 0);
        assert_eq!(
            u32::from_le_bytes([word[0], word[1], word[2], word[3]]),
            0x0fff_ffff
        );
    })
    .await;
}

#[tokio::test]
async fn directory_and_file_contents() {
    let tmp = small_tree();
    let volume = build_volume(tmp.path());
    let geometry = *volume.geometry();
    let root_pos = geometry.data_start();
    let file_pos = geometry.data_start() + (geometry.data_clusters - 1) as u64 * 4096;
    with_server(volume, |mut client| async move {
        // The root stream opens with a long-filename record.
        let (error, root) = read_at(&mut client, root_pos, 4096).await;
        assert_eq!(error, 0);
        assert_eq!(root[0] & 0x40, 0x40);
        assert_eq!(root[11], 0x0f);

        // File data comes straight from the host file, zero padded to
        // the cluster.
        let (error, data) = read_at(&mut client, file_pos, 4096).await;
        assert_eq!(error, 0);
        assert_eq!(&data[..FILE_CONTENT.len()], FILE_CONTENT);
        assert!(data[FILE_CONTENT.len()..].iter().all(|&b| b == 0));
    })
    .await;
}

#[tokio::test]
async fn data_writes_are_rejected_read_only() {
    let tmp = small_tree();
    let volume = build_volume(tmp.path());
    let geometry = *volume.geometry();
    let root_pos = geometry.data_start();
    with_server(volume, |mut client| async move {
        let error = write_at(&mut client, root_pos, &[0u8; 512]).await;
        assert_eq!(error, libc::EROFS as u32);
        // The boot sector is read-only too.
        let error = write_at(&mut client, 0, &[0u8; 512]).await;
        assert_eq!(error, libc::EROFS as u32);
    })
    .await;
}

#[tokio::test]
async fn fat_writes_are_absorbed() {
    let tmp = small_tree();
    let volume = build_volume(tmp.path());
    let geometry = *volume.geometry();
    with_server(volume, |mut client| async move {
        let (error, mut sector) = read_at(&mut client, geometry.fat_start(), 512).await;
        assert_eq!(error, 0);
        // Mark a free entry as a one-cluster chain.
        sector[40..44].copy_from_slice(&0x0fff_ffffu32.to_le_bytes());

        let error = write_at(&mut client, geometry.fat_start(), &sector).await;
        assert_eq!(error, 0);

        let (error, readback) = read_at(&mut client, geometry.fat_start(), 512).await;
        assert_eq!(error, 0);
        assert_eq!(readback, sector);
    })
    .await;
}

#[tokio::test]
async fn unsupported_commands_get_einval() {
    let tmp = small_tree();
    with_server(build_volume(tmp.path()), |mut client| async move {
        let request = Request {
            kind: CMD_TRIM,
            handle: *b"trim!!!!",
            from: 0,
            len: 512,
        };
        client.write_all(&request.encode()).await.unwrap();
        assert_eq!(reply_error(&mut client).await, libc::EINVAL as u32);
    })
    .await;
}

#[tokio::test]
async fn reads_past_the_end_fail_but_do_not_kill_the_session() {
    let tmp = small_tree();
    let volume = build_volume(tmp.path());
    let total = volume.geometry().total_bytes();
    with_server(volume, |mut client| async move {
        let (error, payload) = read_at(&mut client, total, 512).await;
        assert_eq!(error, libc::EINVAL as u32);
        assert!(payload.is_empty());

        // The session keeps serving after the failed request.
        let (error, _) = read_at(&mut client, 0, 512).await;
        assert_eq!(error, 0);
    })
    .await;
}
