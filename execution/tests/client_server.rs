//! End-to-end client/server tests over an in-process endpoint bound to an
//! OS-assigned localhost port.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use quarry_castore::{Digest, HashFunction, LocalCas};
use quarry_execution::upload::{upload_tree_compatible, upload_tree_native};
use quarry_execution::{
    Blob, DirectoryEntry, DirectoryTree, DummyExecutionApi, RemoteExecutionClient, ServerConfig,
};

async fn start_server(hash: HashFunction) -> (TempDir, u16) {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalCas::open(dir.path().join("storage"), hash).unwrap());
    let info_file = dir.path().join("info.json");

    let config = ServerConfig {
        interface: "127.0.0.1".into(),
        port: 0,
        pid_file: Some(dir.path().join("pid")),
        info_file: Some(info_file.clone()),
        op_exponent: None,
    };
    tokio::spawn(config.run(storage, Arc::new(DummyExecutionApi), None));

    // The info file appears once the socket is bound; it carries the
    // effective port.
    for _ in 0..500 {
        if let Ok(content) = std::fs::read_to_string(&info_file) {
            let info: serde_json::Value = serde_json::from_str(&content).unwrap();
            let port = info["port"].as_u64().expect("port must be set") as u16;
            assert_eq!(info["interface"], "127.0.0.1");
            assert!(info["pid"].as_u64().is_some());
            return (dir, port);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not write its info file");
}

async fn connect(port: u16, hash: HashFunction) -> RemoteExecutionClient {
    RemoteExecutionClient::connect(&format!("127.0.0.1:{}", port), "main", hash)
        .await
        .expect("client must connect")
}

fn two_file_tree() -> DirectoryTree {
    let mut tree = DirectoryTree::new();
    tree.add(
        "a",
        DirectoryEntry::File {
            data: Bytes::from_static(b"hi\n"),
            executable: false,
        },
    );
    tree.add(
        "b",
        DirectoryEntry::File {
            data: Bytes::from_static(b"bye\n"),
            executable: false,
        },
    );
    tree
}

#[tokio::test]
async fn native_tree_upload_round_trip() {
    let (_dir, port) = start_server(HashFunction::Native).await;
    let client = connect(port, HashFunction::Native).await;

    let root_digest = upload_tree_native(&client, &two_file_tree())
        .await
        .expect("upload must succeed");
    assert!(root_digest.is_tree);

    // the root tree and both file blobs are now available
    assert!(client.is_available(&[root_digest.clone()]).await.is_empty());
    let file_digests = vec![
        HashFunction::Native.compute_blob_digest(b"hi\n"),
        HashFunction::Native.compute_blob_digest(b"bye\n"),
    ];
    assert!(client.is_available(&file_digests).await.is_empty());

    // a second upload of the same tree short-circuits on the root probe
    let again = upload_tree_native(&client, &two_file_tree())
        .await
        .expect("re-upload must succeed");
    assert_eq!(again, root_digest);
}

#[tokio::test]
async fn compatible_tree_upload_round_trip() {
    let (_dir, port) = start_server(HashFunction::Compatible).await;
    let client = connect(port, HashFunction::Compatible).await;

    let root_digest = upload_tree_compatible(&client, &two_file_tree())
        .await
        .expect("upload must succeed");
    assert!(client.is_available(&[root_digest.clone()]).await.is_empty());

    // the full closure is queryable as Directory messages
    let directories = client
        .query_full_tree(&root_digest)
        .await
        .expect("closure query must succeed");
    assert_eq!(directories.len(), 1); // flat root, no subdirectories
    assert_eq!(directories[0].files.len(), 2);
}

#[tokio::test]
async fn mixed_size_upload_partitions_by_transfer_size() {
    let (_dir, port) = start_server(HashFunction::Compatible).await;
    let client = connect(port, HashFunction::Compatible).await;

    // one blob above the batch limit, fifty small ones
    let large_data: Bytes = vec![0xa5u8; 10 * 1024 * 1024].into();
    let mut blobs = vec![Blob::new(HashFunction::Compatible, large_data.clone(), false)];
    for i in 0..50u32 {
        let data: Bytes = format!("{:01024}", i).into_bytes().into();
        assert_eq!(data.len(), 1024);
        blobs.push(Blob::new(HashFunction::Compatible, data, false));
    }
    let digests: Vec<Digest> = blobs.iter().map(|blob| blob.digest.clone()).collect();

    assert!(client.upload_blobs(blobs.clone(), false).await);
    assert!(client.is_available(&digests).await.is_empty());

    // idempotence: uploading the same set again succeeds and changes
    // nothing
    assert!(client.upload_blobs(blobs, false).await);
    assert!(client.is_available(&digests).await.is_empty());

    // the large blob streams back in chunks
    let reader = client
        .incremental_read_single_blob(&digests[0])
        .await
        .expect("stream must open");
    let data = reader.collect().await.expect("stream must drain");
    assert_eq!(data, large_data);
}

#[tokio::test]
async fn blob_reader_yields_batches_until_empty() {
    let (_dir, port) = start_server(HashFunction::Compatible).await;
    let client = connect(port, HashFunction::Compatible).await;

    let mut blobs = Vec::new();
    for i in 0..20u32 {
        let data: Bytes = format!("payload-{}", i).into_bytes().into();
        blobs.push(Blob::new(HashFunction::Compatible, data, false));
    }
    assert!(client.upload_blobs(blobs.clone(), false).await);

    let digests: Vec<Digest> = blobs.iter().map(|blob| blob.digest.clone()).collect();
    let mut reader = client.read_blobs(digests);

    let mut read_back = Vec::new();
    loop {
        let batch = reader.next().await;
        if batch.is_empty() {
            break;
        }
        read_back.extend(batch);
    }
    assert_eq!(read_back.len(), blobs.len());
    for blob in &blobs {
        let served = read_back
            .iter()
            .find(|candidate| candidate.digest.hash == blob.digest.hash)
            .expect("every requested blob is served");
        assert_eq!(served.data, blob.data);
    }
}

#[tokio::test]
async fn split_and_splice_round_trip() {
    let (_dir, port) = start_server(HashFunction::Compatible).await;
    let client = connect(port, HashFunction::Compatible).await;

    assert!(client.blob_split_support().await);
    assert!(client.blob_splice_support().await);

    let data: Bytes = (0..5 * 1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
    let blob = Blob::new(HashFunction::Compatible, data.clone(), false);
    let digest = blob.digest.clone();
    assert!(client.upload_blobs(vec![blob], false).await);

    let chunks = client
        .split_blob(&digest)
        .await
        .expect("split must succeed");
    assert!(chunks.len() > 1);
    let total: i64 = chunks.iter().map(|chunk| chunk.size).sum();
    assert_eq!(total, digest.size);

    let spliced = client
        .splice_blob(&digest, &chunks)
        .await
        .expect("splice must succeed");
    assert_eq!(spliced.hash, digest.hash);
}

#[tokio::test]
async fn upstream_action_cache_misses_report_none() {
    let (_dir, port) = start_server(HashFunction::Compatible).await;
    let client = connect(port, HashFunction::Compatible).await;

    let absent = HashFunction::Compatible.compute_blob_digest(b"no such action");
    assert!(client
        .get_cached_action_result(&absent, Vec::new())
        .await
        .is_none());
}

#[tokio::test]
async fn capabilities_report_exactly_one_digest_function() {
    use quarry_reapi::remexec::capabilities_client::CapabilitiesClient;
    use quarry_reapi::remexec::{digest_function, GetCapabilitiesRequest};

    let (_dir, port) = start_server(HashFunction::Native).await;
    let mut client = CapabilitiesClient::connect(format!("http://127.0.0.1:{}", port))
        .await
        .unwrap();
    let capabilities = client
        .get_capabilities(GetCapabilitiesRequest {
            instance_name: "main".into(),
        })
        .await
        .unwrap()
        .into_inner();

    let cache = capabilities.cache_capabilities.unwrap();
    assert_eq!(
        cache.digest_function,
        vec![digest_function::Value::Sha1 as i32]
    );
    assert!(cache.max_batch_total_size_bytes > 0);
    assert!(capabilities.execution_capabilities.unwrap().exec_enabled);
}
