//! Block reads that survive a worker dying mid-transfer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tiercache::client::{BlockLocation, BlockReadError, FaultTolerantBlockReader, ReadOptions};
use tiercache::transfer::DataServer;
use tiercache::worker::{BlockStore, WorkerNetAddress};

const MB: usize = 1024 * 1024;
const BLOCK_ID: u64 = 0x5eed;

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

struct TestWorker {
    server: DataServer,
    address: WorkerNetAddress,
}

impl TestWorker {
    async fn with_block(data: Option<Bytes>) -> Self {
        let store = Arc::new(BlockStore::new());
        if let Some(data) = data {
            store.put_block(BLOCK_ID, data);
        }
        let server = DataServer::bind("127.0.0.1:0".parse().unwrap(), store, 64 * 1024, None)
            .await
            .unwrap();
        let address = WorkerNetAddress::new("127.0.0.1", 0, server.port(), 0);
        Self { server, address }
    }

    fn location(&self, length: usize) -> BlockLocation {
        BlockLocation {
            block_id: BLOCK_ID,
            worker: self.address.clone(),
            length: length as u64,
        }
    }

    async fn kill(&self) {
        self.server.close();
        for _ in 0..200 {
            if self.server.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("data server did not close");
    }
}

fn options() -> ReadOptions {
    ReadOptions {
        retry_max_duration: Duration::from_secs(10),
        read_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_sequential_read_fails_over_mid_block() {
    let len = 30 * MB;
    let data = pattern(len);
    let a = TestWorker::with_block(Some(data.clone())).await;
    let b = TestWorker::with_block(Some(data.clone())).await;
    let locations = vec![a.location(len), b.location(len)];
    let mut reader = FaultTolerantBlockReader::new(BLOCK_ID, len as u64, locations, options());

    let mut first = vec![0u8; 17 * MB];
    reader.read_exact(&mut first).await.unwrap();
    assert_eq!(&first[..], &data[..17 * MB]);
    assert_eq!(reader.position(), (17 * MB) as u64);

    a.kill().await;

    let mut rest = vec![0u8; 13 * MB];
    reader.read_exact(&mut rest).await.unwrap();
    assert_eq!(&rest[..], &data[17 * MB..]);
    assert_eq!(reader.remaining(), 0);
    assert_eq!(reader.read(&mut [0u8; 16]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dead_first_replica_is_skipped() {
    let len = 2 * MB;
    let data = pattern(len);
    let a = TestWorker::with_block(Some(data.clone())).await;
    let b = TestWorker::with_block(Some(data.clone())).await;
    a.kill().await;

    let locations = vec![a.location(len), b.location(len)];
    let mut reader = FaultTolerantBlockReader::new(BLOCK_ID, len as u64, locations, options());
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.unwrap();

    assert_eq!(&buf[..], &data[..]);
    assert!(reader.failed_workers().contains(&a.address));
    assert!(!reader.failed_workers().contains(&b.address));
}

#[tokio::test]
async fn test_replica_without_the_block_is_skipped() {
    let len = MB;
    let data = pattern(len);
    let empty = TestWorker::with_block(None).await;
    let full = TestWorker::with_block(Some(data.clone())).await;

    let locations = vec![empty.location(len), full.location(len)];
    let mut reader = FaultTolerantBlockReader::new(BLOCK_ID, len as u64, locations, options());
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[..], &data[..]);
    assert!(reader.failed_workers().contains(&empty.address));
}

#[tokio::test]
async fn test_positioned_read_leaves_cursor_alone() {
    let len = 8 * MB;
    let data = pattern(len);
    let a = TestWorker::with_block(Some(data.clone())).await;
    let b = TestWorker::with_block(Some(data.clone())).await;
    let locations = vec![a.location(len), b.location(len)];
    let mut reader = FaultTolerantBlockReader::new(BLOCK_ID, len as u64, locations, options());

    let mut head = vec![0u8; 1024];
    reader.read_exact(&mut head).await.unwrap();

    let mut window = vec![0u8; MB];
    let n = reader.positioned_read((5 * MB) as u64, &mut window).await.unwrap();
    assert_eq!(n, MB);
    assert_eq!(&window[..], &data[5 * MB..6 * MB]);
    assert_eq!(reader.position(), 1024);

    // Past the end only the tail is returned.
    let mut tail = vec![0u8; MB];
    let n = reader.positioned_read((len - 100) as u64, &mut tail).await.unwrap();
    assert_eq!(n, 100);
    assert_eq!(&tail[..100], &data[len - 100..]);

    // With the first replica gone, positioned reads use the second.
    a.kill().await;
    let n = reader.positioned_read(0, &mut window).await.unwrap();
    assert_eq!(n, MB);
    assert_eq!(&window[..], &data[..MB]);

    let mut next = vec![0u8; 1024];
    reader.read_exact(&mut next).await.unwrap();
    assert_eq!(&next[..], &data[1024..2048]);
}

#[tokio::test]
async fn test_lone_replica_failure_reports_bytes_delivered() {
    // Large enough that socket buffers cannot hold the rest of the block.
    let len = 32 * MB;
    let data = pattern(len);
    let a = TestWorker::with_block(Some(data.clone())).await;
    let locations = vec![a.location(len)];
    let mut reader = FaultTolerantBlockReader::new(BLOCK_ID, len as u64, locations, options());

    let mut first = vec![0u8; MB];
    reader.read_exact(&mut first).await.unwrap();
    a.kill().await;

    let mut rest = vec![0u8; len - MB];
    let err = reader.read_exact(&mut rest).await.unwrap_err();
    assert!(matches!(err, BlockReadError::NoReplicas { .. }), "{err}");

    let delivered = err.bytes_delivered() as usize;
    assert!(delivered < len - MB);
    assert_eq!(reader.position() as usize, MB + delivered);
    assert_eq!(&rest[..delivered], &data[MB..MB + delivered]);

    let io_err: std::io::Error = err.into();
    assert_eq!(io_err.kind(), std::io::ErrorKind::NotConnected);
}
