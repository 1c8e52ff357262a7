//! Parallel transfer tests over in-memory and image sources.

mod common;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use common::{pattern, write_fixed, SparseImage, KIB, MIB};
use vhdsync_rs::{
    download, open_image, ImageSource, IndexRange, MemoryBlob, OpenOptions, ProgressRecord,
    RangeSource, TransferError, TransferOptions,
};

#[tokio::test]
async fn test_sparse_download_zero_fills_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("disk.raw");

    let mut data = vec![0u8; 10 * MIB as usize];
    let first = pattern(MIB as usize, 1);
    let second = pattern(MIB as usize, 2);
    data[..MIB as usize].copy_from_slice(&first);
    data[5 * MIB as usize..6 * MIB as usize].copy_from_slice(&second);

    let blob = MemoryBlob::new(data.clone()).with_read_chunk(64 * 1024 + 3);
    assert_eq!(
        blob.ranges().await.unwrap(),
        vec![IndexRange::new(0, MIB), IndexRange::new(5 * MIB, MIB)]
    );

    let options = TransferOptions {
        max_range_size: 256 * KIB,
        ..TransferOptions::default().with_parallelism(4)
    };
    let outcome = download(Arc::new(blob), &out, &options).await.unwrap();

    assert_eq!(outcome.bytes_transferred, 2 * MIB);
    assert_eq!(outcome.ranges_transferred, 8);
    assert_eq!(outcome.total_length, 10 * MIB);

    let written = std::fs::read(&out).unwrap();
    assert_eq!(written.len(), 10 * MIB as usize);
    assert_eq!(written, data);
}

#[tokio::test]
async fn test_download_overwrites_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("disk.raw");
    std::fs::write(&out, vec![0xAAu8; 3 * MIB as usize]).unwrap();

    let data = pattern(64 * KIB as usize, 3);
    download(
        Arc::new(MemoryBlob::new(data.clone())),
        &out,
        &TransferOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn test_parallelism_exceeding_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("disk.raw");
    let data = pattern(4 * KIB as usize, 4);

    let outcome = download(
        Arc::new(MemoryBlob::new(data.clone())),
        &out,
        &TransferOptions::default().with_parallelism(64),
    )
    .await
    .unwrap();

    assert_eq!(outcome.ranges_transferred, 1);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn test_progress_reports_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("disk.raw");
    let data = pattern(2 * MIB as usize, 5);

    let records: Arc<Mutex<Vec<ProgressRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);
    let options = TransferOptions {
        max_range_size: 64 * KIB,
        progress_interval: Duration::from_millis(1),
        ..TransferOptions::default()
            .with_parallelism(2)
            .with_progress(move |r| sink.lock().push(r.clone()))
    };

    download(Arc::new(MemoryBlob::new(data)), &out, &options)
        .await
        .unwrap();

    let records = records.lock();
    let last = records.last().expect("final record");
    assert!(last.finished);
    assert_eq!(last.processed, 2 * MIB);
    assert_eq!(last.total, 2 * MIB);
    assert!((last.percent - 100.0).abs() < 1e-9);
    assert_eq!(records.iter().filter(|r| r.finished).count(), 1);
    assert!(records.windows(2).all(|w| w[0].processed <= w[1].processed));
}

#[tokio::test]
async fn test_cancellation_stops_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("disk.raw");
    let data = pattern(MIB as usize, 6);

    let options = TransferOptions {
        max_range_size: 4 * KIB,
        ..TransferOptions::default().with_parallelism(1)
    };
    // Cancel from the first progress sample.
    let cancel = options.cancel.clone();
    let options = TransferOptions {
        progress_interval: Duration::from_millis(1),
        ..options.with_progress(move |_| cancel.cancel())
    };

    match download(Arc::new(MemoryBlob::new(data)), &out, &options).await {
        Err(TransferError::Cancelled {
            bytes_transferred,
            pending,
            failures,
        }) => {
            assert!(failures.is_empty());
            assert!(!pending.is_empty());
            assert_eq!(
                bytes_transferred + pending.iter().map(|r| r.length).sum::<u64>(),
                MIB
            );
        }
        // A fast machine may drain every range before the first sample.
        Ok(outcome) => assert_eq!(outcome.bytes_transferred, MIB),
        Err(other) => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_export_fixed_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixed.vhd");
    let out = dir.path().join("fixed.raw");
    let data = pattern(256 * KIB as usize, 7);
    write_fixed(&path, &data, 1);

    let image = open_image(&path, &OpenOptions::default()).unwrap();
    let outcome = download(
        Arc::new(ImageSource::new(image)),
        &out,
        &TransferOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.bytes_transferred, 256 * KIB);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[tokio::test]
async fn test_export_differencing_chain() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.vhd");
    let child = dir.path().join("child.vhd");
    let out = dir.path().join("flat.raw");
    let size = 64 * KIB;

    let base_data = pattern(32 * KIB as usize, 1);
    let child_data = pattern(1024, 2);
    let tail = pattern(4 * KIB as usize, 3);
    SparseImage::dynamic(size, 4096, 1)
        .write_at(0, &base_data)
        .write(&base);
    SparseImage::differencing(size, 4096, 2, &base, 1)
        .write_at(2048, &child_data)
        .write_at(60 * KIB, &tail)
        .write(&child);

    let mut expected = vec![0u8; size as usize];
    expected[..base_data.len()].copy_from_slice(&base_data);
    expected[2048..2048 + child_data.len()].copy_from_slice(&child_data);
    expected[60 * KIB as usize..].copy_from_slice(&tail);

    let image = open_image(&child, &OpenOptions::default()).unwrap();
    let source = ImageSource::new(image);
    assert_eq!(source.length(), size);
    assert_eq!(
        source.ranges().await.unwrap(),
        vec![IndexRange::new(0, 32 * KIB), IndexRange::new(60 * KIB, 4 * KIB)]
    );

    let options = TransferOptions {
        max_range_size: 4 * KIB,
        ..TransferOptions::default().with_parallelism(3)
    };
    let outcome = download(Arc::new(source), &out, &options).await.unwrap();
    assert_eq!(outcome.bytes_transferred, 36 * KIB);
    assert_eq!(std::fs::read(&out).unwrap(), expected);
}
