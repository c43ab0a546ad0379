use std::io::Write;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use evio::{Chunk, Frame, Storage};
use rand::Rng;

mod util;

fn head_bytes(storage: &Storage) -> Vec<u8> {
    match storage.head().expect("empty storage").chunk() {
        Chunk::Slice(slice) => slice.to_vec(),
        other => panic!("expected in-memory head, got {:?}", other),
    }
}

#[test]
fn size_matches_remaining_bytes() {
    util::init();

    let mut storage = Storage::new();
    storage.add(Frame::heap(vec![1; 100])).unwrap();
    storage
        .add(Frame::shared(Arc::from(&b"0123456789"[..])))
        .unwrap();
    assert_eq!(storage.bytes(), 110);

    storage.drain(40);
    assert_eq!(storage.bytes(), 70);
    storage.drain(60);
    assert_eq!(storage.bytes(), 10);
    assert_eq!(storage.len(), 1);
    storage.drain(10);
    assert!(storage.is_empty());
    assert_eq!(storage.bytes(), 0);
}

#[test]
fn drain_consumes_head_first() {
    util::init();

    let mut storage = Storage::new();
    storage.add(Frame::heap(b"first".to_vec())).unwrap();
    storage.add(Frame::heap(b"second".to_vec())).unwrap();

    storage.drain(3);
    assert_eq!(head_bytes(&storage), b"st");
    storage.drain(2);
    // Head exhausted; the second frame is untouched and now first.
    assert_eq!(head_bytes(&storage), b"second");
    assert_eq!(storage.bytes(), 6);
}

#[test]
fn finish_compacts_partially_drained_head() {
    util::init();

    let mut storage = Storage::new();
    storage.add(Frame::heap(b"XS".to_vec())).unwrap();
    storage.drain(1);
    storage.finish();

    let head = storage.head().unwrap();
    assert_eq!(head.offset(), 0);
    assert_eq!(head.len(), 1);
    assert_eq!(head_bytes(&storage), b"S");

    // A drained head stays put on a second call.
    let before = storage.bytes();
    storage.finish();
    assert_eq!(storage.bytes(), before);
}

#[test]
fn exhausted_add_is_a_noop() {
    util::init();

    let data: Arc<[u8]> = Arc::from(&b"kept"[..]);
    let mut storage = Storage::new();
    storage
        .add(Frame::shared(Arc::clone(&data)).with_offset(4))
        .unwrap();
    assert!(storage.is_empty());
    // The caller's buffer is untouched by the rejected add.
    assert_eq!(&*data, b"kept");

    storage.drain(0);
    assert!(storage.is_empty());
}

#[test]
fn add_then_full_drain_restores_initial_state() {
    util::init();

    let mut storage = Storage::new();
    storage.add(Frame::heap(vec![7; 31])).unwrap();
    storage.drain(31);
    assert!(storage.is_empty());
    assert_eq!(storage.bytes(), 0);
    assert!(storage.head().is_none());
}

#[test]
fn file_frame_is_mapped_and_descriptor_closed() {
    util::init();

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"abc").unwrap();
    let raw_fd = file.as_raw_fd();

    let mut storage = Storage::new();
    storage
        .add(Frame::file_mapped(file, 3).with_offset(1))
        .unwrap();

    // The installed frame is the mapping, original offset preserved.
    assert_eq!(storage.bytes(), 2);
    assert_eq!(head_bytes(&storage), b"bc");

    // The descriptor was consumed by the mapping.
    let res = unsafe { libc::fcntl(raw_fd, libc::F_GETFD) };
    assert_eq!(res, -1);

    storage.drain(2);
    assert!(storage.is_empty());
}

#[test]
fn zero_copy_file_frame_keeps_its_descriptor() {
    util::init();

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"payload").unwrap();

    let mut storage = Storage::new();
    storage.add(Frame::file(file, 7).with_offset(2)).unwrap();
    assert_eq!(storage.bytes(), 5);

    match storage.head().unwrap().chunk() {
        Chunk::File { offset, len, .. } => {
            assert_eq!(offset, 2);
            assert_eq!(len, 5);
        }
        other => panic!("expected file chunk, got {:?}", other),
    }
}

#[test]
fn random_add_drain_keeps_the_invariant() {
    util::init();

    let mut rng = rand::rng();
    let mut storage = Storage::new();
    let mut expected = 0usize;

    for _ in 0..1000 {
        if rng.random_range(0..3) == 0 || storage.is_empty() {
            let len = rng.random_range(1..64);
            let offset = rng.random_range(0..=len);
            storage
                .add(Frame::heap(vec![0; len]).with_offset(offset))
                .unwrap();
            expected += len - offset;
        } else {
            let head_remaining = storage.head().unwrap().remaining();
            let amount = rng.random_range(0..=head_remaining);
            storage.drain(amount);
            expected -= amount;
        }
        assert_eq!(storage.bytes(), expected);
    }
}
