use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::slice;
use std::sync::Arc;

/// A read-only private memory mapping of a file.
///
/// Created by [`Storage::add`] for [`Frame::file_mapped`] frames, or
/// directly by a caller that wants to hand an already-mapped region to a
/// frame. The region is unmapped when the value is dropped.
pub struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

// SAFETY: the mapping is immutable for its whole lifetime.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map the first `len` bytes of `file` privately for reading, with
    /// sequential-access advice.
    pub fn map(file: &File, len: usize) -> io::Result<Mapping> {
        if len == 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        // SAFETY: the kernel validates the descriptor and the length.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_POPULATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `ptr` is a live mapping of `len` bytes.
        unsafe {
            libc::madvise(ptr, len, libc::MADV_SEQUENTIAL);
        }
        Ok(Mapping { ptr, len })
    }

    /// Length of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region is empty (never the case for a mapping
    /// created by [`Mapping::map`]).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes until dropped.
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping we own.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

#[derive(Debug)]
enum Kind {
    /// Owned bytes; the only kind `finish` compacts.
    Heap(Vec<u8>),
    /// Read-only bytes shared with the caller.
    Shared(Arc<[u8]>),
    /// A mapped region, released by unmapping.
    Mapped(Mapping),
    /// An owned descriptor flushed with `sendfile`, released by closing.
    File { file: File, len: usize },
    /// An owned descriptor that `Storage::add` maps into memory.
    MapFile { file: File, len: usize },
}

/// One pending payload in a [`Storage`] queue.
///
/// A frame is a tagged payload plus an `offset` counting the bytes already
/// consumed from it; `offset == len` means the frame is exhausted. Dropping
/// a frame releases whatever it owns (heap allocation, mapping or
/// descriptor); shared frames only drop their reference.
#[derive(Debug)]
pub struct Frame {
    kind: Kind,
    offset: usize,
}

/// The remaining payload of a [`Frame`], for scatter/gather senders.
#[derive(Debug)]
pub enum Chunk<'a> {
    /// In-memory bytes, ready to write out.
    Slice(&'a [u8]),
    /// A file descriptor region, eligible for `sendfile`.
    File {
        /// The underlying descriptor.
        fd: RawFd,
        /// File offset of the first unconsumed byte.
        offset: usize,
        /// Remaining bytes.
        len: usize,
    },
}

impl Frame {
    /// An owned heap frame.
    pub fn heap(data: Vec<u8>) -> Frame {
        Frame {
            kind: Kind::Heap(data),
            offset: 0,
        }
    }

    /// A read-only frame sharing `data` with the caller.
    ///
    /// The queue never copies or mutates the bytes; it drops its reference
    /// when the frame drains.
    pub fn shared(data: Arc<[u8]>) -> Frame {
        Frame {
            kind: Kind::Shared(data),
            offset: 0,
        }
    }

    /// A frame over an existing memory mapping.
    pub fn mapped(mapping: Mapping) -> Frame {
        Frame {
            kind: Kind::Mapped(mapping),
            offset: 0,
        }
    }

    /// A file-descriptor frame sent zero-copy with `sendfile`.
    ///
    /// The queue owns the descriptor and closes it when the frame drains.
    /// `len` is the number of bytes of the file to transfer.
    pub fn file(file: File, len: usize) -> Frame {
        Frame {
            kind: Kind::File { file, len },
            offset: 0,
        }
    }

    /// A file-descriptor frame that [`Storage::add`] maps into memory.
    ///
    /// The whole first `len` bytes are mapped privately with
    /// sequential-access advice and the descriptor is closed; the queue
    /// then drains the mapping like any in-memory frame.
    pub fn file_mapped(file: File, len: usize) -> Frame {
        Frame {
            kind: Kind::MapFile { file, len },
            offset: 0,
        }
    }

    /// Mark the first `offset` bytes of the payload as already consumed.
    pub fn with_offset(mut self, offset: usize) -> Frame {
        debug_assert!(offset <= self.len());
        self.offset = offset;
        self
    }

    /// Total payload length, consumed bytes included.
    pub fn len(&self) -> usize {
        match &self.kind {
            Kind::Heap(data) => data.len(),
            Kind::Shared(data) => data.len(),
            Kind::Mapped(mapping) => mapping.len(),
            Kind::File { len, .. } | Kind::MapFile { len, .. } => *len,
        }
    }

    /// Returns `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes already consumed from the front of the payload.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.len() - self.offset
    }

    /// The unconsumed payload.
    pub fn chunk(&self) -> Chunk<'_> {
        match &self.kind {
            Kind::Heap(data) => Chunk::Slice(&data[self.offset..]),
            Kind::Shared(data) => Chunk::Slice(&data[self.offset..]),
            Kind::Mapped(mapping) => Chunk::Slice(&mapping.as_slice()[self.offset..]),
            Kind::File { file, len } | Kind::MapFile { file, len } => Chunk::File {
                fd: file.as_raw_fd(),
                offset: self.offset,
                len: *len - self.offset,
            },
        }
    }
}

/// An ordered queue of pending-send [`Frame`]s with a running byte count.
///
/// Frames drain head-first: [`Storage::drain`] advances the head frame's
/// offset and releases it once exhausted. The byte count always equals the
/// sum of the frames' remaining bytes.
#[derive(Debug)]
pub struct Storage {
    frames: VecDeque<Frame>,
    bytes: usize,
}

impl Storage {
    /// An empty queue. Does not allocate.
    pub fn new() -> Storage {
        Storage {
            frames: VecDeque::new(),
            bytes: 0,
        }
    }

    /// Append a frame to the queue.
    ///
    /// An exhausted frame (`offset == len`) is dropped without touching the
    /// queue. [`Frame::file`] descriptors are kept for `sendfile`;
    /// [`Frame::file_mapped`] descriptors are mapped here, and a mapping
    /// failure is returned with the input frame released. Heap frames are
    /// normalized so their consumed prefix is dropped up front.
    pub fn add(&mut self, frame: Frame) -> io::Result<()> {
        if frame.offset == frame.len() {
            return Ok(());
        }
        let frame = match frame.kind {
            Kind::MapFile { file, len } => {
                let mapping = Mapping::map(&file, len)?;
                Frame {
                    kind: Kind::Mapped(mapping),
                    offset: frame.offset,
                }
            }
            Kind::Heap(mut data) => {
                if frame.offset > 0 {
                    data.drain(..frame.offset);
                }
                Frame {
                    kind: Kind::Heap(data),
                    offset: 0,
                }
            }
            kind => Frame {
                kind,
                offset: frame.offset,
            },
        };
        self.bytes += frame.remaining();
        self.frames.push_back(frame);
        Ok(())
    }

    /// Consume `amount` bytes from the head frame.
    ///
    /// `amount` must not exceed the head frame's remaining bytes; on an
    /// empty queue it must be zero. An exhausted head frame is released and
    /// removed, and the backing ring shrinks once it is under a quarter
    /// full.
    pub fn drain(&mut self, amount: usize) {
        let Some(head) = self.frames.front_mut() else {
            debug_assert_eq!(amount, 0);
            return;
        };
        debug_assert!(amount <= head.remaining());

        head.offset += amount;
        self.bytes -= amount;

        if head.offset == head.len() {
            self.frames.pop_front();

            if self.frames.len() < self.frames.capacity() / 4 {
                self.frames.shrink_to(self.frames.len() * 2);
            }
        }
    }

    /// Compact a partially drained head frame.
    ///
    /// Only owned heap frames are touched: the consumed prefix is dropped,
    /// the offset reset to zero and the allocation trimmed. Idempotent; the
    /// byte count is unchanged.
    pub fn finish(&mut self) {
        let Some(head) = self.frames.front_mut() else {
            return;
        };
        if head.offset == 0 {
            return;
        }
        if let Kind::Heap(data) = &mut head.kind {
            data.drain(..head.offset);
            data.shrink_to_fit();
            head.offset = 0;
        }
    }

    /// The frame at the head of the queue, if any.
    pub fn head(&self) -> Option<&Frame> {
        self.frames.front()
    }

    /// Sum of the remaining bytes over all frames.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of frames in the queue.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` when no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Release every queued frame and the backing ring.
    pub fn clear(&mut self) {
        self.frames = VecDeque::new();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunk, Frame, Storage};
    use std::sync::Arc;

    #[test]
    fn byte_count_tracks_remaining() {
        let mut storage = Storage::new();
        storage.add(Frame::heap(vec![0; 10])).unwrap();
        storage
            .add(Frame::shared(Arc::from(&b"abcdef"[..])))
            .unwrap();
        assert_eq!(storage.bytes(), 16);

        storage.drain(3);
        assert_eq!(storage.bytes(), 13);
        storage.drain(7);
        // Head exhausted and removed.
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.bytes(), 6);
    }

    #[test]
    fn add_normalizes_heap_offsets() {
        let mut storage = Storage::new();
        storage
            .add(Frame::heap(b"xyz".to_vec()).with_offset(1))
            .unwrap();
        let head = storage.head().unwrap();
        assert_eq!(head.offset(), 0);
        match head.chunk() {
            Chunk::Slice(slice) => assert_eq!(slice, b"yz"),
            other => panic!("wrong chunk: {:?}", other),
        }
    }

    #[test]
    fn exhausted_frame_is_ignored() {
        let mut storage = Storage::new();
        storage
            .add(Frame::heap(b"ab".to_vec()).with_offset(2))
            .unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.bytes(), 0);
    }

    #[test]
    fn drain_zero_on_empty_is_noop() {
        let mut storage = Storage::new();
        storage.drain(0);
        assert!(storage.is_empty());
    }

    #[test]
    fn finish_compacts_head_once() {
        let mut storage = Storage::new();
        storage.add(Frame::heap(b"XS".to_vec())).unwrap();
        storage.drain(1);
        storage.finish();

        let head = storage.head().unwrap();
        assert_eq!(head.offset(), 0);
        assert_eq!(head.len(), 1);
        match head.chunk() {
            Chunk::Slice(slice) => assert_eq!(slice, b"S"),
            other => panic!("wrong chunk: {:?}", other),
        }
        assert_eq!(storage.bytes(), 1);

        // Second call has nothing left to move.
        storage.finish();
        assert_eq!(storage.bytes(), 1);
        assert_eq!(storage.head().unwrap().len(), 1);
    }

    #[test]
    fn finish_leaves_shared_frames_alone() {
        let data: Arc<[u8]> = Arc::from(&b"shared"[..]);
        let mut storage = Storage::new();
        storage.add(Frame::shared(Arc::clone(&data))).unwrap();
        storage.drain(2);
        storage.finish();

        let head = storage.head().unwrap();
        assert_eq!(head.offset(), 2);
        assert_eq!(head.len(), 6);
    }
}
