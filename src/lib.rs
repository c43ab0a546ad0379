//! Event-driven non-blocking I/O for Linux.
//!
//! evio multiplexes sockets and wakeup channels on epoll, one dispatcher
//! thread per [`EventLoop`]. Endpoints ([`net::TcpSocket`], [`net::TcpServer`],
//! [`net::UdpSocket`]) attach to a loop and deliver their events through user
//! callbacks on the loop thread. Outgoing TCP payloads are queued as
//! heterogeneous [`Frame`]s (heap buffers, memory mappings, raw file
//! descriptors) in a [`Storage`] send queue and flushed head-first as the
//! socket becomes writable, using `sendfile` for file-backed frames.
//!
//! Alongside the loop the crate carries the worker-side primitives the
//! endpoints are built on, usable on their own:
//!
//! * [`threads::ThreadGroup`] — coordinated spawn of N workers sharing one
//!   entry, with synchronous or asynchronous cancellation of trailing
//!   subsets.
//! * [`threads::ThreadPool`] — FIFO job queue drained by any number of
//!   cooperating workers, one job per semaphore token.
//! * [`time::Timers`] — one-shot timeouts and periodic intervals on a pair
//!   of binary min-heaps, served by a single worker thread, with O(log n)
//!   external cancellation through [`time::TimerHandle`]s.
//!
//! Everything is Linux-only and speaks to the kernel directly through
//! `libc`; there is no runtime, no futures, and no cross-platform shim.
//!
//! # Example
//!
//! Queue two frames and drain them like a socket flush would:
//!
//! ```
//! use evio::{Frame, Storage};
//!
//! let mut queue = Storage::new();
//! queue.add(Frame::heap(b"hello ".to_vec())).unwrap();
//! queue.add(Frame::heap(b"world".to_vec())).unwrap();
//! assert_eq!(queue.bytes(), 11);
//!
//! // A short write consumed part of the head frame.
//! queue.drain(4);
//! assert_eq!(queue.bytes(), 7);
//! queue.finish();
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::new_without_default)]

mod event_loop;
mod interest;
mod ready;
mod storage;
mod sys;
mod token;

pub mod net;
pub mod threads;
pub mod time;

pub use crate::event_loop::{EventHandler, EventLoop, Shutdown};
pub use crate::interest::Interest;
pub use crate::ready::Ready;
pub use crate::storage::{Chunk, Frame, Mapping, Storage};
pub use crate::token::Token;
