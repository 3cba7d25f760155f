#![cfg(unix)]

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ocicancel::hooks::hook_read;

static LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn blocking_read(stream: &UnixStream) -> isize {
    let mut buf = [0u8; 64];
    unsafe { hook_read(stream.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) }
}

#[test]
fn interrupt_with_nothing_blocked_is_a_noop() {
    let _guard = serial();
    assert_eq!(ocicancel::active_count(), 0);
    assert_eq!(ocicancel::interrupt_all(), 0);
    assert_eq!(ocicancel::interrupt_all(), 0);
}

#[test]
fn interrupt_releases_every_blocked_reader() {
    const READERS: usize = 6;
    let _guard = serial();

    let mut peers = Vec::new();
    let mut readers = Vec::new();
    for _ in 0..READERS {
        let (reader, peer) = UnixStream::pair().expect("socketpair");
        peers.push(peer);
        readers.push(std::thread::spawn(move || blocking_read(&reader)));
    }

    wait_until(|| ocicancel::active_count() == READERS);
    assert_eq!(ocicancel::interrupt_all(), READERS);

    for reader in readers {
        assert_eq!(reader.join().expect("reader"), 0);
    }
    assert_eq!(ocicancel::active_count(), 0);
    assert_eq!(ocicancel::interrupt_all(), 0);
    drop(peers);
}

#[test]
fn readers_finishing_normally_leave_the_registry_in_any_order() {
    const READERS: usize = 4;
    let _guard = serial();

    let mut peers = Vec::new();
    let mut readers = Vec::new();
    for _ in 0..READERS {
        let (reader, peer) = UnixStream::pair().expect("socketpair");
        peers.push(peer);
        readers.push(Some(std::thread::spawn(move || blocking_read(&reader))));
    }
    wait_until(|| ocicancel::active_count() == READERS);

    for (done, i) in [2usize, 0, 3, 1].into_iter().enumerate() {
        peers[i].write_all(b"row").expect("write");
        let reader = readers[i].take().expect("joined once");
        assert_eq!(reader.join().expect("reader"), 3);
        assert_eq!(ocicancel::active_count(), READERS - done - 1);
    }
}

#[test]
fn tracked_guard_takes_part_in_interrupts() {
    let _guard = serial();
    let (reader, _peer) = UnixStream::pair().expect("socketpair");

    let worker = std::thread::spawn(move || {
        let _tracked = ocicancel::track(reader.as_raw_fd());
        let mut buf = [0u8; 16];
        // Plain read, not through a wrapper.
        unsafe { libc::read(reader.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) }
    });

    wait_until(|| ocicancel::active_count() == 1);
    assert_eq!(ocicancel::interrupt_all(), 1);
    assert_eq!(worker.join().expect("worker"), 0);
    assert_eq!(ocicancel::active_count(), 0);
}
