use std::sync::mpsc::channel;
use std::sync::Mutex;

use evio::net::{Addr, UdpOptions, UdpSocket};
use evio::{EventLoop, Shutdown};

mod util;

#[test]
fn datagram_round_trip() {
    util::init();

    let event_loop = EventLoop::new().unwrap();
    event_loop.start().unwrap();

    let server = UdpSocket::server_with_events(
        UdpOptions::new()
            .addr("127.0.0.1:0".parse().unwrap())
            .event_loop(&event_loop),
        |socket| {
            let mut buf = [0u8; 512];
            while let Ok((n, info)) = socket.read(&mut buf) {
                assert_eq!(info.family, libc::AF_INET);
                assert_eq!(info.socktype, libc::SOCK_DGRAM);
                assert_eq!(info.protocol, libc::IPPROTO_UDP);
                if &buf[..n] == b"ping" {
                    socket.send_to(b"pong", &info.addr).unwrap();
                }
            }
        },
    )
    .unwrap();

    let server_addr = match server.local_addr().unwrap() {
        Addr::Inet(addr) => addr,
        other => panic!("unexpected family: {:?}", other),
    };

    let (tx, rx) = channel();
    let tx = Mutex::new(tx);
    let client = UdpSocket::client_with_events(
        UdpOptions::new().addr(server_addr).event_loop(&event_loop),
        move |socket| {
            let mut buf = [0u8; 512];
            while let Ok((n, _info)) = socket.read(&mut buf) {
                if &buf[..n] == b"pong" {
                    let _ = tx.lock().unwrap().send(());
                }
            }
        },
    )
    .unwrap();

    client.send(b"ping").unwrap();
    util::expect_signal(&rx);

    client.free();
    server.free();
    event_loop.shutdown(Shutdown::Sync);
}

#[test]
fn plain_client_without_events() {
    util::init();

    let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let client = UdpSocket::client(UdpOptions::new().addr(addr)).unwrap();
    client.send(b"datagram").unwrap();

    let mut buf = [0u8; 64];
    server
        .set_read_timeout(Some(std::time::Duration::from_secs(5)))
        .unwrap();
    let (n, _) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"datagram");
    assert!(!client.is_udp_lite());

    client.free();
}

#[test]
fn read_on_empty_socket_would_block() {
    util::init();

    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let client =
        UdpSocket::client(UdpOptions::new().addr(probe.local_addr().unwrap())).unwrap();

    let mut buf = [0u8; 16];
    let err = client.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    client.free();
}

#[test]
fn empty_list_fails_without_descriptor() {
    util::init();

    let res = UdpSocket::client(UdpOptions::new().addrs(Vec::new()));
    assert!(res.is_err());
}
