//! Socket link against a loopback proxy

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use se05x_link::{MESSAGE_BLOCK, SocketLink};
use se05x_t1::{
    BlockKind, FrameCodec, Link, LinkError, LinkStatus, OpenHandshake, Seq, Session,
    SupervisoryKind, T1Config,
};

fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; usize::from(u16::from_be_bytes([header[1], header[2]]))];
    stream.read_exact(&mut body).unwrap();
    (header[0], body)
}

fn write_message(stream: &mut TcpStream, kind: u8, body: &[u8]) {
    let mut message = vec![kind];
    message.extend_from_slice(&u16::try_from(body.len()).unwrap().to_be_bytes());
    message.extend_from_slice(body);
    stream.write_all(&message).unwrap();
}

/// Accept one connection and hand it to `proxy`
fn serve<F>(proxy: F) -> (SocketLink, thread::JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        proxy(stream);
    });
    (SocketLink::new(address), handle)
}

#[test]
fn test_message_round_trip() {
    let (mut link, proxy) = serve(|mut stream| {
        let (kind, body) = read_message(&mut stream);
        assert_eq!(kind, MESSAGE_BLOCK);
        assert_eq!(body, hex::decode("5acf00377f").unwrap());
        write_message(&mut stream, MESSAGE_BLOCK, &hex::decode("a58200da4f").unwrap());
    });

    link.open().unwrap();
    assert!(link.is_connected());
    let timeout = Duration::from_secs(2);
    assert_eq!(
        link.write(&hex::decode("5acf00377f").unwrap(), timeout)
            .unwrap(),
        5
    );

    // Partial reads are served from one message
    let mut prologue = [0u8; 3];
    assert_eq!(link.read(&mut prologue, timeout).unwrap(), 3);
    assert_eq!(prologue, [0xA5, 0x82, 0x00]);
    let mut epilogue = [0u8; 4];
    assert_eq!(link.read(&mut epilogue, timeout).unwrap(), 2);
    assert_eq!(&epilogue[..2], &[0xDA, 0x4F]);

    link.close();
    assert!(!link.is_connected());
    proxy.join().unwrap();
}

#[test]
fn test_silent_proxy_times_out() {
    let (mut link, proxy) = serve(|mut stream| {
        // Hold the connection until the host hangs up
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    link.open().unwrap();
    assert_eq!(
        link.read(&mut [0u8; 3], Duration::from_millis(20)),
        Err(LinkError::Timeout)
    );
    link.close();
    proxy.join().unwrap();
}

#[test]
fn test_unknown_message_type() {
    let (mut link, proxy) = serve(|mut stream| {
        write_message(&mut stream, 0x7F, &[0x00]);
    });

    link.open().unwrap();
    assert!(matches!(
        link.read(&mut [0u8; 3], Duration::from_secs(2)),
        Err(LinkError::Bus(_))
    ));
    link.close();
    proxy.join().unwrap();
}

#[test]
fn test_message_cut_short_drops_connection() {
    let (mut link, proxy) = serve(|mut stream| {
        // Header announcing five bytes, only two of which are sent
        stream.write_all(&[MESSAGE_BLOCK, 0x00, 0x05, 0xA5, 0x82]).unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    link.open().unwrap();
    assert!(matches!(
        link.read(&mut [0u8; 3], Duration::from_millis(50)),
        Err(LinkError::Bus(_))
    ));
    assert!(!link.is_connected());
    assert_eq!(
        link.read(&mut [0u8; 3], Duration::from_millis(50)),
        Err(LinkError::Closed)
    );
    proxy.join().unwrap();
}

#[test]
fn test_closed_link() {
    let mut link = SocketLink::resolve("127.0.0.1:9").unwrap();
    assert_eq!(
        link.write(&[0x00], Duration::from_millis(10)),
        Err(LinkError::Closed)
    );
}

#[test]
fn test_session_over_socket() {
    let config = T1Config::new()
        .with_block_timeout(Duration::from_secs(2))
        .with_handshake(OpenHandshake::Resync);
    let codec = FrameCodec::from_config(&config).peer_view();

    let (link, proxy) = serve(move |mut stream| {
        let (_, raw) = read_message(&mut stream);
        let block = codec.decode(&raw).unwrap();
        assert_eq!(block.kind, BlockKind::request(SupervisoryKind::Resync));
        let reply = codec
            .encode_to_vec(&codec.supervisory(SupervisoryKind::Resync, true, &[]))
            .unwrap();
        write_message(&mut stream, MESSAGE_BLOCK, &reply);

        let (_, raw) = read_message(&mut stream);
        let block = codec.decode(&raw).unwrap();
        assert_eq!(
            block.kind,
            BlockKind::Information {
                seq: Seq::ZERO,
                more: false
            }
        );
        assert_eq!(block.payload, &[0x00, 0xA4, 0x04, 0x00]);
        let reply = codec
            .encode_to_vec(&codec.block(
                BlockKind::Information {
                    seq: Seq::ZERO,
                    more: false,
                },
                &[0x90, 0x00],
            ))
            .unwrap();
        write_message(&mut stream, MESSAGE_BLOCK, &reply);
    });

    let mut session = Session::connect(link, config).unwrap();
    assert_eq!(session.status(), LinkStatus::Open);
    let response = session.transceive(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
    assert_eq!(response, &[0x90, 0x00]);

    session.close();
    assert_eq!(session.status(), LinkStatus::Closed);
    assert!(!session.link().is_connected());
    proxy.join().unwrap();
}
