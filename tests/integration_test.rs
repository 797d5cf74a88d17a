use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use iec104_slave::{AsduHandler, ConnectionEventHandler, NullAsduHandler, Server, ServerConfig, ThreadedScheduler};

fn start_server(port: u16) -> (Arc<Server>, ThreadedScheduler) {
    let config = ServerConfig {
        port,
        ..Default::default()
    };
    let server = Server::new(
        config,
        Vec::new(),
        Arc::new(NullAsduHandler),
        Arc::new(iec104_slave::NullConnectionEventHandler),
    )
    .unwrap();
    let scheduler = ThreadedScheduler::start(server.clone()).unwrap();
    thread::sleep(Duration::from_millis(100));
    (server, scheduler)
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let len = header[1] as usize;
    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest).unwrap();
    let mut frame = header.to_vec();
    frame.extend_from_slice(&rest);
    frame
}

#[test]
fn handshake_activates_the_connection() {
    let (_server, _scheduler) = start_server(12404);

    let mut stream = TcpStream::connect("127.0.0.1:12404").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    stream.write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]).unwrap(); // STARTDT_ACT
    let response = read_frame(&mut stream);
    assert_eq!(response, vec![0x68, 0x04, 0x0B, 0x00, 0x00, 0x00]); // STARTDT_CON

    stream.write_all(&[0x68, 0x04, 0x43, 0x00, 0x00, 0x00]).unwrap(); // TESTFR_ACT
    let response = read_frame(&mut stream);
    assert_eq!(response, vec![0x68, 0x04, 0x83, 0x00, 0x00, 0x00]); // TESTFR_CON
}

#[test]
fn enqueued_asdu_is_delivered_and_confirmed() {
    let (server, _scheduler) = start_server(12405);

    let mut stream = TcpStream::connect("127.0.0.1:12405").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    stream.write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]).unwrap();
    let _ = read_frame(&mut stream); // STARTDT_CON

    let asdu = [100u8, 0x01, 0x03, 0x00, 0x01, 0x00, 9u8]; // spontaneous measurement
    server.enqueue_asdu(&asdu).unwrap();

    let frame = read_frame(&mut stream);
    // I-frame: 0x68 len send_lo send_hi recv_lo recv_hi <asdu>
    assert_eq!(frame[0], 0x68);
    assert_eq!(frame[2] & 0x01, 0); // I-frame marker
    assert_eq!(&frame[6..], &asdu);

    // Acknowledge receive-seq=1
    stream.write_all(&[0x68, 0x04, 0x01, 0x00, 0x02, 0x00]).unwrap();
    thread::sleep(Duration::from_millis(100));
}

#[test]
fn rejects_connection_when_handler_declines() {
    struct Reject;
    impl AsduHandler for Reject {}
    impl ConnectionEventHandler for Reject {
        fn connection_request(&self, _peer: std::net::IpAddr) -> bool {
            false
        }
    }

    let config = ServerConfig {
        port: 12406,
        ..Default::default()
    };
    let server = Server::new(config, Vec::new(), Arc::new(Reject), Arc::new(Reject)).unwrap();
    let _scheduler = ThreadedScheduler::start(server.clone()).unwrap();
    thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect("127.0.0.1:12406").unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    stream.write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]).unwrap();

    let mut buf = [0u8; 6];
    let result = stream.read(&mut buf);
    // Either the peer closes the socket, or the read simply times out; either
    // way no STARTDT_CON is produced because admission was declined.
    match result {
        Ok(0) => {}
        Ok(_) => panic!("expected no response for a rejected connection"),
        Err(e) => assert!(e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut),
    }
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn rejects_connection_once_slot_pool_is_full() {
    let config = ServerConfig {
        port: 12407,
        max_connections: 1,
        ..Default::default()
    };
    let server = Server::new(
        config,
        Vec::new(),
        Arc::new(NullAsduHandler),
        Arc::new(iec104_slave::NullConnectionEventHandler),
    )
    .unwrap();
    let _scheduler = ThreadedScheduler::start(server.clone()).unwrap();

    let _first = TcpStream::connect("127.0.0.1:12407").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.connection_count(), 1);

    let mut second = TcpStream::connect("127.0.0.1:12407").unwrap();
    second.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    second.write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]).unwrap();

    let mut buf = [0u8; 6];
    let result = second.read(&mut buf);
    match result {
        Ok(0) => {}
        Ok(_) => panic!("expected no response once the slot pool is exhausted"),
        Err(e) => assert!(e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut),
    }
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn raw_message_hooks_see_both_directions() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        received: AtomicUsize,
        sent: AtomicUsize,
    }

    impl AsduHandler for Counting {}
    impl ConnectionEventHandler for Counting {
        fn raw_message_received(&self, _conn: &iec104_slave::ConnectionFacade, _bytes: &[u8]) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        fn raw_message_sent(&self, _conn: &iec104_slave::ConnectionFacade, _bytes: &[u8]) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    let config = ServerConfig {
        port: 12408,
        ..Default::default()
    };
    let handler = Arc::new(Counting {
        received: AtomicUsize::new(0),
        sent: AtomicUsize::new(0),
    });
    let server = Server::new(config, Vec::new(), Arc::new(NullAsduHandler), handler.clone()).unwrap();
    let _scheduler = ThreadedScheduler::start(server.clone()).unwrap();

    let mut stream = TcpStream::connect("127.0.0.1:12408").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]).unwrap(); // STARTDT_ACT
    let _ = read_frame(&mut stream); // STARTDT_CON

    assert!(handler.received.load(Ordering::SeqCst) >= 1);
    assert!(handler.sent.load(Ordering::SeqCst) >= 1);
}
