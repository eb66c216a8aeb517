// SPDX-License-Identifier: MIT

//! Byte-level protocol conformance: a real client against a scripted
//! server that reads and writes raw frames.

use std::os::unix::net::UnixListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use inputproxy_client::InputProxyClient;
use inputproxyd_tests::raw::{header_bytes, length_of, read_header, read_payload, write_frame};
use inputproxyd_tests::scratch_socket_path;

#[test]
fn handshake_config_and_event_frames_match_the_wire_format() {
    let path = scratch_socket_path("wire");
    let listener = UnixListener::bind(&path).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        // HANDSHAKE is Header{1,1,0,0}, answered by ACK Header{1,3,0,0}.
        assert_eq!(read_header(&mut stream), header_bytes(1, 1, 0, 0));
        write_frame(&mut stream, header_bytes(1, 3, 0, 0), &[]);

        // CONFIG_LIST carries one packed 16-byte DeviceConfig.
        let header = read_header(&mut stream);
        assert_eq!(header, header_bytes(1, 2, 16, 0));
        let payload = read_payload(&mut stream, length_of(&header) as usize);
        assert_eq!(payload[0..2], 0x046d_u16.to_ne_bytes());
        assert_eq!(payload[2..4], 0xc077_u16.to_ne_bytes());
        assert_eq!(payload[4..8], 0xdead_beef_u32.to_ne_bytes());
        assert_eq!(payload[8..12], 276_i32.to_ne_bytes());
        assert_eq!(payload[12], 0, "exclusive flag");
        assert_eq!(payload[13..16], [0, 0, 0], "padding");
        write_frame(&mut stream, header_bytes(1, 3, 0, 0), &[]);

        // KEY_EVENT press: Header{2,1,8,0} + {key, state, pad[3]}.
        let mut event = Vec::new();
        event.extend_from_slice(&276_i32.to_ne_bytes());
        event.push(1);
        event.extend_from_slice(&[0, 0, 0]);
        write_frame(&mut stream, header_bytes(2, 1, 8, 0), &event);

        // Keep the link up until the client has dispatched the event.
        thread::sleep(Duration::from_millis(300));
    });

    let client = InputProxyClient::with_socket_path(&path);
    let (tx, rx) = mpsc::channel();
    client.set_callback(move |key, pressed| {
        let _ = tx.send((key, pressed));
    });
    client.add_device(0x046d, 0xc077, 0xdead_beef, 276, false);
    client.start();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        (276, true)
    );

    client.stop();
    server.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn pings_are_emitted_and_pongs_keep_the_link_alive() {
    let path = scratch_socket_path("ping");
    let listener = UnixListener::bind(&path).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        assert_eq!(read_header(&mut stream), header_bytes(1, 1, 0, 0));
        write_frame(&mut stream, header_bytes(1, 3, 0, 0), &[]);

        // No configs registered, so the next frames are pings. Answering
        // each one must keep the client on this same connection.
        for _ in 0..3 {
            assert_eq!(read_header(&mut stream), header_bytes(1, 5, 0, 0));
            write_frame(&mut stream, header_bytes(1, 6, 0, 0), &[]);
        }
    });

    let client = InputProxyClient::with_socket_path(&path);
    client.set_callback(|_, _| {});
    client.set_ping_interval(Duration::from_millis(100));
    client.start();

    server.join().unwrap();
    client.stop();
    let _ = std::fs::remove_file(&path);
}
