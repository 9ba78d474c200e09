//! Proxy Integration Tests
//!
//! Drives a real `UsbIpProxy` against the scripted USB/IP server from
//! `common::test_utils` over loopback TCP:
//! - Import handshake
//! - Fragmented replies
//! - Unlink races
//! - Disconnect and protocol-error teardown
//! - Synchronous control operations and their timeout
//!
//! Run with: `cargo test -p proxy --test integration_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockConnection, MockUsbIpServer, create_mock_bulk_data,
    create_mock_device_descriptor, with_timeout,
};
use protocol::{
    Direction, IsoPacketDescriptor, SetupPacket, UrbStatus, errno, request, transfer_flags,
};
use proxy::{
    ProxyError, SharedUrb, TransportConfig, Urb, UsbIpProxy, UsbProxyBackend, lock_urb,
};
use std::io;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

fn transport() -> TransportConfig {
    TransportConfig {
        connect_timeout_ms: 2000,
        control_timeout_secs: 5,
        write_timeout_ms: 2000,
        tcp_nodelay: true,
    }
}

/// Bind a mock server, run `script` on its accepted connection in a helper
/// thread and open a proxy to it
fn start<F>(config: &TransportConfig, script: F) -> (UsbIpProxy, JoinHandle<io::Result<()>>)
where
    F: FnOnce(MockConnection) -> io::Result<()> + Send + 'static,
{
    let server = MockUsbIpServer::bind("1-1").unwrap();
    let address = server.address();
    let handle = thread::spawn(move || script(server.accept()?));
    let proxy = UsbIpProxy::open(&address, config).unwrap();
    (proxy, handle)
}

/// Keep the connection open until the proxy goes away
fn idle(mut conn: MockConnection) -> io::Result<()> {
    let _ = conn.read_pdu();
    Ok(())
}

fn reap(proxy: &UsbIpProxy) -> SharedUrb {
    proxy
        .reap(Some(DEFAULT_TEST_TIMEOUT))
        .expect("no request completed in time")
}

fn finish(proxy: UsbIpProxy, server: JoinHandle<io::Result<()>>) {
    proxy.close();
    server.join().unwrap().unwrap();
}

fn get_descriptor(length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request: request::GET_DESCRIPTOR,
        value: 0x0100,
        index: 0,
        length,
    }
}

// ============================================================================
// Import
// ============================================================================

#[test]
fn test_open_reports_exported_device() {
    let (proxy, server) = start(&transport(), idle);

    assert_eq!(proxy.device().busid, "1-1");
    assert_eq!(proxy.device().id_vendor, 0x1234);
    assert_eq!(proxy.device().devid(), 0x0001_0002);
    assert_eq!(proxy.address().busid, "1-1");
    assert!(!proxy.is_detached());

    finish(proxy, server);
}

#[test]
fn test_open_rejected_import() {
    let server = MockUsbIpServer::bind("1-1").unwrap();
    let address = server.address();
    let handle = thread::spawn(move || server.accept_and_reject(1));

    let err = UsbIpProxy::open(&address, &transport()).err().unwrap();
    assert!(matches!(err, ProxyError::ImportRejected { status: 1, .. }));
    handle.join().unwrap().unwrap();
}

#[test]
fn test_open_invalid_address() {
    let err = UsbIpProxy::open("tcp://127.0.0.1:1-1", &transport()).err().unwrap();
    assert!(matches!(err, ProxyError::InvalidAddress { .. }));
}

// ============================================================================
// Transfers
// ============================================================================

#[test]
fn test_bulk_in_reply_split_across_reads() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, payload, iso) = conn.expect_submit()?;
        assert_eq!(cmd.header.direction, Direction::In);
        assert_eq!(cmd.header.ep, 1);
        assert_eq!(cmd.header.devid, conn.devid());
        assert_eq!(cmd.transfer_buffer_length, 16);
        assert_eq!(cmd.transfer_flags & transfer_flags::SHORT_NOT_OK, 0);
        assert!(payload.is_empty() && iso.is_empty());

        // 48-byte header plus 16 bytes of data arrive as 10 + 20 + 34
        let ret = conn.ret_submit(cmd.header.seqnum, 0, 16, 0);
        conn.reply_submit_chunked(&ret, &create_mock_bulk_data(16), &[], &[10, 20, 34])?;
        idle(conn)
    });

    let urb = Urb::bulk_in(1, 16).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);
    assert!(Arc::ptr_eq(&done, &urb));

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::Ok);
    assert_eq!(done.actual_length, 16);
    assert_eq!(done.transferred(), create_mock_bulk_data(16).as_slice());
    drop(done);

    finish(proxy, server);
}

#[test]
fn test_bulk_in_64_bytes_split_across_reads() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        assert_eq!(cmd.transfer_buffer_length, 64);

        // Header in one read, then the 64 data bytes as 10 + 20 + 34
        let ret = conn.ret_submit(cmd.header.seqnum, 0, 64, 0);
        conn.reply_submit_chunked(&ret, &create_mock_bulk_data(64), &[], &[48, 10, 20, 34])?;
        idle(conn)
    });

    let urb = Urb::bulk_in(1, 64).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);
    assert!(Arc::ptr_eq(&done, &urb));

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::Ok);
    assert_eq!(done.actual_length, 64);
    assert_eq!(done.data, create_mock_bulk_data(64));
    drop(done);

    finish(proxy, server);
}

#[test]
fn test_bulk_in_short_read() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        conn.reply_submit(cmd.header.seqnum, 0, &[0xAA; 10], &[])?;
        idle(conn)
    });

    let urb = Urb::bulk_in(2, 64).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::Ok);
    assert_eq!(done.transferred(), &[0xAA; 10]);
    drop(done);

    finish(proxy, server);
}

#[test]
fn test_bulk_out_sends_payload() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, payload, _) = conn.expect_submit()?;
        assert_eq!(cmd.header.direction, Direction::Out);
        assert_eq!(payload, create_mock_bulk_data(100));
        let ret = conn.ret_submit(cmd.header.seqnum, 0, 100, 0);
        conn.reply_submit_chunked(&ret, &[], &[], &[])?;
        idle(conn)
    });

    let urb = Urb::bulk_out(2, create_mock_bulk_data(100)).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::Ok);
    assert_eq!(done.actual_length, 100);
    drop(done);

    finish(proxy, server);
}

#[test]
fn test_control_in_get_descriptor() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        assert_eq!(cmd.header.ep, 0);
        assert_eq!(cmd.header.direction, Direction::In);
        assert_eq!(cmd.setup, get_descriptor(18).to_bytes());
        assert_eq!(cmd.transfer_buffer_length, 18);
        conn.reply_submit(cmd.header.seqnum, 0, &create_mock_device_descriptor(), &[])?;
        idle(conn)
    });

    let urb = Urb::control(get_descriptor(18), 18).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::Ok);
    assert_eq!(done.setup(), Some(get_descriptor(18)));
    assert_eq!(done.transferred(), create_mock_device_descriptor().as_slice());
    drop(done);

    finish(proxy, server);
}

#[test]
fn test_control_stall() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        conn.reply_submit(cmd.header.seqnum, -errno::EPIPE, &[], &[])?;
        idle(conn)
    });

    let urb = Urb::control(get_descriptor(18), 18).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);
    assert_eq!(lock_urb(&done).status, UrbStatus::Stall);
    assert_eq!(lock_urb(&done).actual_length, 0);

    finish(proxy, server);
}

#[test]
fn test_replies_out_of_order() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (first, _, _) = conn.expect_submit()?;
        let (second, _, _) = conn.expect_submit()?;
        conn.reply_submit(second.header.seqnum, 0, &[2; 4], &[])?;
        conn.reply_submit(first.header.seqnum, 0, &[1; 4], &[])?;
        idle(conn)
    });

    let first = Urb::bulk_in(1, 4).into_shared();
    let second = Urb::bulk_in(1, 4).into_shared();
    proxy.queue(&first).unwrap();
    proxy.queue(&second).unwrap();

    assert!(Arc::ptr_eq(&reap(&proxy), &second));
    assert!(Arc::ptr_eq(&reap(&proxy), &first));
    assert_eq!(lock_urb(&first).transferred(), &[1; 4]);
    assert_eq!(lock_urb(&second).transferred(), &[2; 4]);

    finish(proxy, server);
}

#[test]
fn test_isochronous_in_packets() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, iso) = conn.expect_submit()?;
        assert_eq!(cmd.number_of_packets, 4);
        assert_ne!(cmd.transfer_flags & transfer_flags::ISO_ASAP, 0);
        assert_eq!(iso.len(), 4);
        assert_eq!(iso[2].offset, 16);

        let actual = [8u32, 4, 8, 0];
        let descs: Vec<IsoPacketDescriptor> = iso
            .iter()
            .zip(actual)
            .map(|(d, actual_length)| IsoPacketDescriptor {
                actual_length,
                ..*d
            })
            .collect();
        // Packed: only the actual bytes of each packet, back to back
        let payload: Vec<u8> = (1..=20).collect();
        let ret = conn.ret_submit(cmd.header.seqnum, 0, 20, 4);
        conn.reply_submit_chunked(&ret, &payload, &descs, &[7, 41, 13, 3])?;
        idle(conn)
    });

    let urb = Urb::isochronous(3, Direction::In, &[8, 8, 8, 8]).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::Ok);
    assert_eq!(&done.data[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(&done.data[8..12], &[9, 10, 11, 12]);
    assert_eq!(&done.data[16..24], &[13, 14, 15, 16, 17, 18, 19, 20]);
    let lengths: Vec<u32> = done.iso_packets.iter().map(|p| p.actual_length).collect();
    assert_eq!(lengths, vec![8, 4, 8, 0]);
    assert!(done.iso_packets.iter().all(|p| p.status == UrbStatus::Ok));
    drop(done);

    finish(proxy, server);
}

#[test]
fn test_isochronous_buffer_shrunk_in_flight() {
    let (submitted_tx, submitted_rx) = mpsc::channel();
    let (shrunk_tx, shrunk_rx) = mpsc::channel::<()>();
    let (proxy, server) = start(&transport(), move |mut conn| {
        let (cmd, _, iso) = conn.expect_submit()?;
        assert_eq!(cmd.transfer_buffer_length, 32);
        submitted_tx.send(()).unwrap();
        shrunk_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();

        // Valid for the 32 bytes submitted, not for what is left of the buffer
        let descs: Vec<IsoPacketDescriptor> = iso
            .iter()
            .zip([0u32, 0, 8, 0])
            .map(|(d, actual_length)| IsoPacketDescriptor {
                actual_length,
                ..*d
            })
            .collect();
        let ret = conn.ret_submit(cmd.header.seqnum, 0, 8, 4);
        conn.reply_submit_chunked(&ret, &[0x5A; 8], &descs, &[])?;

        let (next, _, _) = conn.expect_submit()?;
        conn.reply_submit(next.header.seqnum, 0, &[3; 4], &[])?;
        idle(conn)
    });

    let urb = Urb::isochronous(3, Direction::In, &[8, 8, 8, 8]).into_shared();
    proxy.queue(&urb).unwrap();
    submitted_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    lock_urb(&urb).data.truncate(10);
    shrunk_tx.send(()).unwrap();

    let done = reap(&proxy);
    assert!(Arc::ptr_eq(&done, &urb));
    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::DataOverrun);
    assert_eq!(done.data.len(), 10);
    drop(done);
    assert!(!proxy.is_detached());

    let next = Urb::bulk_in(1, 4).into_shared();
    proxy.queue(&next).unwrap();
    let done = reap(&proxy);
    assert!(Arc::ptr_eq(&done, &next));
    assert_eq!(lock_urb(&done).transferred(), &[3; 4]);

    finish(proxy, server);
}

#[test]
fn test_queue_rejects_malformed_request() {
    let (proxy, server) = start(&transport(), idle);

    let mut urb = Urb::bulk_in(1, 8);
    urb.endpoint = 16;
    let err = proxy.queue(&urb.into_shared()).unwrap_err();
    assert!(matches!(err, ProxyError::InvalidRequest(_)));

    finish(proxy, server);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancel_in_flight_then_late_reply() {
    let (submitted_tx, submitted_rx) = mpsc::channel();
    let (proxy, server) = start(&transport(), move |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        let seqnum = cmd.header.seqnum;
        submitted_tx.send(()).unwrap();

        let unlink = conn.expect_unlink()?;
        assert_eq!(unlink.unlink_seqnum, seqnum);
        assert_ne!(unlink.header.seqnum, seqnum);

        // Unlink acknowledged first, then the device's reply shows up anyway
        conn.reply_unlink(unlink.header.seqnum, -errno::ECONNRESET)?;
        conn.reply_submit(seqnum, 0, &create_mock_bulk_data(16), &[])?;

        // The session must still be usable afterwards
        let (next, _, _) = conn.expect_submit()?;
        assert_ne!(next.header.seqnum, seqnum);
        conn.reply_submit(next.header.seqnum, 0, &[7; 16], &[])?;
        idle(conn)
    });

    let urb = Urb::bulk_in(1, 16).into_shared();
    let handle = proxy.queue(&urb).unwrap();
    submitted_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    proxy.cancel(handle).unwrap();

    let done = reap(&proxy);
    assert!(Arc::ptr_eq(&done, &urb));
    assert_eq!(lock_urb(&done).status, UrbStatus::Cancelled);
    assert_eq!(lock_urb(&done).actual_length, 0);
    assert!(lock_urb(&done).data.iter().all(|&b| b == 0));

    let next = Urb::bulk_in(1, 16).into_shared();
    proxy.queue(&next).unwrap();
    let done = reap(&proxy);
    assert!(Arc::ptr_eq(&done, &next));
    assert_eq!(lock_urb(&done).transferred(), &[7; 16]);

    // The late reply must not have produced a second completion
    assert!(proxy.reap(Some(Duration::from_millis(100))).is_none());
    assert!(!proxy.is_detached());

    finish(proxy, server);
}

#[test]
fn test_reply_beats_unlink() {
    let (submitted_tx, submitted_rx) = mpsc::channel();
    let (proxy, server) = start(&transport(), move |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        let seqnum = cmd.header.seqnum;
        submitted_tx.send(()).unwrap();

        let unlink = conn.expect_unlink()?;
        assert_eq!(unlink.unlink_seqnum, seqnum);
        // The transfer had already finished on the device
        conn.reply_submit(seqnum, 0, &[5; 8], &[])?;
        conn.reply_unlink(unlink.header.seqnum, 0)?;
        idle(conn)
    });

    let urb = Urb::bulk_in(1, 8).into_shared();
    let handle = proxy.queue(&urb).unwrap();
    submitted_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    proxy.cancel(handle).unwrap();

    let done = reap(&proxy);
    assert_eq!(lock_urb(&done).status, UrbStatus::Ok);
    assert_eq!(lock_urb(&done).transferred(), &[5; 8]);
    assert!(proxy.reap(Some(Duration::from_millis(100))).is_none());

    finish(proxy, server);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_disconnect_completes_everything_outstanding() {
    let (proxy, server) = start(&transport(), |mut conn| {
        for _ in 0..3 {
            conn.expect_submit()?;
        }
        conn.disconnect();
        Ok(())
    });

    let urbs: Vec<SharedUrb> = (0..3).map(|_| Urb::bulk_in(1, 32).into_shared()).collect();
    for urb in &urbs {
        proxy.queue(urb).unwrap();
    }

    let mut reaped = Vec::new();
    for _ in 0..3 {
        let done = reap(&proxy);
        assert_eq!(lock_urb(&done).status, UrbStatus::NotResponding);
        reaped.push(done);
    }
    for urb in &urbs {
        assert_eq!(reaped.iter().filter(|d| Arc::ptr_eq(d, urb)).count(), 1);
    }

    assert!(proxy.is_detached());
    let err = proxy.queue(&Urb::bulk_in(1, 32).into_shared()).unwrap_err();
    assert!(matches!(err, ProxyError::Detached));
    assert!(matches!(proxy.set_configuration(1), Err(ProxyError::Detached)));

    finish(proxy, server);
}

#[test]
fn test_bad_iso_descriptor_tears_down_session() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, iso) = conn.expect_submit()?;
        assert_eq!(iso.len(), 4);

        let mut descs = iso.clone();
        // Packet 2 claims 200 bytes at offset 900 of a 1024-byte buffer
        descs[2].offset = 900;
        descs[2].length = 200;
        let ret = conn.ret_submit(cmd.header.seqnum, 0, 0, 4);
        conn.reply_submit_chunked(&ret, &[], &descs, &[])?;
        idle(conn)
    });

    let urb = Urb::isochronous(3, Direction::In, &[256, 256, 256, 256]).into_shared();
    proxy.queue(&urb).unwrap();
    let done = reap(&proxy);

    let done = lock_urb(&done);
    assert_eq!(done.status, UrbStatus::NotResponding);
    assert!(
        done.iso_packets
            .iter()
            .all(|p| p.status == UrbStatus::NotResponding)
    );
    drop(done);
    assert!(proxy.is_detached());

    finish(proxy, server);
}

#[test]
fn test_close_completes_outstanding() {
    let (submitted_tx, submitted_rx) = mpsc::channel();
    let (proxy, server) = start(&transport(), move |mut conn| {
        conn.expect_submit()?;
        submitted_tx.send(()).unwrap();
        idle(conn)
    });

    let urb = Urb::interrupt_in(1, 8, 10).into_shared();
    proxy.queue(&urb).unwrap();
    submitted_rx.recv_timeout(DEFAULT_TEST_TIMEOUT).unwrap();
    proxy.close();

    let done = proxy.reap(Some(Duration::ZERO)).unwrap();
    assert_eq!(lock_urb(&done).status, UrbStatus::NotResponding);
    assert!(matches!(
        proxy.queue(&Urb::bulk_in(1, 8).into_shared()),
        Err(ProxyError::NotOpen)
    ));
    server.join().unwrap().unwrap();
}

// ============================================================================
// Synchronous control operations
// ============================================================================

#[test]
fn test_set_configuration() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        assert_eq!(cmd.header.ep, 0);
        assert_eq!(cmd.header.direction, Direction::Out);
        assert_eq!(cmd.transfer_buffer_length, 0);
        assert_eq!(cmd.setup, [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        conn.reply_submit(cmd.header.seqnum, 0, &[], &[])?;
        idle(conn)
    });

    proxy.set_configuration(1).unwrap();
    // Synchronous requests are never handed out by reap
    assert!(proxy.reap(Some(Duration::from_millis(50))).is_none());

    finish(proxy, server);
}

#[test]
fn test_clear_halt_stall_is_reported() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        assert_eq!(cmd.setup, [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]);
        conn.reply_submit(cmd.header.seqnum, -errno::EPIPE, &[], &[])?;
        idle(conn)
    });

    let err = proxy.clear_halted_endpoint(0x81).unwrap_err();
    assert!(matches!(err, ProxyError::TransferFailed(UrbStatus::Stall)));

    finish(proxy, server);
}

#[test]
fn test_reset_sends_port_reset() {
    let (proxy, server) = start(&transport(), |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        assert_eq!(cmd.setup, [0x23, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);
        conn.reply_submit(cmd.header.seqnum, 0, &[], &[])?;
        idle(conn)
    });

    proxy.reset().unwrap();
    proxy.claim_interface(0).unwrap();
    proxy.release_interface(0).unwrap();

    finish(proxy, server);
}

#[test]
fn test_set_interface_timeout_unlinks() {
    let config = TransportConfig {
        control_timeout_secs: 1,
        ..transport()
    };
    let (proxy, server) = start(&config, |mut conn| {
        let (cmd, _, _) = conn.expect_submit()?;
        assert_eq!(cmd.setup, [0x01, 0x0b, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00]);

        // Never answer the submit; the proxy gives up and unlinks it
        let unlink = conn.expect_unlink()?;
        assert_eq!(unlink.unlink_seqnum, cmd.header.seqnum);
        conn.reply_unlink(unlink.header.seqnum, -errno::ECONNRESET)?;
        idle(conn)
    });

    let started = Instant::now();
    let err = proxy.set_interface(1, 2).unwrap_err();
    assert!(matches!(err, ProxyError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_secs(1));

    // The abandoned request is not reapable once its unlink completes
    assert!(proxy.reap(Some(Duration::from_millis(200))).is_none());
    assert!(!proxy.is_detached());

    finish(proxy, server);
}

// ============================================================================
// Reap
// ============================================================================

#[test]
fn test_wakeup_interrupts_reap() {
    let (proxy, server) = start(&transport(), idle);
    let proxy = Arc::new(proxy);

    let reaper = Arc::clone(&proxy);
    let waiter = thread::spawn(move || reaper.reap(Some(Duration::from_secs(30))).is_none());
    thread::sleep(Duration::from_millis(100));
    proxy.wakeup();
    let woke_empty = with_timeout(DEFAULT_TEST_TIMEOUT, move || waiter.join().unwrap()).unwrap();
    assert!(woke_empty);

    // The wakeup is consumed; the next reap times out normally
    assert!(proxy.reap(Some(Duration::from_millis(50))).is_none());

    let proxy = Arc::try_unwrap(proxy).ok().unwrap();
    finish(proxy, server);
}

#[test]
fn test_reap_zero_timeout_does_not_block() {
    let (proxy, server) = start(&transport(), idle);

    let started = Instant::now();
    assert!(proxy.reap(Some(Duration::ZERO)).is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    finish(proxy, server);
}
