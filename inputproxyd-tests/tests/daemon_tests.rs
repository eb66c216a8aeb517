// SPDX-License-Identifier: MIT

//! End-to-end tests against the real daemon and kernel. These need a
//! privileged environment and are feature-gated so a plain `cargo test`
//! never touches the host's input stack.

#[cfg(feature = "requires-privileges")]
#[test]
fn daemon_answers_handshake_config_and_ping() {
    use inputproxy_proto::{
        read_packet, write_packet, Channel, ControlType, DeviceConfig,
    };
    use inputproxyd_tests::run_daemon::DaemonGuard;
    use inputproxyd_tests::scratch_socket_path;
    use std::os::unix::net::UnixStream;

    let path = scratch_socket_path("daemon");
    let _daemon = DaemonGuard::start(&path);

    let stream = UnixStream::connect(&path).expect("connecting to daemon");

    write_packet(&stream, Channel::Control, ControlType::Handshake as u16, &[], 0).unwrap();
    let (ack, _) = read_packet(&stream).unwrap().expect("handshake reply");
    assert!(ack.is_control(ControlType::Ack));

    // An absent device: the daemon must accept the config, queue it for
    // retry, and keep serving.
    let config = DeviceConfig {
        vendor_id: 0xffff,
        product_id: 0xffff,
        uid: 0x1111_2222,
        target_key: 276,
        exclusive: false,
    };
    write_packet(
        &stream,
        Channel::Control,
        ControlType::ConfigList as u16,
        &DeviceConfig::encode_list(&[config]),
        0,
    )
    .unwrap();
    let (ack, _) = read_packet(&stream).unwrap().expect("config reply");
    assert!(ack.is_control(ControlType::Ack));

    write_packet(&stream, Channel::Control, ControlType::Ping as u16, &[], 0).unwrap();
    let (pong, _) = read_packet(&stream).unwrap().expect("ping reply");
    assert!(pong.is_control(ControlType::Pong));
}

#[cfg(feature = "requires-uinput")]
#[test]
fn fingerprint_resolves_a_synthetic_device() {
    use input_ioctls::{
        ui_dev_create, ui_dev_destroy, ui_set_evbit, ui_set_keybit, BUS_USB, EV_KEY,
        UINPUT_MAX_NAME_SIZE,
    };
    use inputproxyd::device::capabilities::{
        read_ids, resolve, DeviceCapabilities, EvdevHandle, SYS_INPUT_DIR,
    };
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::path::Path;
    use std::time::Duration;

    const VENDOR: u16 = 0x7777;
    const PRODUCT: u16 = 0x8181;
    let keys: [u16; 3] = [30, 42, 276];

    let file = File::options()
        .write(true)
        .open("/dev/uinput")
        .expect("opening /dev/uinput");
    let fd = file.as_raw_fd();
    unsafe {
        ui_set_evbit(fd, EV_KEY as u64).unwrap();
        for key in keys {
            ui_set_keybit(fd, key as u64).unwrap();
        }
    }

    let name = b"ptt fingerprint test";
    assert!(name.len() < UINPUT_MAX_NAME_SIZE);
    let mut setup: libc::uinput_user_dev = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(name.as_ptr(), setup.name.as_mut_ptr().cast::<u8>(), name.len());
    }
    setup.id.bustype = BUS_USB;
    setup.id.vendor = VENDOR;
    setup.id.product = PRODUCT;
    setup.id.version = 1;
    let setup_bytes = unsafe {
        std::slice::from_raw_parts(
            &setup as *const libc::uinput_user_dev as *const u8,
            std::mem::size_of::<libc::uinput_user_dev>(),
        )
    };
    (&file).write_all(setup_bytes).unwrap();
    unsafe { ui_dev_create(fd).unwrap() };

    // Give udev a moment to set up the new node's permissions.
    std::thread::sleep(Duration::from_secs(1));

    // Probe the synthetic device by its (vendor, product) and compute the
    // fingerprint the way a detection run would.
    let mut uid = None;
    for entry in std::fs::read_dir(SYS_INPUT_DIR).unwrap().flatten() {
        let entry_name = entry.file_name();
        let Some(entry_name) = entry_name.to_str() else { continue };
        if !entry_name.starts_with("event") {
            continue;
        }
        if read_ids(entry_name).ok() != Some((VENDOR, PRODUCT)) {
            continue;
        }
        let dev_path = Path::new("/dev/input").join(entry_name);
        let handle = EvdevHandle::open_read_only(&dev_path).unwrap();
        uid = Some(DeviceCapabilities::probe(&handle).unwrap().uid());
        break;
    }
    let uid = uid.expect("synthetic device not found in sysfs");

    let resolved = resolve(VENDOR, PRODUCT, uid).unwrap();
    assert!(resolved.is_some(), "fingerprint failed to resolve");

    unsafe { ui_dev_destroy(fd).unwrap() };
}
