//! Camera controller scenarios against the scripted phone.

#![cfg(feature = "android")]

use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hardware::android::mock::ScriptedTransport;
use hardware::android::{CameraConfig, CameraDeviceController, DeviceError};

fn controller(config: CameraConfig) -> (CameraDeviceController, ScriptedTransport) {
    let phone = ScriptedTransport::new();
    let camera = CameraDeviceController::with_transport(config, Arc::new(phone.clone()));
    (camera, phone)
}

fn connected(config: CameraConfig) -> (CameraDeviceController, ScriptedTransport) {
    let (camera, phone) = controller(config);
    camera.connect_device().unwrap();
    (camera, phone)
}

/// Poll `condition` for up to a second.
fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn no_attached_device() {
    let (camera, phone) = controller(CameraConfig::without_delays());
    phone.set_devices(&[]);

    assert!(matches!(camera.connect_device(), Err(DeviceError::NoDevice)));
    assert!(matches!(camera.capture(), Err(DeviceError::NoDevice)));
    assert_eq!(camera.take_photo(), None);
    assert!(camera.list_photo_ids().is_empty());
    assert_eq!(phone.shutter_presses(), 0);
}

#[test]
fn first_of_several_devices_is_used() {
    let (camera, phone) = controller(CameraConfig::without_delays());
    phone.set_devices(&["R58M123", "emulator-5554"]);

    assert_eq!(camera.connect_device().unwrap(), "R58M123");
    assert_eq!(camera.device_id().as_deref(), Some("R58M123"));
}

#[test]
fn capture_opens_camera_and_stores_photo() {
    let (camera, phone) = connected(CameraConfig::without_delays());
    assert!(!camera.is_camera_open());

    let id = camera.capture().unwrap();

    assert!(phone.camera_open());
    assert!(camera.is_camera_open());
    assert!(camera.is_monitor_running());
    assert_eq!(phone.shutter_presses(), 1);
    assert_eq!(phone.count_commands("am start"), 1);
    assert_eq!(camera.list_photo_ids(), vec![id.clone()]);

    let record = camera.photo(&id).unwrap();
    assert!(!record.is_empty());
    assert_eq!(record.metadata.original_filename, "IMG_0001.jpg");
    assert_eq!(record.metadata.device_path, "/sdcard/DCIM/Camera/IMG_0001.jpg");
    assert!(record.frame().is_ok());
}

#[test]
fn second_capture_reuses_open_camera() {
    let (camera, phone) = connected(CameraConfig::without_delays());

    camera.capture().unwrap();
    camera.capture().unwrap();

    assert_eq!(phone.count_commands("am start"), 1);
    assert_eq!(phone.shutter_presses(), 2);
}

#[test]
fn history_keeps_newest_photos() {
    let config = CameraConfig {
        photo_history: 3,
        ..CameraConfig::without_delays()
    };
    let (camera, _phone) = connected(config);

    let ids: Vec<String> = (0..4).map(|_| camera.capture().unwrap()).collect();

    assert_eq!(camera.list_photo_ids(), ids[1..].to_vec());
    assert!(camera.photo(&ids[0]).is_none());
    assert_eq!(camera.get_latest_photo_id(), Some(ids[3].clone()));
    assert_eq!(camera.latest_photo().unwrap().id, ids[3]);
}

#[test]
fn missing_photo_is_reported() {
    let config = CameraConfig {
        photo_root: "/sdcard/Pictures".to_string(),
        ..CameraConfig::without_delays()
    };
    let (camera, phone) = connected(config);

    match camera.capture() {
        Err(DeviceError::PhotoNotFound(root)) => assert_eq!(root, "/sdcard/Pictures"),
        other => panic!("expected PhotoNotFound, got {other:?}"),
    }
    assert_eq!(phone.shutter_presses(), 1);
    assert!(camera.list_photo_ids().is_empty());
}

#[test]
fn shutter_without_new_file_is_not_stored_twice() {
    let (camera, phone) = connected(CameraConfig::without_delays());
    let first = camera.capture().unwrap();

    phone.set_shutter_saves(false);
    match camera.capture() {
        Err(DeviceError::StalePhoto(path)) => {
            assert_eq!(path, "/sdcard/DCIM/Camera/IMG_0001.jpg")
        }
        other => panic!("expected StalePhoto, got {other:?}"),
    }
    assert_eq!(camera.list_photo_ids(), vec![first.clone()]);
    assert_eq!(phone.count_commands("pull"), 1);

    phone.set_shutter_saves(true);
    let third = camera.capture().unwrap();
    assert_ne!(third, first);
    assert_eq!(
        camera.photo(&third).unwrap().metadata.original_filename,
        "IMG_0003.jpg"
    );
}

#[test]
fn empty_photo_is_not_stored() {
    let (camera, phone) = connected(CameraConfig::without_delays());
    phone.set_photo_bytes(Vec::new());

    assert!(matches!(camera.capture(), Err(DeviceError::EmptyPhoto(_))));
    assert_eq!(camera.take_photo(), None);
    assert!(camera.list_photo_ids().is_empty());
}

#[test]
fn failed_pull_is_reported() {
    let (camera, phone) = connected(CameraConfig::without_delays());
    phone.fail_commands_containing("IMG_0001");

    assert!(matches!(
        camera.capture(),
        Err(DeviceError::CommandFailed { .. })
    ));
    assert!(camera.list_photo_ids().is_empty());
}

#[test]
fn idle_camera_is_closed_by_monitor() {
    let config = CameraConfig {
        idle_timeout_ms: 50,
        monitor_interval_ms: 20,
        ..CameraConfig::without_delays()
    };
    let (camera, phone) = connected(config);

    camera.open_camera().unwrap();
    assert!(phone.camera_open());

    assert!(eventually(|| !phone.camera_open()));
    assert!(!camera.is_camera_open());
    assert_eq!(phone.count_commands("am force-stop"), 1);
}

#[test]
fn busy_camera_stays_open() {
    let config = CameraConfig {
        idle_timeout_ms: 60_000,
        monitor_interval_ms: 10,
        ..CameraConfig::without_delays()
    };
    let (camera, phone) = connected(config);

    camera.capture().unwrap();
    thread::sleep(Duration::from_millis(60));

    assert!(phone.camera_open());
    assert_eq!(phone.count_commands("am force-stop"), 0);
}

#[test]
fn swipe_unlock_keeps_screen_awake_until_shutdown() {
    let config = CameraConfig::without_delays();
    let always_on = config.screen_timeout_always_on_ms.to_string();
    let (camera, phone) = connected(config);
    assert!(!camera.is_screen_on().unwrap());

    let prompted = Cell::new(false);
    let operator = || prompted.set(true);
    camera.wake_and_unlock(Some(&operator as &dyn Fn())).unwrap();

    assert!(!prompted.get());
    assert!(!phone.is_locked());
    assert!(camera.is_screen_on().unwrap());
    assert!(!camera.is_screen_locked().unwrap());
    assert_eq!(phone.setting("system", "screen_off_timeout"), Some(always_on));

    drop(camera);
    assert_eq!(
        phone.setting("system", "screen_off_timeout").as_deref(),
        Some("30000")
    );
    assert_eq!(
        phone.setting("secure", "lock_screen_after_timeout").as_deref(),
        Some("5000")
    );
}

#[test]
fn secure_lock_asks_operator() {
    let (camera, phone) = connected(CameraConfig::without_delays());
    phone.set_secure_lock(true);

    let prompts = Cell::new(0);
    let operator = || {
        prompts.set(prompts.get() + 1);
        phone.unlock();
    };
    camera.wake_and_unlock(Some(&operator as &dyn Fn())).unwrap();

    assert_eq!(prompts.get(), 1);
    assert!(!phone.is_locked());

    camera.shutdown();
    assert_eq!(
        phone.setting("system", "screen_off_timeout").as_deref(),
        Some("30000")
    );
}

#[test]
fn shutdown_without_unlock_leaves_settings_alone() {
    let (camera, phone) = connected(CameraConfig::without_delays());
    camera.capture().unwrap();

    camera.shutdown();

    assert!(!phone.camera_open());
    assert!(!camera.is_monitor_running());
    assert_eq!(phone.count_commands("settings put"), 0);
}
