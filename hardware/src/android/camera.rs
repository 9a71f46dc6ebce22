//! Camera app lifecycle and photo capture on a tethered phone.

use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::frame::{frame_from_bytes, mean_luminance};
use shared::RingBuffer;
use tracing::{debug, info, trace, warn};

use super::monitor::IdleMonitor;
use super::photo::DevicePhotoRecord;
use super::transport::{AdbTransport, CommandOutput, DeviceTransport};
use super::{DeviceError, DeviceResult};

/// Screen size assumed when `wm size` cannot be parsed.
const DEFAULT_SCREEN_SIZE: (u32, u32) = (1080, 1920);

const SWIPE_DURATION_MS: u32 = 300;

const PHOTO_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "heic", "webp", "dng"];

/// Camera controller settings. Durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub camera_package: String,
    pub camera_activity: String,
    /// Key event that fires the shutter (`KEYCODE_CAMERA`).
    pub shutter_keycode: u32,
    /// Searched recursively for the newest photo.
    pub photo_root: String,
    /// The camera app is closed after this long without a capture.
    pub idle_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    pub launch_settle_ms: u64,
    pub shutter_settle_ms: u64,
    pub swipe_settle_ms: u64,
    /// Photos kept in memory.
    pub photo_history: usize,
    /// Screenshots darker than this mean luminance count as locked.
    pub lock_luminance_threshold: f64,
    pub screen_timeout_always_on_ms: u64,
    pub lock_after_timeout_long_ms: u64,
    /// Restored at teardown when the pre-session value is unknown.
    pub screen_timeout_normal_ms: u64,
    pub lock_after_timeout_normal_ms: u64,
    pub command_timeout_ms: u64,
    pub find_timeout_ms: u64,
    pub pull_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_package: "com.android.camera".to_string(),
            camera_activity: "com.android.camera.Camera".to_string(),
            shutter_keycode: 27,
            photo_root: "/sdcard/DCIM".to_string(),
            idle_timeout_ms: 300_000,
            monitor_interval_ms: 60_000,
            launch_settle_ms: 3_000,
            shutter_settle_ms: 2_000,
            swipe_settle_ms: 1_000,
            photo_history: 100,
            lock_luminance_threshold: 25.0,
            screen_timeout_always_on_ms: 2_147_483_647,
            lock_after_timeout_long_ms: 86_400_000,
            screen_timeout_normal_ms: 3_600_000,
            lock_after_timeout_normal_ms: 3_600_000,
            command_timeout_ms: 15_000,
            find_timeout_ms: 20_000,
            pull_timeout_ms: 60_000,
        }
    }
}

impl CameraConfig {
    /// Settings with every settle delay removed, for scripted devices.
    pub fn without_delays() -> Self {
        Self {
            launch_settle_ms: 0,
            shutter_settle_ms: 0,
            swipe_settle_ms: 0,
            ..Self::default()
        }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Shell pipeline printing the most recently modified photo under the root.
    fn find_latest_command(&self) -> String {
        let patterns = PHOTO_EXTENSIONS
            .iter()
            .map(|ext| format!("-iname '*.{ext}'"))
            .collect::<Vec<_>>()
            .join(" -o ");
        format!(
            "find {} -type f \\( {patterns} \\) -printf '%T@ %p\\n' 2>/dev/null | sort -nr | head -n 1 | cut -d' ' -f2-",
            self.photo_root
        )
    }
}

/// Snapshot of the controller's view of the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraDeviceState {
    pub device_id: Option<String>,
    pub camera_open: bool,
    /// Last open or capture.
    pub last_activity: Option<Instant>,
    pub idle_timeout: Duration,
}

/// Values of the screen settings before the session overrode them.
#[derive(Debug, Clone)]
struct SavedScreenSettings {
    screen_off_timeout: Option<String>,
    lock_after_timeout: Option<String>,
}

/// State shared with the idle monitor.
struct Session {
    transport: Arc<dyn DeviceTransport>,
    config: CameraConfig,
    state: Mutex<CameraDeviceState>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, CameraDeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn serial(state: &CameraDeviceState) -> DeviceResult<String> {
        state.device_id.clone().ok_or(DeviceError::NoDevice)
    }

    fn shell(&self, serial: &str, args: &[&str], timeout: Duration) -> DeviceResult<CommandOutput> {
        let out = self.transport.shell(serial, args, timeout)?;
        if !out.success() {
            return Err(DeviceError::CommandFailed {
                command: args.join(" "),
                status: out.status,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    fn open_camera(&self, state: &mut CameraDeviceState) -> DeviceResult<()> {
        if state.camera_open {
            return Ok(());
        }
        let serial = Self::serial(state)?;
        let component = format!("{}/{}", self.config.camera_package, self.config.camera_activity);
        self.shell(&serial, &["am", "start", "-n", &component], self.config.command_timeout())?;
        thread::sleep(Duration::from_millis(self.config.launch_settle_ms));

        state.camera_open = true;
        state.last_activity = Some(Instant::now());
        info!("Camera app opened");
        Ok(())
    }

    fn close_camera(&self, state: &mut CameraDeviceState) -> DeviceResult<()> {
        if !state.camera_open {
            return Ok(());
        }
        let serial = Self::serial(state)?;
        self.shell(
            &serial,
            &["am", "force-stop", &self.config.camera_package],
            self.config.command_timeout(),
        )?;
        state.camera_open = false;
        info!("Camera app closed");
        Ok(())
    }

    /// Close the camera if it has been idle past the timeout.
    fn close_if_idle(&self) {
        let mut state = self.lock();
        let idle = state.last_activity.map(|t| t.elapsed());
        match idle {
            Some(idle) if state.camera_open && idle > state.idle_timeout => {
                warn!("Camera idle for {:.0?}, closing", idle);
                if let Err(e) = self.close_camera(&mut state) {
                    warn!("Failed to close idle camera: {e}");
                }
            }
            _ => trace!("Idle check: camera_open={} idle={idle:?}", state.camera_open),
        }
    }
}

/// Parse `dumpsys power` output. `None` if no wakefulness line is present.
fn parse_screen_on(dumpsys: &str) -> Option<bool> {
    for line in dumpsys.lines() {
        let line = line.trim();
        if line.starts_with("mWakefulness=") || line.starts_with("mWakefulnessRaw=") {
            let state = line.rsplit('=').next()?.trim().to_ascii_lowercase();
            return Some(matches!(state.as_str(), "awake" | "dreaming"));
        }
        if line.contains("Display Power: state=") {
            let state = line.rsplit('=').next()?.trim().to_ascii_uppercase();
            return Some(matches!(state.as_str(), "ON" | "DOZE" | "DOZE_SUSPEND"));
        }
    }
    None
}

/// Parse `wm size` output, preferring an override size when present.
fn parse_screen_size(wm_size: &str) -> Option<(u32, u32)> {
    let parse = |prefix: &str| {
        wm_size.lines().find_map(|line| {
            let (w, h) = line.trim().strip_prefix(prefix)?.trim().split_once('x')?;
            Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
        })
    };
    parse("Override size:").or_else(|| parse("Physical size:"))
}

/// Drives the phone's camera app and keeps recent photos.
///
/// All device commands go through one lock, so the idle monitor never closes
/// the app between opening it and firing the shutter.
///
/// Dropping the controller stops the idle monitor, closes the camera app and
/// restores the screen settings that [`wake_and_unlock`](Self::wake_and_unlock)
/// changed.
pub struct CameraDeviceController {
    session: Arc<Session>,
    photos: Mutex<RingBuffer<DevicePhotoRecord>>,
    monitor: Mutex<Option<IdleMonitor>>,
    saved_screen: Mutex<Option<SavedScreenSettings>>,
}

impl CameraDeviceController {
    /// Controller that shells out to `adb`.
    pub fn new(config: CameraConfig) -> Self {
        Self::with_transport(config, Arc::new(AdbTransport::new()))
    }

    pub fn with_transport(config: CameraConfig, transport: Arc<dyn DeviceTransport>) -> Self {
        let photos = RingBuffer::new(config.photo_history.max(1));
        let state = CameraDeviceState {
            device_id: None,
            camera_open: false,
            last_activity: None,
            idle_timeout: config.idle_timeout(),
        };
        Self {
            session: Arc::new(Session {
                transport,
                config,
                state: Mutex::new(state),
            }),
            photos: Mutex::new(photos),
            monitor: Mutex::new(None),
            saved_screen: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.session.config
    }

    pub fn state(&self) -> CameraDeviceState {
        self.session.lock().clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.session.lock().device_id.clone()
    }

    pub fn is_camera_open(&self) -> bool {
        self.session.lock().camera_open
    }

    fn photos(&self) -> MutexGuard<'_, RingBuffer<DevicePhotoRecord>> {
        self.photos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn serial(&self) -> DeviceResult<String> {
        Session::serial(&self.session.lock())
    }

    // ==================== Device and screen ====================

    /// Select the first attached device.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NoDevice`] if nothing is attached.
    pub fn connect_device(&self) -> DeviceResult<String> {
        let devices = self.session.transport.devices()?;
        let Some(first) = devices.first().cloned() else {
            return Err(DeviceError::NoDevice);
        };
        if devices.len() > 1 {
            warn!("{} devices attached, using {first}", devices.len());
        }
        self.session.lock().device_id = Some(first.clone());
        info!("Connected to device {first}");
        Ok(first)
    }

    /// Physical screen size in pixels, 1080x1920 if it cannot be read.
    pub fn screen_size(&self) -> (u32, u32) {
        let size = self.serial().and_then(|serial| {
            self.session
                .shell(&serial, &["wm", "size"], self.config().command_timeout())
        });
        match size.map(|out| parse_screen_size(&out.stdout_text())) {
            Ok(Some(size)) => size,
            Ok(None) => {
                debug!("Unrecognized wm size output, assuming {DEFAULT_SCREEN_SIZE:?}");
                DEFAULT_SCREEN_SIZE
            }
            Err(e) => {
                debug!("Screen size query failed ({e}), assuming {DEFAULT_SCREEN_SIZE:?}");
                DEFAULT_SCREEN_SIZE
            }
        }
    }

    /// Whether the display is awake, from `dumpsys power`.
    pub fn is_screen_on(&self) -> DeviceResult<bool> {
        let serial = self.serial()?;
        let out = self
            .session
            .shell(&serial, &["dumpsys", "power"], self.config().command_timeout())?;
        Ok(parse_screen_on(&out.stdout_text()).unwrap_or(false))
    }

    /// Screenshot the display and treat a near-black image as locked.
    ///
    /// An empty or undecodable screenshot also counts as locked.
    pub fn is_screen_locked(&self) -> DeviceResult<bool> {
        let serial = self.serial()?;
        let png = self.session.transport.exec_out(
            &serial,
            &["screencap", "-p"],
            self.config().command_timeout(),
        )?;
        if png.is_empty() {
            return Ok(true);
        }
        match frame_from_bytes(&png) {
            Ok(frame) => {
                let mean = mean_luminance(&frame);
                debug!("Screenshot mean luminance {mean:.1}");
                Ok(mean < self.config().lock_luminance_threshold)
            }
            Err(e) => {
                warn!("Could not decode screenshot: {e}");
                Ok(true)
            }
        }
    }

    /// Swipe up to dismiss the lock screen and keep the display awake.
    ///
    /// If the screen still looks locked afterwards, `on_locked` is called so
    /// the operator can unlock it; without a callback this blocks until Enter
    /// is pressed on stdin. The screen-off and lock timeouts are then raised
    /// for the session.
    pub fn wake_and_unlock(&self, on_locked: Option<&dyn Fn()>) -> DeviceResult<()> {
        let serial = self.serial()?;
        let timeout = self.config().command_timeout();

        let (width, height) = self.screen_size();
        let x = (width / 2).to_string();
        let y_from = (height * 4 / 5).to_string();
        let y_to = (height / 5).to_string();
        let duration = SWIPE_DURATION_MS.to_string();
        self.session.shell(
            &serial,
            &["input", "swipe", &x, &y_from, &x, &y_to, &duration],
            timeout,
        )?;
        thread::sleep(Duration::from_millis(self.config().swipe_settle_ms));

        if self.is_screen_locked()? {
            warn!("Screen is still locked, operator action required");
            match on_locked {
                Some(callback) => callback(),
                None => {
                    eprintln!("Unlock the device, then press Enter to continue...");
                    io::stdin().lock().read_line(&mut String::new())?;
                }
            }
        }

        self.save_screen_settings(&serial)?;
        let always_on = self.config().screen_timeout_always_on_ms.to_string();
        let lock_after = self.config().lock_after_timeout_long_ms.to_string();
        self.put_setting(&serial, "system", "screen_off_timeout", &always_on)?;
        self.put_setting(&serial, "secure", "lock_screen_after_timeout", &lock_after)?;
        info!("Screen unlocked and kept awake");
        Ok(())
    }

    fn get_setting(&self, serial: &str, namespace: &str, key: &str) -> Option<String> {
        let out = self
            .session
            .shell(serial, &["settings", "get", namespace, key], self.config().command_timeout());
        match out.map(|o| o.stdout_text()) {
            Ok(value) if !value.is_empty() && value != "null" => Some(value),
            Ok(_) => None,
            Err(e) => {
                debug!("Reading {namespace}/{key} failed: {e}");
                None
            }
        }
    }

    fn put_setting(&self, serial: &str, namespace: &str, key: &str, value: &str) -> DeviceResult<()> {
        self.session.shell(
            serial,
            &["settings", "put", namespace, key, value],
            self.config().command_timeout(),
        )?;
        Ok(())
    }

    /// Remember the current screen settings, once per session.
    fn save_screen_settings(&self, serial: &str) -> DeviceResult<()> {
        let mut saved = self.saved_screen.lock().unwrap_or_else(PoisonError::into_inner);
        if saved.is_none() {
            let settings = SavedScreenSettings {
                screen_off_timeout: self.get_setting(serial, "system", "screen_off_timeout"),
                lock_after_timeout: self.get_setting(serial, "secure", "lock_screen_after_timeout"),
            };
            debug!("Saved screen settings {settings:?}");
            *saved = Some(settings);
        }
        Ok(())
    }

    fn restore_screen_settings(&self) -> DeviceResult<()> {
        let saved = self
            .saved_screen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(saved) = saved else {
            return Ok(());
        };
        let serial = self.serial()?;

        let screen_off = saved
            .screen_off_timeout
            .unwrap_or_else(|| self.config().screen_timeout_normal_ms.to_string());
        let lock_after = saved
            .lock_after_timeout
            .unwrap_or_else(|| self.config().lock_after_timeout_normal_ms.to_string());
        self.put_setting(&serial, "system", "screen_off_timeout", &screen_off)?;
        self.put_setting(&serial, "secure", "lock_screen_after_timeout", &lock_after)?;
        info!("Screen settings restored");
        Ok(())
    }

    // ==================== Camera app ====================

    /// Launch the camera app if it is not open, and make sure the idle
    /// monitor is running.
    pub fn open_camera(&self) -> DeviceResult<()> {
        {
            let mut state = self.session.lock();
            self.session.open_camera(&mut state)?;
        }
        self.ensure_monitor()
    }

    pub fn close_camera(&self) -> DeviceResult<()> {
        let mut state = self.session.lock();
        self.session.close_camera(&mut state)
    }

    fn ensure_monitor(&self) -> DeviceResult<()> {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.as_ref().is_some_and(IdleMonitor::is_running) {
            return Ok(());
        }
        let session = self.session.clone();
        let interval = Duration::from_millis(self.config().monitor_interval_ms);
        *monitor = Some(IdleMonitor::spawn(interval, move || session.close_if_idle())?);
        Ok(())
    }

    /// Whether the idle monitor thread is alive.
    pub fn is_monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(IdleMonitor::is_running)
    }

    // ==================== Capture ====================

    /// Fire the shutter and pull the resulting photo, returning its id.
    ///
    /// Opens the camera app first if needed.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::NoDevice`] before [`connect_device`](Self::connect_device)
    /// - [`DeviceError::PhotoNotFound`] if no photo exists under the photo root
    /// - [`DeviceError::StalePhoto`] if the newest photo is the one stored
    ///   by the previous capture
    /// - [`DeviceError::EmptyPhoto`] if the pulled file has no content
    /// - transport failures from any step
    pub fn capture(&self) -> DeviceResult<String> {
        let serial = {
            let mut state = self.session.lock();
            let serial = Session::serial(&state)?;
            self.session.open_camera(&mut state)?;

            let keycode = self.config().shutter_keycode.to_string();
            self.session.shell(
                &serial,
                &["input", "keyevent", &keycode],
                self.config().command_timeout(),
            )?;
            thread::sleep(Duration::from_millis(self.config().shutter_settle_ms));
            state.last_activity = Some(Instant::now());
            serial
        };
        self.ensure_monitor()?;

        let record = self.pull_latest_photo(&serial)?;
        let id = record.id.clone();
        info!("Stored photo {id} ({} bytes)", record.len());
        if let Some(evicted) = self.photos().push(record) {
            debug!("Evicted photo {}", evicted.id);
        }
        Ok(id)
    }

    /// [`capture`](Self::capture), logging the failure and returning `None`.
    pub fn take_photo(&self) -> Option<String> {
        match self.capture() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Photo capture failed: {e}");
                None
            }
        }
    }

    fn pull_latest_photo(&self, serial: &str) -> DeviceResult<DevicePhotoRecord> {
        let config = self.config();
        let find = config.find_latest_command();
        let out = self.session.shell(
            serial,
            &[find.as_str()],
            Duration::from_millis(config.find_timeout_ms),
        )?;
        let listing = out.stdout_text();
        let Some(device_path) = listing.lines().next().map(str::trim).filter(|p| !p.is_empty())
        else {
            return Err(DeviceError::PhotoNotFound(config.photo_root.clone()));
        };
        debug!("Newest photo on device: {device_path}");
        if self
            .photos()
            .back()
            .is_some_and(|r| r.metadata.device_path == device_path)
        {
            return Err(DeviceError::StalePhoto(device_path.to_string()));
        }

        let name = super::photo::file_name(device_path);
        let local = tempfile::Builder::new()
            .prefix("plotter_")
            .suffix(&format!("_{name}"))
            .tempfile()?;
        self.session.transport.pull(
            serial,
            device_path,
            local.path(),
            Duration::from_millis(config.pull_timeout_ms),
        )?;

        let bytes = std::fs::read(local.path())?;
        if bytes.is_empty() {
            return Err(DeviceError::EmptyPhoto(device_path.to_string()));
        }
        Ok(DevicePhotoRecord::new(bytes, device_path, Utc::now()))
    }

    // ==================== Stored photos ====================

    pub fn get_latest_photo_id(&self) -> Option<String> {
        self.photos().back().map(|r| r.id.clone())
    }

    /// Ids of stored photos, oldest first.
    pub fn list_photo_ids(&self) -> Vec<String> {
        self.photos().iter().map(|r| r.id.clone()).collect()
    }

    pub fn photo(&self, id: &str) -> Option<DevicePhotoRecord> {
        self.photos().find_newest(|r| r.id == id).cloned()
    }

    pub fn latest_photo(&self) -> Option<DevicePhotoRecord> {
        self.photos().back().cloned()
    }

    // ==================== Teardown ====================

    /// Stop the monitor, close the camera app and restore screen settings.
    ///
    /// Runs automatically on drop; calling it twice is harmless.
    pub fn shutdown(&self) {
        if let Some(mut monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.stop();
        }
        if let Err(e) = self.close_camera() {
            warn!("Failed to close camera during shutdown: {e}");
        }
        if let Err(e) = self.restore_screen_settings() {
            warn!("Failed to restore screen settings: {e}");
        }
    }
}

impl Drop for CameraDeviceController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_screen_on() {
        assert_eq!(parse_screen_on("  mWakefulness=Awake\n"), Some(true));
        assert_eq!(parse_screen_on("mWakefulnessRaw=Asleep"), Some(false));
        assert_eq!(parse_screen_on("mWakefulness=Dreaming"), Some(true));
        assert_eq!(
            parse_screen_on("Display Power: state=DOZE_SUSPEND"),
            Some(true)
        );
        assert_eq!(parse_screen_on("Display Power: state=OFF"), Some(false));
        assert_eq!(parse_screen_on("nothing relevant"), None);
    }

    #[test]
    fn test_parse_screen_size() {
        assert_eq!(parse_screen_size("Physical size: 1080x2340"), Some((1080, 2340)));
        assert_eq!(
            parse_screen_size("Physical size: 1440x3040\nOverride size: 1080x2280"),
            Some((1080, 2280))
        );
        assert_eq!(parse_screen_size("wm: error"), None);
    }

    #[test]
    fn test_find_command_covers_extensions() {
        let cmd = CameraConfig::default().find_latest_command();
        assert!(cmd.starts_with("find /sdcard/DCIM -type f"));
        for ext in PHOTO_EXTENSIONS {
            assert!(cmd.contains(&format!("'*.{ext}'")));
        }
        assert!(cmd.ends_with("cut -d' ' -f2-"));
    }

    #[test]
    fn test_default_config_round_trips_json() {
        let config = CameraConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CameraConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: CameraConfig = serde_json::from_str(r#"{"idle_timeout_ms": 1000}"#).unwrap();
        assert_eq!(partial.idle_timeout_ms, 1000);
        assert_eq!(partial.shutter_keycode, 27);
    }
}
