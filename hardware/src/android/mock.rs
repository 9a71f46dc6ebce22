//! Scripted phone for exercising the camera controller without hardware.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use image::{GrayImage, ImageFormat, Luma};

use super::transport::{CommandOutput, DeviceTransport};
use super::{DeviceError, DeviceResult};

/// Luminance of the lock screen and home screen in generated screenshots.
const LOCKED_LUMA: u8 = 4;
const UNLOCKED_LUMA: u8 = 180;

fn solid_png(luma: u8) -> Vec<u8> {
    let image = GrayImage::from_pixel(16, 16, Luma([luma]));
    let mut out = Cursor::new(Vec::new());
    match image.write_to(&mut out, ImageFormat::Png) {
        Ok(()) => out.into_inner(),
        Err(_) => Vec::new(),
    }
}

struct Phone {
    devices: Vec<String>,
    screen_size: String,
    wakefulness: String,
    locked: bool,
    /// Swipes do not dismiss a secure lock screen.
    secure_lock: bool,
    settings: BTreeMap<String, String>,
    camera_package: String,
    camera_open: bool,
    shutter_keycode: String,
    shutter_presses: usize,
    /// Shutter presses write a new file.
    shutter_saves: bool,
    photo_root: String,
    photo_bytes: Vec<u8>,
    files: Vec<(String, Vec<u8>)>,
    failures: Vec<String>,
    log: Vec<String>,
}

impl Phone {
    fn handle_shell(&mut self, args: &[&str]) -> CommandOutput {
        let command = args.join(" ");
        self.log.push(format!("shell {command}"));

        if self.failures.iter().any(|p| command.contains(p.as_str())) {
            return CommandOutput::failed(1, format!("{command}: simulated failure"));
        }

        match args {
            ["wm", "size"] => CommandOutput::ok(format!("Physical size: {}", self.screen_size)),
            ["dumpsys", "power"] => CommandOutput::ok(format!(
                "POWER MANAGER (dumpsys power)\n  mWakefulness={}\n",
                self.wakefulness
            )),
            ["input", "swipe", ..] => {
                self.wakefulness = "Awake".to_string();
                if !self.secure_lock {
                    self.locked = false;
                }
                CommandOutput::ok("")
            }
            ["input", "keyevent", code] => {
                if *code == self.shutter_keycode && self.camera_open {
                    self.shutter_presses += 1;
                    if !self.shutter_saves {
                        return CommandOutput::ok("");
                    }
                    let path = format!(
                        "{}/Camera/IMG_{:04}.jpg",
                        self.photo_root, self.shutter_presses
                    );
                    let bytes = self.photo_bytes.clone();
                    self.files.push((path, bytes));
                }
                CommandOutput::ok("")
            }
            ["am", "start", "-n", component] => {
                if component.starts_with(&format!("{}/", self.camera_package)) {
                    self.camera_open = true;
                }
                CommandOutput::ok(format!("Starting: Intent {{ cmp={component} }}"))
            }
            ["am", "force-stop", package] => {
                if *package == self.camera_package {
                    self.camera_open = false;
                }
                CommandOutput::ok("")
            }
            ["settings", "get", namespace, key] => {
                let value = self
                    .settings
                    .get(&format!("{namespace}/{key}"))
                    .cloned()
                    .unwrap_or_else(|| "null".to_string());
                CommandOutput::ok(value)
            }
            ["settings", "put", namespace, key, value] => {
                self.settings
                    .insert(format!("{namespace}/{key}"), value.to_string());
                CommandOutput::ok("")
            }
            [single] if single.starts_with("find ") => {
                let root = single.split_whitespace().nth(1).unwrap_or_default();
                let newest = self
                    .files
                    .iter()
                    .rev()
                    .find(|(path, _)| path.starts_with(&format!("{root}/")))
                    .map(|(path, _)| format!("{path}\n"))
                    .unwrap_or_default();
                CommandOutput::ok(newest)
            }
            _ => CommandOutput::ok(""),
        }
    }
}

/// An in-memory phone answering the commands the camera controller issues.
///
/// Handles are cheap clones of one phone. The phone starts with one device
/// attached, its screen locked behind a swipe, and no photos.
#[derive(Clone)]
pub struct ScriptedTransport {
    phone: Arc<Mutex<Phone>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            phone: Arc::new(Mutex::new(Phone {
                devices: vec!["emulator-5554".to_string()],
                screen_size: "1080x2340".to_string(),
                wakefulness: "Asleep".to_string(),
                locked: true,
                secure_lock: false,
                settings: BTreeMap::from([
                    ("system/screen_off_timeout".to_string(), "30000".to_string()),
                    (
                        "secure/lock_screen_after_timeout".to_string(),
                        "5000".to_string(),
                    ),
                ]),
                camera_package: "com.android.camera".to_string(),
                camera_open: false,
                shutter_keycode: "27".to_string(),
                shutter_presses: 0,
                shutter_saves: true,
                photo_root: "/sdcard/DCIM".to_string(),
                photo_bytes: solid_png(128),
                files: Vec::new(),
                failures: Vec::new(),
                log: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phone> {
        self.phone.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_devices(&self, devices: &[&str]) {
        self.lock().devices = devices.iter().map(|d| d.to_string()).collect();
    }

    /// Require operator unlock: swipes no longer dismiss the lock screen.
    pub fn set_secure_lock(&self, secure: bool) {
        self.lock().secure_lock = secure;
    }

    /// Unlock as an operator would.
    pub fn unlock(&self) {
        self.lock().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    /// Bytes of every photo taken from now on.
    pub fn set_photo_bytes(&self, bytes: Vec<u8>) {
        self.lock().photo_bytes = bytes;
    }

    /// Whether shutter presses save a photo, as when storage is full.
    pub fn set_shutter_saves(&self, saves: bool) {
        self.lock().shutter_saves = saves;
    }

    /// Put a file on the device.
    pub fn add_file(&self, path: &str, bytes: Vec<u8>) {
        self.lock().files.push((path.to_string(), bytes));
    }

    /// Fail any shell command containing `pattern` with exit status 1.
    pub fn fail_commands_containing(&self, pattern: &str) {
        self.lock().failures.push(pattern.to_string());
    }

    pub fn camera_open(&self) -> bool {
        self.lock().camera_open
    }

    pub fn shutter_presses(&self) -> usize {
        self.lock().shutter_presses
    }

    /// `namespace/key` setting value.
    pub fn setting(&self, namespace: &str, key: &str) -> Option<String> {
        self.lock().settings.get(&format!("{namespace}/{key}")).cloned()
    }

    /// Every command received, in order, prefixed by its kind.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Number of received commands containing `pattern`.
    pub fn count_commands(&self, pattern: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    fn require_device(phone: &Phone, serial: &str) -> DeviceResult<()> {
        if phone.devices.iter().any(|d| d == serial) {
            Ok(())
        } else {
            Err(DeviceError::CommandFailed {
                command: format!("-s {serial}"),
                status: Some(1),
                stderr: format!("device '{serial}' not found"),
            })
        }
    }
}

impl DeviceTransport for ScriptedTransport {
    fn devices(&self) -> DeviceResult<Vec<String>> {
        let mut phone = self.lock();
        phone.log.push("devices".to_string());
        Ok(phone.devices.clone())
    }

    fn shell(&self, serial: &str, args: &[&str], _timeout: Duration) -> DeviceResult<CommandOutput> {
        let mut phone = self.lock();
        Self::require_device(&phone, serial)?;
        Ok(phone.handle_shell(args))
    }

    fn exec_out(&self, serial: &str, args: &[&str], _timeout: Duration) -> DeviceResult<Vec<u8>> {
        let mut phone = self.lock();
        Self::require_device(&phone, serial)?;
        phone.log.push(format!("exec-out {}", args.join(" ")));
        match args {
            ["screencap", "-p"] => Ok(solid_png(if phone.locked {
                LOCKED_LUMA
            } else {
                UNLOCKED_LUMA
            })),
            _ => Ok(Vec::new()),
        }
    }

    fn pull(&self, serial: &str, remote: &str, local: &Path, _timeout: Duration) -> DeviceResult<()> {
        let mut phone = self.lock();
        Self::require_device(&phone, serial)?;
        phone.log.push(format!("pull {remote}"));
        if phone.failures.iter().any(|p| remote.contains(p.as_str())) {
            return Err(DeviceError::CommandFailed {
                command: format!("pull {remote}"),
                status: Some(1),
                stderr: "simulated pull failure".to_string(),
            });
        }
        let Some((_, bytes)) = phone.files.iter().find(|(path, _)| path == remote) else {
            return Err(DeviceError::CommandFailed {
                command: format!("pull {remote}"),
                status: Some(1),
                stderr: format!("remote object '{remote}' does not exist"),
            });
        };
        std::fs::write(local, bytes)?;
        Ok(())
    }
}
