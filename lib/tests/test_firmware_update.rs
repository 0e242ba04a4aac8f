//! End-to-end firmware update flows against mock device/HID/tool plumbing.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use daqifi::firmware::bootloader;
use daqifi::firmware::updater::{
    DaqDevice, FirmwareUpdater, HidDeviceInfo, HidEnumerator, HidTransport, ToolEvent,
    ToolInvocation, ToolProcess, ToolRunner, UpdateError, UpdateOptions, UpdateProgress,
    UpdateState,
};
use tokio_util::sync::CancellationToken;

struct MockDevice {
    commands: Arc<Mutex<Vec<String>>>,
    connected: bool,
    streaming: bool,
    reconnect_failures: u32,
}

impl MockDevice {
    fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        (
            MockDevice {
                commands: commands.clone(),
                connected: true,
                streaming: false,
                reconnect_failures: 0,
            },
            commands,
        )
    }
}

impl DaqDevice for MockDevice {
    async fn send_command(&mut self, command: &str) -> io::Result<()> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn reconnect(&mut self) -> io::Result<()> {
        if self.reconnect_failures > 0 {
            self.reconnect_failures -= 1;
            return Err(io::Error::other("device not back yet"));
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    async fn stop_streaming(&mut self) -> io::Result<()> {
        self.streaming = false;
        Ok(())
    }

    fn name(&self) -> &str {
        "COM3"
    }
}

/// Answers bootloader frames with canned responses, optionally serving a few
/// bad acknowledgements first.
struct MockHid {
    connected: bool,
    pending: VecDeque<Vec<u8>>,
    bad_erase_acks: u32,
    bad_program_acks: u32,
}

impl MockHid {
    fn new() -> Self {
        MockHid {
            connected: false,
            pending: VecDeque::new(),
            bad_erase_acks: 0,
            bad_program_acks: 0,
        }
    }
}

impl HidTransport for MockHid {
    async fn connect(
        &mut self,
        _vendor_id: u16,
        _product_id: u16,
        _serial_number: &str,
    ) -> io::Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let (command, _payload) = bootloader::decode_frame(data).expect("well-formed frame");
        match command {
            0x01 => self
                .pending
                .push_back(vec![0x01, 0x10, 0x01, 0x10, 0x02, 0x05]),
            0x02 => {
                if self.bad_erase_acks > 0 {
                    self.bad_erase_acks -= 1;
                    self.pending.push_back(vec![0xEE]);
                } else {
                    self.pending.push_back(vec![0x01, 0x02]);
                }
            }
            0x03 => {
                if self.bad_program_acks > 0 {
                    self.bad_program_acks -= 1;
                    self.pending.push_back(vec![0xEE]);
                } else {
                    self.pending.push_back(vec![0x01, 0x03]);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn read(&mut self, _timeout: Duration) -> io::Result<Vec<u8>> {
        self.pending
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no response queued"))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

struct MockEnumerator {
    empty_polls: u32,
    fail: bool,
}

impl HidEnumerator for MockEnumerator {
    fn enumerate(&mut self, vendor_id: u16, product_id: u16) -> io::Result<Vec<HidDeviceInfo>> {
        if self.fail {
            return Err(io::Error::other("usb stack unavailable"));
        }
        if self.empty_polls > 0 {
            self.empty_polls -= 1;
            return Ok(Vec::new());
        }
        Ok(vec![HidDeviceInfo {
            vendor_id,
            product_id,
            path: "hid:1-1".to_string(),
            serial_number: "SN123".to_string(),
            product_name: "PIC32 Bootloader".to_string(),
        }])
    }
}

struct ScriptedProcess {
    events: VecDeque<ToolEvent>,
    stdin: Arc<Mutex<Vec<String>>>,
}

impl ToolProcess for ScriptedProcess {
    async fn next_event(&mut self) -> io::Result<ToolEvent> {
        Ok(self
            .events
            .pop_front()
            .unwrap_or(ToolEvent::Exited(Some(0))))
    }

    async fn write_stdin_line(&mut self, line: &str) -> io::Result<()> {
        self.stdin.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockRunner {
    events: Vec<ToolEvent>,
    stdin: Arc<Mutex<Vec<String>>>,
    invocations: Arc<Mutex<Vec<ToolInvocation>>>,
}

impl MockRunner {
    fn new(events: Vec<ToolEvent>) -> (Self, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<ToolInvocation>>>) {
        let stdin = Arc::new(Mutex::new(Vec::new()));
        let invocations = Arc::new(Mutex::new(Vec::new()));
        (
            MockRunner {
                events,
                stdin: stdin.clone(),
                invocations: invocations.clone(),
            },
            stdin,
            invocations,
        )
    }

    fn noop() -> Self {
        MockRunner::new(Vec::new()).0
    }
}

impl ToolRunner for MockRunner {
    type Process = ScriptedProcess;

    async fn spawn(&mut self, invocation: &ToolInvocation) -> io::Result<ScriptedProcess> {
        self.invocations.lock().unwrap().push(invocation.clone());
        Ok(ScriptedProcess {
            events: self.events.clone().into(),
            stdin: self.stdin.clone(),
        })
    }
}

fn fast_options() -> UpdateOptions {
    UpdateOptions {
        poll_interval: Duration::from_millis(1),
        post_force_boot_delay: Duration::from_millis(1),
        post_lan_firmware_mode_delay: Duration::from_millis(1),
        post_wifi_reconnect_delay: Duration::from_millis(1),
        hid_connect_retry_delay: Duration::from_millis(1),
        bootloader_response_timeout: Duration::from_millis(50),
        wifi_process_timeout: Duration::from_secs(5),
        preparing_device_timeout: Duration::from_secs(5),
        waiting_for_bootloader_timeout: Duration::from_secs(5),
        connecting_timeout: Duration::from_secs(5),
        erasing_flash_timeout: Duration::from_secs(5),
        programming_timeout: Duration::from_secs(5),
        verifying_timeout: Duration::from_secs(5),
        jumping_to_app_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

const HEX_FILE: &str = ":020000041D00DD\n:0B0010006164647265737320676170A7\n:00000001FF\n";

fn write_hex(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("firmware.hex");
    std::fs::write(&path, HEX_FILE).unwrap();
    path
}

fn progress_sink() -> (
    Box<dyn FnMut(UpdateProgress) + Send>,
    Arc<Mutex<Vec<UpdateProgress>>>,
) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    (
        Box::new(move |p: UpdateProgress| sink.lock().unwrap().push(p)),
        reports,
    )
}

#[tokio::test]
async fn test_pic32_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = write_hex(&dir);
    let (device, commands) = MockDevice::new();
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 2,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let state_sink = states.clone();
    updater.set_state_listener(Box::new(move |change| {
        state_sink.lock().unwrap().push(change.current);
    }));
    let (progress, reports) = progress_sink();

    updater
        .update_firmware(&hex_path, Some(progress), None)
        .await
        .unwrap();

    use UpdateState::*;
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            PreparingDevice,
            WaitingForBootloader,
            Connecting,
            ErasingFlash,
            Programming,
            Verifying,
            JumpingToApp,
            Complete,
            Idle,
        ]
    );
    assert_eq!(updater.state(), Idle);
    assert!(
        commands
            .lock()
            .unwrap()
            .contains(&"SYSTem:FORceBoot".to_string())
    );
    assert!(updater.device().is_connected());

    let reports = reports.lock().unwrap();
    assert!(!reports.is_empty());
    let mut last = 0.0_f64;
    for report in reports.iter() {
        assert!((0.0..=100.0).contains(&report.percent));
        assert!(report.percent >= last, "progress regressed: {report:?}");
        last = report.percent;
    }
    let final_report = reports.last().unwrap();
    assert_eq!(final_report.percent, 100.0);
    // ext-address record (7 bytes) + data record (16) + EOF (5)
    assert_eq!(final_report.total_bytes, 28);
    assert_eq!(final_report.bytes_written, 28);
}

#[tokio::test]
async fn test_transient_bad_acks_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = write_hex(&dir);
    let (device, _) = MockDevice::new();
    let mut hid = MockHid::new();
    hid.bad_erase_acks = 1;
    hid.bad_program_acks = 1;
    let mut updater = FirmwareUpdater::new(
        device,
        hid,
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    updater.update_firmware(&hex_path, None, None).await.unwrap();
    assert_eq!(updater.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_erase_retry_exhaustion_fails_in_state() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = write_hex(&dir);
    let (device, _) = MockDevice::new();
    let mut hid = MockHid::new();
    hid.bad_erase_acks = 100;
    let mut updater = FirmwareUpdater::new(
        device,
        hid,
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_firmware(&hex_path, None, None)
        .await
        .unwrap_err();
    assert_eq!(failure.failed_state, UpdateState::ErasingFlash);
    assert!(matches!(failure.source, UpdateError::InvalidData(_)));
    assert!(failure.recovery_guidance.contains("power-cycle"));
    assert_eq!(updater.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_no_writable_records() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = dir.path().join("empty.hex");
    std::fs::write(&hex_path, ":00000001FF\n").unwrap();
    let (device, _) = MockDevice::new();
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_firmware(&hex_path, None, None)
        .await
        .unwrap_err();
    assert!(matches!(failure.source, UpdateError::InvalidData(_)));
    assert!(failure.source.to_string().contains("no writable records"));
}

#[tokio::test]
async fn test_missing_hex_file() {
    let (device, _) = MockDevice::new();
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_firmware(std::path::Path::new("/nonexistent/firmware.hex"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(failure.source, UpdateError::NotFound(_)));
}

#[tokio::test]
async fn test_bootloader_never_appears_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = write_hex(&dir);
    let (device, _) = MockDevice::new();
    let options = UpdateOptions {
        waiting_for_bootloader_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        ..fast_options()
    };
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: u32::MAX,
            fail: false,
        },
        MockRunner::noop(),
        options,
    )
    .unwrap();
    let failure = updater
        .update_firmware(&hex_path, None, None)
        .await
        .unwrap_err();
    assert_eq!(failure.failed_state, UpdateState::WaitingForBootloader);
    let message = failure.source.to_string();
    assert!(matches!(failure.source, UpdateError::Timeout(_)));
    assert!(message.contains("WaitingForBootloader"));
    assert!(message.contains("0x04d8"));
    assert!(message.contains("polls"));
    assert!(failure.recovery_guidance.contains("unplugging"));
}

#[tokio::test]
async fn test_enumerator_failure_is_composite() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = write_hex(&dir);
    let (device, _) = MockDevice::new();
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: true,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_firmware(&hex_path, None, None)
        .await
        .unwrap_err();
    assert_eq!(failure.failed_state, UpdateState::WaitingForBootloader);
    let message = failure.source.to_string();
    assert!(message.contains("0x04d8"));
    assert!(message.contains("poll attempts"));
}

#[tokio::test]
async fn test_cancellation_moves_to_failed() {
    let dir = tempfile::tempdir().unwrap();
    let hex_path = write_hex(&dir);
    let (device, _) = MockDevice::new();
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = updater
        .update_firmware(&hex_path, None, Some(cancel))
        .await
        .unwrap_err();
    assert!(matches!(failure.source, UpdateError::Cancelled));
    assert_eq!(failure.failed_state, UpdateState::PreparingDevice);
    assert_eq!(updater.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_wifi_module_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("winc_flash_tool.cmd");
    std::fs::write(&firmware, b"@echo off\n").unwrap();

    let (device, commands) = MockDevice::new();
    let (runner, stdin, invocations) = MockRunner::new(vec![
        ToolEvent::Stdout("Begin write operation".to_string()),
        ToolEvent::Stdout("30%".to_string()),
        ToolEvent::Stdout("Power cycle WINC and set to bootloader mode".to_string()),
        ToolEvent::Stdout("60 %".to_string()),
        ToolEvent::Stdout("begin verify operation".to_string()),
        ToolEvent::Stdout("100%".to_string()),
        ToolEvent::Exited(Some(0)),
    ]);
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        runner,
        fast_options(),
    )
    .unwrap();
    let (progress, reports) = progress_sink();

    updater
        .update_wifi_module(&firmware, Some(progress), None)
        .await
        .unwrap();

    let commands = commands.lock().unwrap();
    assert!(commands.contains(&"SYSTem:COMMUnicate:LAN:FWUpdate".to_string()));
    assert!(commands.contains(&"SYSTem:COMMunicate:LAN:ENAbled 1".to_string()));
    assert!(commands.contains(&"SYSTem:COMMunicate:LAN:APPLY".to_string()));
    assert!(commands.contains(&"SYSTem:COMMunicate:LAN:SAVE".to_string()));

    // The power-cycle prompt got an empty stdin line.
    assert_eq!(*stdin.lock().unwrap(), vec![String::new()]);

    let invocations = invocations.lock().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].program, firmware);
    assert!(invocations[0].use_shell);
    assert!(invocations[0].args.contains(&"COM3".to_string()));

    let reports = reports.lock().unwrap();
    let mut last = 0.0_f64;
    for report in reports.iter() {
        assert!(report.percent >= last, "progress regressed: {report:?}");
        last = report.percent;
    }
    assert_eq!(reports.last().unwrap().percent, 100.0);
}

#[tokio::test]
async fn test_wifi_tool_found_in_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("firmware").join("tools");
    std::fs::create_dir_all(&nested).unwrap();
    let tool = nested.join("winc_flash_tool.cmd");
    std::fs::write(&tool, b"@echo off\n").unwrap();

    let (device, _) = MockDevice::new();
    let (runner, _, invocations) = MockRunner::new(vec![ToolEvent::Exited(Some(0))]);
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        runner,
        fast_options(),
    )
    .unwrap();
    updater
        .update_wifi_module(dir.path(), None, None)
        .await
        .unwrap();
    assert_eq!(invocations.lock().unwrap()[0].program, tool);
}

#[tokio::test]
async fn test_wifi_tool_missing_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (device, _) = MockDevice::new();
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        MockRunner::noop(),
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_wifi_module(dir.path(), None, None)
        .await
        .unwrap_err();
    assert_eq!(failure.failed_state, UpdateState::Programming);
    assert!(matches!(failure.source, UpdateError::NotFound(_)));
}

#[tokio::test]
async fn test_wifi_tool_reported_failure() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("winc_flash_tool.cmd");
    std::fs::write(&firmware, b"@echo off\n").unwrap();

    let (device, _) = MockDevice::new();
    let (runner, _, _) = MockRunner::new(vec![
        ToolEvent::Stdout("working".to_string()),
        ToolEvent::Stderr("Programming Device Failed".to_string()),
        ToolEvent::Exited(Some(0)),
    ]);
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        runner,
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_wifi_module(&firmware, None, None)
        .await
        .unwrap_err();
    assert_eq!(failure.failed_state, UpdateState::Programming);
    assert!(matches!(failure.source, UpdateError::Io(_)));
    assert!(failure.source.to_string().contains("Programming Device Failed"));
}

#[tokio::test]
async fn test_wifi_tool_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("winc_flash_tool.cmd");
    std::fs::write(&firmware, b"@echo off\n").unwrap();

    let (device, _) = MockDevice::new();
    let (runner, _, _) = MockRunner::new(vec![
        ToolEvent::Stdout("something went sideways".to_string()),
        ToolEvent::Exited(Some(2)),
    ]);
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        runner,
        fast_options(),
    )
    .unwrap();
    let failure = updater
        .update_wifi_module(&firmware, None, None)
        .await
        .unwrap_err();
    assert!(matches!(failure.source, UpdateError::Io(_)));
    assert!(failure.source.to_string().contains("sideways"));
}

#[tokio::test]
async fn test_wifi_verify_reconnect_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("winc_flash_tool.cmd");
    std::fs::write(&firmware, b"@echo off\n").unwrap();

    let (mut device, _) = MockDevice::new();
    device.reconnect_failures = u32::MAX;
    let (runner, _, _) = MockRunner::new(vec![ToolEvent::Exited(Some(0))]);
    let options = UpdateOptions {
        verifying_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        ..fast_options()
    };
    let mut updater = FirmwareUpdater::new(
        device,
        MockHid::new(),
        MockEnumerator {
            empty_polls: 0,
            fail: false,
        },
        runner,
        options,
    )
    .unwrap();
    let failure = updater
        .update_wifi_module(&firmware, None, None)
        .await
        .unwrap_err();
    assert_eq!(failure.failed_state, UpdateState::Verifying);
    assert!(matches!(failure.source, UpdateError::Timeout(_)));
    assert!(failure.source.to_string().contains("Verifying"));
}
