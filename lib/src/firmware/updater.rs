//! Multi-state firmware update orchestrator.
//!
//! Two flows share one state machine: the PIC32 flow drives the bootloader
//! frame protocol over a HID transport, and the WiFi-module flow drives the
//! vendor's flash tool as an external process. Device, HID transport, HID
//! enumeration, and process execution all sit behind traits so hosts can
//! supply their own plumbing.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;

use super::bootloader;
use super::hex::{HexError, HexParser, HexRecord, RECORD_TYPE_DATA};
use crate::scpi;

/// A device handle that is already connected when the update starts.
pub trait DaqDevice: Send {
    /// Send one SCPI command line.
    fn send_command(&mut self, command: &str)
    -> impl Future<Output = std::io::Result<()>> + Send;
    fn disconnect(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
    fn reconnect(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
    fn is_connected(&self) -> bool;
    fn is_streaming(&self) -> bool;
    fn stop_streaming(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
    /// Host name of the device's port, used to address the WiFi flash tool.
    fn name(&self) -> &str;
}

/// Raw byte transport to the bootloader HID interface.
pub trait HidTransport: Send {
    fn connect(
        &mut self,
        vendor_id: u16,
        product_id: u16,
        serial_number: &str,
    ) -> impl Future<Output = std::io::Result<()>> + Send;
    fn disconnect(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
    fn write(&mut self, data: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send;
    /// Read one response payload, failing with `TimedOut` when nothing
    /// arrives within `timeout`.
    fn read(&mut self, timeout: Duration) -> impl Future<Output = std::io::Result<Vec<u8>>> + Send;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: String,
    pub serial_number: String,
    pub product_name: String,
}

pub trait HidEnumerator: Send {
    fn enumerate(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<HidDeviceInfo>, std::io::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `.cmd`/`.bat` scripts need the platform shell on hosts that have one.
    pub use_shell: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    Stdout(String),
    Stderr(String),
    Exited(Option<i32>),
}

pub trait ToolProcess: Send {
    /// Next stdout/stderr line, or the exit status once both streams close.
    fn next_event(&mut self) -> impl Future<Output = std::io::Result<ToolEvent>> + Send;
    fn write_stdin_line(&mut self, line: &str)
    -> impl Future<Output = std::io::Result<()>> + Send;
    fn kill(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
}

pub trait ToolRunner: Send {
    type Process: ToolProcess;
    fn spawn(
        &mut self,
        invocation: &ToolInvocation,
    ) -> impl Future<Output = std::io::Result<Self::Process>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateState {
    Idle,
    PreparingDevice,
    WaitingForBootloader,
    Connecting,
    ErasingFlash,
    Programming,
    Verifying,
    JumpingToApp,
    Complete,
    Failed,
}

impl UpdateState {
    pub fn can_transition_to(self, next: UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (self, next),
            (Idle, PreparingDevice | Failed)
                | (PreparingDevice, WaitingForBootloader | Programming | Failed)
                | (WaitingForBootloader, Connecting | Failed)
                | (Connecting, ErasingFlash | Failed)
                | (ErasingFlash, Programming | Failed)
                | (Programming, Verifying | JumpingToApp | Failed)
                | (Verifying, JumpingToApp | Complete | Failed)
                | (JumpingToApp, Complete | Failed)
                | (Complete, Idle)
                | (Failed, Idle)
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub previous: UpdateState,
    pub current: UpdateState,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateProgress {
    pub state: UpdateState,
    /// Clamped to `[0, 100]`.
    pub percent: f64,
    pub operation: String,
    pub bytes_written: u64,
    pub total_bytes: u64,
}

pub type UpdateProgressFn = Box<dyn FnMut(UpdateProgress) + Send>;
pub type StateChangeFn = Box<dyn FnMut(StateChange) + Send>;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update cancelled")]
    Cancelled,
    #[error("{0}")]
    Timeout(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("hex file error: {0}")]
    Hex(#[from] HexError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Transient failures drive bounded retries inside a state; everything
    /// else is immediately fatal.
    fn is_transient(&self) -> bool {
        matches!(self, UpdateError::Io(_) | UpdateError::InvalidData(_))
    }
}

/// Terminal failure of an update run.
#[derive(Debug, Error)]
#[error("firmware update failed during {failed_state} ({operation}): {source}; {recovery_guidance}")]
pub struct UpdateFailure {
    pub failed_state: UpdateState,
    pub operation: String,
    pub recovery_guidance: String,
    #[source]
    pub source: UpdateError,
}

fn recovery_guidance(state: UpdateState) -> &'static str {
    use UpdateState::*;
    match state {
        PreparingDevice => "check that the device is connected and responding, then retry",
        WaitingForBootloader => "try unplugging and replugging the device's USB cable, then retry",
        Connecting => "close other applications that may hold the bootloader HID device and retry",
        ErasingFlash => "power-cycle the device and retry; the previous firmware may still be intact",
        Programming => "do not power off the device; retry the update to reflash",
        Verifying => "retry the update; if verification keeps failing, reflash from the bootloader",
        JumpingToApp => "power-cycle the device manually; the new firmware is already flashed",
        Idle | Complete | Failed => "retry the update",
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub bootloader_vendor_id: u16,
    pub bootloader_product_id: u16,
    pub poll_interval: Duration,
    pub post_force_boot_delay: Duration,
    pub post_lan_firmware_mode_delay: Duration,
    pub post_wifi_reconnect_delay: Duration,
    pub hid_connect_retry_count: u32,
    pub hid_connect_retry_delay: Duration,
    pub flash_write_retry_count: u32,
    pub bootloader_response_timeout: Duration,
    pub wifi_process_timeout: Duration,
    pub wifi_flash_tool_file_name: String,
    pub wifi_flash_tool_arguments_template: String,
    pub wifi_port_override: Option<String>,
    pub preparing_device_timeout: Duration,
    pub waiting_for_bootloader_timeout: Duration,
    pub connecting_timeout: Duration,
    pub erasing_flash_timeout: Duration,
    pub programming_timeout: Duration,
    pub verifying_timeout: Duration,
    pub jumping_to_app_timeout: Duration,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            // Microchip's PIC32 HID bootloader
            bootloader_vendor_id: 0x04D8,
            bootloader_product_id: 0x003C,
            poll_interval: Duration::from_millis(500),
            post_force_boot_delay: Duration::from_secs(3),
            post_lan_firmware_mode_delay: Duration::from_secs(5),
            post_wifi_reconnect_delay: Duration::from_secs(5),
            hid_connect_retry_count: 5,
            hid_connect_retry_delay: Duration::from_secs(1),
            flash_write_retry_count: 3,
            bootloader_response_timeout: Duration::from_secs(2),
            wifi_process_timeout: Duration::from_secs(300),
            wifi_flash_tool_file_name: "winc_flash_tool.cmd".to_string(),
            wifi_flash_tool_arguments_template: "/p {port} /d WINC1500 /k /e /i aio /w"
                .to_string(),
            wifi_port_override: None,
            preparing_device_timeout: Duration::from_secs(30),
            waiting_for_bootloader_timeout: Duration::from_secs(60),
            connecting_timeout: Duration::from_secs(30),
            erasing_flash_timeout: Duration::from_secs(60),
            programming_timeout: Duration::from_secs(600),
            verifying_timeout: Duration::from_secs(30),
            jumping_to_app_timeout: Duration::from_secs(60),
        }
    }
}

impl UpdateOptions {
    pub fn state_timeout(&self, state: UpdateState) -> Duration {
        use UpdateState::*;
        match state {
            PreparingDevice => self.preparing_device_timeout,
            WaitingForBootloader => self.waiting_for_bootloader_timeout,
            Connecting => self.connecting_timeout,
            ErasingFlash => self.erasing_flash_timeout,
            Programming => self.programming_timeout,
            Verifying => self.verifying_timeout,
            JumpingToApp => self.jumping_to_app_timeout,
            Idle | Complete | Failed => Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        let durations = [
            ("poll_interval", self.poll_interval),
            ("post_force_boot_delay", self.post_force_boot_delay),
            ("post_lan_firmware_mode_delay", self.post_lan_firmware_mode_delay),
            ("post_wifi_reconnect_delay", self.post_wifi_reconnect_delay),
            ("hid_connect_retry_delay", self.hid_connect_retry_delay),
            ("bootloader_response_timeout", self.bootloader_response_timeout),
            ("wifi_process_timeout", self.wifi_process_timeout),
            ("preparing_device_timeout", self.preparing_device_timeout),
            ("waiting_for_bootloader_timeout", self.waiting_for_bootloader_timeout),
            ("connecting_timeout", self.connecting_timeout),
            ("erasing_flash_timeout", self.erasing_flash_timeout),
            ("programming_timeout", self.programming_timeout),
            ("verifying_timeout", self.verifying_timeout),
            ("jumping_to_app_timeout", self.jumping_to_app_timeout),
        ];
        for (name, duration) in durations {
            if duration.is_zero() {
                return Err(UpdateError::InvalidArgument(format!(
                    "{name} must be strictly positive"
                )));
            }
        }
        if self.hid_connect_retry_count == 0 {
            return Err(UpdateError::InvalidArgument(
                "hid_connect_retry_count must be strictly positive".to_string(),
            ));
        }
        if self.flash_write_retry_count == 0 {
            return Err(UpdateError::InvalidArgument(
                "flash_write_retry_count must be strictly positive".to_string(),
            ));
        }
        if self.wifi_flash_tool_file_name.is_empty() {
            return Err(UpdateError::InvalidArgument(
                "wifi_flash_tool_file_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn base_percent(state: UpdateState) -> Option<f64> {
    use UpdateState::*;
    match state {
        PreparingDevice => Some(5.0),
        WaitingForBootloader => Some(10.0),
        Connecting => Some(15.0),
        ErasingFlash | Programming => Some(20.0),
        Verifying => Some(90.0),
        JumpingToApp => Some(95.0),
        Complete => Some(100.0),
        Idle | Failed => None,
    }
}

fn state_timeout_message(state: UpdateState, operation: &str, budget: Duration) -> String {
    format!(
        "state {state} ({operation}) exceeded its {:.0} s timeout",
        budget.as_secs_f64()
    )
}

/// Await `fut`, racing the caller's cancellation and the state deadline.
async fn run_guarded<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    state: UpdateState,
    operation: &str,
    budget: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, UpdateError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UpdateError::Cancelled),
        result = timeout_at(deadline, fut) => {
            result.map_err(|_| UpdateError::Timeout(state_timeout_message(state, operation, budget)))
        }
    }
}

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,3})\s*%").unwrap());

fn scan_percent(line: &str) -> Option<f64> {
    let captures = PERCENT_RE.captures(line)?;
    let percent: u32 = captures[1].parse().ok()?;
    Some(f64::from(percent.min(100)))
}

fn heuristic_percent(line: &str) -> Option<f64> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("begin write operation") {
        Some(33.0)
    } else if lower.contains("begin read operation") {
        Some(66.0)
    } else if lower.contains("begin verify operation") {
        Some(90.0)
    } else {
        None
    }
}

/// One update at a time: the machine starts in `Idle`, walks the flow's
/// states, and returns to `Idle` through `Complete` or `Failed`.
pub struct FirmwareUpdater<D, H, E, T> {
    device: D,
    hid: H,
    enumerator: E,
    tools: T,
    options: UpdateOptions,
    state: UpdateState,
    operation: String,
    on_state_changed: Option<StateChangeFn>,
    progress: Option<UpdateProgressFn>,
    cancel: CancellationToken,
    bytes_written: u64,
    total_bytes: u64,
    last_percent: f64,
}

impl<D, H, E, T> FirmwareUpdater<D, H, E, T>
where
    D: DaqDevice,
    H: HidTransport,
    E: HidEnumerator,
    T: ToolRunner,
{
    pub fn new(
        device: D,
        hid: H,
        enumerator: E,
        tools: T,
        options: UpdateOptions,
    ) -> Result<Self, UpdateError> {
        options.validate()?;
        Ok(FirmwareUpdater {
            device,
            hid,
            enumerator,
            tools,
            options,
            state: UpdateState::Idle,
            operation: String::new(),
            on_state_changed: None,
            progress: None,
            cancel: CancellationToken::new(),
            bytes_written: 0,
            total_bytes: 0,
            last_percent: 0.0,
        })
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Subscribe to state transitions. The subscriber must not synchronously
    /// start another update.
    pub fn set_state_listener(&mut self, listener: StateChangeFn) {
        self.on_state_changed = Some(listener);
    }

    /// Flash the PIC32 application firmware from an Intel-HEX file.
    pub async fn update_firmware(
        &mut self,
        hex_path: &Path,
        progress: Option<UpdateProgressFn>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), UpdateFailure> {
        self.begin(progress, cancel)?;
        let result = self.run_pic32(hex_path).await;
        self.finish(result).await
    }

    /// Flash the WiFi radio module by driving the vendor flash tool.
    pub async fn update_wifi_module(
        &mut self,
        firmware_path: &Path,
        progress: Option<UpdateProgressFn>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), UpdateFailure> {
        self.begin(progress, cancel)?;
        let result = self.run_wifi(firmware_path).await;
        self.finish(result).await
    }

    fn begin(
        &mut self,
        progress: Option<UpdateProgressFn>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), UpdateFailure> {
        if self.state != UpdateState::Idle {
            return Err(UpdateFailure {
                failed_state: self.state,
                operation: "start".to_string(),
                recovery_guidance: recovery_guidance(self.state).to_string(),
                source: UpdateError::InvalidOperation(
                    "an update is already in progress".to_string(),
                ),
            });
        }
        self.progress = progress;
        self.cancel = cancel.unwrap_or_default();
        self.bytes_written = 0;
        self.total_bytes = 0;
        self.last_percent = 0.0;
        self.operation = "Starting update".to_string();
        Ok(())
    }

    async fn finish(&mut self, result: Result<(), UpdateError>) -> Result<(), UpdateFailure> {
        // Always leave the HID transport closed, whatever happened.
        if self.hid.is_connected() {
            if let Err(e) = self.hid.disconnect().await {
                warn!("failed to disconnect HID transport: {e}");
            }
        }
        match result {
            Ok(()) => {
                self.transition(UpdateState::Idle, "Ready");
                self.progress = None;
                Ok(())
            }
            Err(source) => {
                let failed_state = self.state;
                let operation = self.operation.clone();
                error!("firmware update failed during {failed_state} ({operation}): {source}");
                self.transition(UpdateState::Failed, &operation);
                self.transition(UpdateState::Idle, "Ready");
                self.progress = None;
                Err(UpdateFailure {
                    failed_state,
                    operation,
                    recovery_guidance: recovery_guidance(failed_state).to_string(),
                    source,
                })
            }
        }
    }

    /// Move the machine, emitting a StateChanged event and a progress report.
    /// Transitions outside the table are a bug, logged and suppressed.
    fn transition(&mut self, next: UpdateState, operation: &str) {
        if !self.state.can_transition_to(next) {
            error!("illegal state transition {} -> {next} suppressed", self.state);
            return;
        }
        let change = StateChange {
            previous: self.state,
            current: next,
            operation: operation.to_string(),
            timestamp: Utc::now(),
        };
        info!("firmware update: {} -> {next} ({operation})", self.state);
        self.state = next;
        self.operation = operation.to_string();
        if let Some(listener) = self.on_state_changed.as_mut() {
            listener(change);
        }
        let percent = base_percent(next).unwrap_or(self.last_percent);
        self.report_progress(percent);
    }

    fn report_progress(&mut self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        self.last_percent = percent;
        if let Some(progress) = self.progress.as_mut() {
            progress(UpdateProgress {
                state: self.state,
                percent,
                operation: self.operation.clone(),
                bytes_written: self.bytes_written,
                total_bytes: self.total_bytes,
            });
        }
    }

    async fn run_pic32(&mut self, hex_path: &Path) -> Result<(), UpdateError> {
        let text = tokio::fs::read_to_string(hex_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UpdateError::NotFound(format!("hex file {} not found", hex_path.display()))
            } else {
                UpdateError::Io(e)
            }
        })?;
        let records = HexParser::new().parse(&text)?;
        if !records.iter().any(|r| r.record_type == RECORD_TYPE_DATA) {
            return Err(UpdateError::InvalidData(
                "hex file contains no writable records".to_string(),
            ));
        }
        self.total_bytes = records.iter().map(|r| r.bytes.len() as u64).sum();
        info!(
            "flashing {} records ({} bytes) from {}",
            records.len(),
            self.total_bytes,
            hex_path.display()
        );

        self.transition(UpdateState::PreparingDevice, "Preparing device for update");
        self.step_prepare_device().await?;

        self.transition(UpdateState::WaitingForBootloader, "Waiting for bootloader");
        let discovered = self.step_wait_for_bootloader().await?;

        self.transition(UpdateState::Connecting, "Connecting to bootloader");
        self.step_connect(&discovered.serial_number).await?;

        self.transition(UpdateState::ErasingFlash, "Erasing flash");
        self.step_erase().await?;

        self.transition(UpdateState::Programming, "Programming flash");
        self.step_program(&records).await?;

        self.transition(UpdateState::Verifying, "Verifying bootloader");
        self.step_verify().await?;

        self.transition(UpdateState::JumpingToApp, "Jumping to application");
        self.step_jump().await?;

        self.transition(UpdateState::Complete, "Update complete");
        Ok(())
    }

    async fn step_prepare_device(&mut self) -> Result<(), UpdateError> {
        let state = UpdateState::PreparingDevice;
        let operation = "Preparing device for update";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;

        if !self.device.is_connected() {
            return Err(UpdateError::InvalidOperation(
                "device is not connected".to_string(),
            ));
        }
        if self.device.is_streaming() {
            run_guarded(&cancel, deadline, state, operation, budget, self.device.stop_streaming())
                .await??;
        }
        run_guarded(
            &cancel,
            deadline,
            state,
            operation,
            budget,
            self.device.send_command(scpi::force_boot()),
        )
        .await??;
        let boot_delay = Instant::now() + self.options.post_force_boot_delay;
        run_guarded(&cancel, deadline, state, operation, budget, sleep_until(boot_delay)).await?;
        run_guarded(&cancel, deadline, state, operation, budget, self.device.disconnect())
            .await??;
        Ok(())
    }

    async fn step_wait_for_bootloader(&mut self) -> Result<HidDeviceInfo, UpdateError> {
        let state = UpdateState::WaitingForBootloader;
        let operation = "Waiting for bootloader";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;
        let vendor_id = self.options.bootloader_vendor_id;
        let product_id = self.options.bootloader_product_id;
        let mut polls = 0u32;
        let last_error: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if Instant::now() >= deadline {
                let last = last_error
                    .map(|e| format!(" (last enumeration error: {e})"))
                    .unwrap_or_default();
                return Err(UpdateError::Timeout(format!(
                    "{}: no HID device with vendor {vendor_id:#06x} product {product_id:#06x} \
                     after {polls} polls{last}",
                    state_timeout_message(state, operation, budget)
                )));
            }
            polls += 1;
            match self.enumerator.enumerate(vendor_id, product_id) {
                Ok(devices) => {
                    if let Some(device) = devices.into_iter().next() {
                        info!(
                            "bootloader appeared after {polls} polls (serial {:?})",
                            device.serial_number
                        );
                        return Ok(device);
                    }
                }
                Err(e) => {
                    return Err(UpdateError::Io(std::io::Error::other(format!(
                        "HID enumeration for vendor {vendor_id:#06x} product {product_id:#06x} \
                         failed after {polls} poll attempts: {e}"
                    ))));
                }
            }
            let next_poll = Instant::now() + self.options.poll_interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                _ = sleep_until(next_poll.min(deadline)) => {}
            }
        }
    }

    async fn step_connect(&mut self, serial_number: &str) -> Result<(), UpdateError> {
        let state = UpdateState::Connecting;
        let operation = "Connecting to bootloader";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;
        let vendor_id = self.options.bootloader_vendor_id;
        let product_id = self.options.bootloader_product_id;
        let response_timeout = self.options.bootloader_response_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result: Result<(), UpdateError> = async {
                if self.hid.is_connected() {
                    run_guarded(&cancel, deadline, state, operation, budget, self.hid.disconnect())
                        .await??;
                }
                run_guarded(
                    &cancel,
                    deadline,
                    state,
                    operation,
                    budget,
                    self.hid.connect(vendor_id, product_id, serial_number),
                )
                .await??;
                let frame = bootloader::request_version_frame();
                run_guarded(&cancel, deadline, state, operation, budget, self.hid.write(&frame))
                    .await??;
                let response = run_guarded(
                    &cancel,
                    deadline,
                    state,
                    operation,
                    budget,
                    self.hid.read(response_timeout),
                )
                .await??;
                match bootloader::decode_version(&response) {
                    Some(version) => {
                        info!("bootloader reported version {version}");
                        Ok(())
                    }
                    None => Err(UpdateError::InvalidData(
                        "bootloader returned an error for the version request".to_string(),
                    )),
                }
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.options.hid_connect_retry_count => {
                    debug!("bootloader connect attempt {attempt} failed: {e}");
                    let retry_at = Instant::now() + self.options.hid_connect_retry_delay;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                        _ = sleep_until(retry_at) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn step_erase(&mut self) -> Result<(), UpdateError> {
        let state = UpdateState::ErasingFlash;
        let operation = "Erasing flash";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;
        let response_timeout = self.options.bootloader_response_timeout;
        let frame = bootloader::erase_frame();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = Self::exchange(
                &mut self.hid,
                &cancel,
                deadline,
                state,
                operation,
                budget,
                response_timeout,
                &frame,
            )
            .await
            .and_then(|response| {
                if bootloader::is_erase_ack(&response) {
                    Ok(())
                } else {
                    Err(UpdateError::InvalidData(
                        "invalid erase acknowledgement".to_string(),
                    ))
                }
            });
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.options.flash_write_retry_count => {
                    debug!("erase attempt {attempt} failed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn step_program(&mut self, records: &[HexRecord]) -> Result<(), UpdateError> {
        let state = UpdateState::Programming;
        let operation = "Programming flash";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;
        let response_timeout = self.options.bootloader_response_timeout;

        for record in records {
            let frame = bootloader::program_frame(&record.bytes);
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let result = Self::exchange(
                    &mut self.hid,
                    &cancel,
                    deadline,
                    state,
                    operation,
                    budget,
                    response_timeout,
                    &frame,
                )
                .await
                .and_then(|response| {
                    if bootloader::is_program_ack(&response) {
                        Ok(())
                    } else {
                        Err(UpdateError::InvalidData(format!(
                            "invalid program acknowledgement for record at {:#010x}",
                            record.full_address
                        )))
                    }
                });
                match result {
                    Ok(()) => break,
                    Err(e) if e.is_transient() && attempt < self.options.flash_write_retry_count => {
                        debug!(
                            "program attempt {attempt} for record at {:#010x} failed: {e}",
                            record.full_address
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            self.bytes_written += record.bytes.len() as u64;
            let percent =
                20.0 + (self.bytes_written as f64 / self.total_bytes as f64) * 70.0;
            self.report_progress(percent);
        }
        Ok(())
    }

    async fn step_verify(&mut self) -> Result<(), UpdateError> {
        let state = UpdateState::Verifying;
        let operation = "Verifying bootloader";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;
        let response_timeout = self.options.bootloader_response_timeout;
        let frame = bootloader::request_version_frame();

        let response = Self::exchange(
            &mut self.hid,
            &cancel,
            deadline,
            state,
            operation,
            budget,
            response_timeout,
            &frame,
        )
        .await?;
        match bootloader::decode_version(&response) {
            Some(version) => {
                debug!("post-program bootloader version {version}");
                Ok(())
            }
            None => Err(UpdateError::InvalidData(
                "bootloader version could not be verified".to_string(),
            )),
        }
    }

    async fn step_jump(&mut self) -> Result<(), UpdateError> {
        let state = UpdateState::JumpingToApp;
        let operation = "Jumping to application";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;

        let frame = bootloader::jump_frame();
        run_guarded(&cancel, deadline, state, operation, budget, self.hid.write(&frame)).await??;
        run_guarded(&cancel, deadline, state, operation, budget, self.hid.disconnect()).await??;

        // Best-effort reconnect: per-attempt failures are swallowed and an
        // exhausted budget still completes the state.
        self.reconnect_device(state, operation, deadline, budget, false).await
    }

    /// Poll `device.reconnect()` until it succeeds or the deadline passes.
    /// When `mandatory`, an exhausted deadline is a state timeout.
    async fn reconnect_device(
        &mut self,
        state: UpdateState,
        operation: &str,
        deadline: Instant,
        budget: Duration,
        mandatory: bool,
    ) -> Result<(), UpdateError> {
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if Instant::now() >= deadline {
                if mandatory {
                    return Err(UpdateError::Timeout(state_timeout_message(
                        state, operation, budget,
                    )));
                }
                debug!("reconnect budget exhausted; continuing without the device");
                return Ok(());
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                result = self.device.reconnect() => result,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => debug!("device reconnect attempt failed: {e}"),
            }
            let next_attempt = Instant::now() + self.options.poll_interval;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                _ = sleep_until(next_attempt.min(deadline)) => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        hid: &mut H,
        cancel: &CancellationToken,
        deadline: Instant,
        state: UpdateState,
        operation: &str,
        budget: Duration,
        response_timeout: Duration,
        frame: &[u8],
    ) -> Result<Vec<u8>, UpdateError> {
        run_guarded(cancel, deadline, state, operation, budget, hid.write(frame)).await??;
        let response = run_guarded(
            cancel,
            deadline,
            state,
            operation,
            budget,
            hid.read(response_timeout),
        )
        .await??;
        Ok(response)
    }

    async fn run_wifi(&mut self, firmware_path: &Path) -> Result<(), UpdateError> {
        self.transition(
            UpdateState::PreparingDevice,
            "Preparing device for WiFi module update",
        );
        self.step_wifi_prepare().await?;

        self.transition(UpdateState::Programming, "Flashing WiFi module");
        self.step_wifi_flash(firmware_path).await?;

        self.transition(UpdateState::Verifying, "Re-enabling WiFi");
        self.step_wifi_verify().await?;

        self.transition(UpdateState::Complete, "Update complete");
        Ok(())
    }

    async fn step_wifi_prepare(&mut self) -> Result<(), UpdateError> {
        let state = UpdateState::PreparingDevice;
        let operation = "Preparing device for WiFi module update";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;

        run_guarded(
            &cancel,
            deadline,
            state,
            operation,
            budget,
            self.device.send_command(scpi::lan_firmware_update()),
        )
        .await??;
        let mode_delay = Instant::now() + self.options.post_lan_firmware_mode_delay;
        run_guarded(&cancel, deadline, state, operation, budget, sleep_until(mode_delay)).await?;
        run_guarded(&cancel, deadline, state, operation, budget, self.device.disconnect())
            .await??;
        Ok(())
    }

    async fn step_wifi_flash(&mut self, firmware_path: &Path) -> Result<(), UpdateError> {
        let state = UpdateState::Programming;
        let operation = "Flashing WiFi module";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;

        let tool_path = resolve_tool_path(firmware_path, &self.options.wifi_flash_tool_file_name)?;
        let port = self
            .options
            .wifi_port_override
            .clone()
            .unwrap_or_else(|| self.device.name().to_string());
        let mut args_template = self
            .options
            .wifi_flash_tool_arguments_template
            .replace("{port}", &port);
        if args_template.contains("{firmwarePath}") {
            args_template =
                args_template.replace("{firmwarePath}", &firmware_path.display().to_string());
        }
        let extension = tool_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let invocation = ToolInvocation {
            program: tool_path,
            args: args_template.split_whitespace().map(str::to_string).collect(),
            use_shell: matches!(extension.as_deref(), Some("cmd" | "bat")),
        };
        info!(
            "running WiFi flash tool {} {}",
            invocation.program.display(),
            invocation.args.join(" ")
        );

        let mut process = run_guarded(
            &cancel,
            deadline,
            state,
            operation,
            budget,
            self.tools.spawn(&invocation),
        )
        .await??;

        let process_deadline = Instant::now() + self.options.wifi_process_timeout;
        let mut captured: Vec<String> = Vec::new();
        let mut exit_code: Option<i32> = None;
        loop {
            let event = run_guarded(
                &cancel,
                deadline,
                state,
                operation,
                budget,
                timeout_at(process_deadline, process.next_event()),
            )
            .await?;
            let event = match event {
                Ok(event) => event?,
                Err(_) => {
                    let _ = process.kill().await;
                    return Err(UpdateError::Timeout(format!(
                        "WiFi flash tool exceeded its {:.0} s budget",
                        self.options.wifi_process_timeout.as_secs_f64()
                    )));
                }
            };
            match event {
                ToolEvent::Stdout(line) => {
                    debug!("flash tool: {line}");
                    if let Some(percent) = scan_percent(&line).or_else(|| heuristic_percent(&line))
                    {
                        // Displayed progress never regresses, whatever the
                        // tool prints.
                        let display = (20.0 + percent * 0.70).max(self.last_percent);
                        self.report_progress(display);
                    }
                    if line.contains("Power cycle WINC and set to bootloader mode") {
                        process.write_stdin_line("").await?;
                    }
                    captured.push(line);
                }
                ToolEvent::Stderr(line) => {
                    warn!("flash tool: {line}");
                    captured.push(line);
                }
                ToolEvent::Exited(code) => {
                    exit_code = code;
                    break;
                }
            }
        }

        let reported_failure = captured
            .iter()
            .any(|line| line.to_ascii_lowercase().contains("programming device failed"));
        if reported_failure || exit_code != Some(0) {
            let excerpt: Vec<&str> = captured
                .iter()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(UpdateError::Io(std::io::Error::other(format!(
                "WiFi flash tool failed (exit code {exit_code:?}): {}",
                excerpt.join(" | ")
            ))));
        }
        Ok(())
    }

    async fn step_wifi_verify(&mut self) -> Result<(), UpdateError> {
        let state = UpdateState::Verifying;
        let operation = "Re-enabling WiFi";
        let cancel = self.cancel.clone();
        let budget = self.options.state_timeout(state);
        let deadline = Instant::now() + budget;

        let settle = Instant::now() + self.options.post_wifi_reconnect_delay;
        run_guarded(&cancel, deadline, state, operation, budget, sleep_until(settle)).await?;
        self.reconnect_device(state, operation, deadline, budget, true).await?;

        for command in [
            scpi::lan_enabled(true),
            scpi::lan_apply().to_string(),
            scpi::lan_save().to_string(),
        ] {
            run_guarded(
                &cancel,
                deadline,
                state,
                operation,
                budget,
                self.device.send_command(&command),
            )
            .await??;
        }
        Ok(())
    }
}

/// Resolve the flash tool: a file path is used directly, a directory is
/// searched recursively (first match in sorted order).
fn resolve_tool_path(firmware_path: &Path, tool_file_name: &str) -> Result<PathBuf, UpdateError> {
    let metadata = std::fs::metadata(firmware_path).map_err(|_| {
        UpdateError::NotFound(format!("firmware path {} does not exist", firmware_path.display()))
    })?;
    if metadata.is_file() {
        return Ok(firmware_path.to_path_buf());
    }
    if metadata.is_dir() {
        if let Some(path) = find_file_recursive(firmware_path, tool_file_name) {
            return Ok(path);
        }
        return Err(UpdateError::NotFound(format!(
            "{tool_file_name} not found under {}",
            firmware_path.display()
        )));
    }
    Err(UpdateError::NotFound(format!(
        "firmware path {} is neither a file nor a directory",
        firmware_path.display()
    )))
}

fn find_file_recursive(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    entries.sort_by_key(|entry| entry.file_name());
    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_file() && entry.file_name().to_str() == Some(file_name) {
            return Some(path);
        }
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    for subdir in subdirs {
        if let Some(path) = find_file_recursive(&subdir, file_name) {
            return Some(path);
        }
    }
    None
}

/// [`ToolRunner`] implementation over `tokio::process`.
pub struct TokioToolRunner;

pub struct TokioToolProcess {
    child: tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
    stdout: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStdout>>,
    stderr: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStderr>>,
    stdout_done: bool,
    stderr_done: bool,
}

impl ToolRunner for TokioToolRunner {
    type Process = TokioToolProcess;

    async fn spawn(&mut self, invocation: &ToolInvocation) -> std::io::Result<TokioToolProcess> {
        use std::process::Stdio;
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::process::Command;

        let mut command = if invocation.use_shell && cfg!(windows) {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(&invocation.program);
            command
        } else {
            Command::new(&invocation.program)
        };
        command
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("missing stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("missing stderr pipe"))?;
        let stdin = child.stdin.take();
        Ok(TokioToolProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
            stdout_done: false,
            stderr_done: false,
        })
    }
}

impl ToolProcess for TokioToolProcess {
    async fn next_event(&mut self) -> std::io::Result<ToolEvent> {
        loop {
            if self.stdout_done && self.stderr_done {
                let status = self.child.wait().await?;
                return Ok(ToolEvent::Exited(status.code()));
            }
            tokio::select! {
                line = self.stdout.next_line(), if !self.stdout_done => match line? {
                    Some(line) => return Ok(ToolEvent::Stdout(line)),
                    None => self.stdout_done = true,
                },
                line = self.stderr.next_line(), if !self.stderr_done => match line? {
                    Some(line) => return Ok(ToolEvent::Stderr(line)),
                    None => self.stderr_done = true,
                },
            }
        }
    }

    async fn write_stdin_line(&mut self, line: &str) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::other("tool stdin is closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use UpdateState::*;
        assert!(Idle.can_transition_to(PreparingDevice));
        assert!(Idle.can_transition_to(Failed));
        assert!(PreparingDevice.can_transition_to(Programming));
        assert!(Programming.can_transition_to(JumpingToApp));
        assert!(Verifying.can_transition_to(Complete));
        assert!(Complete.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Programming));
        assert!(!Complete.can_transition_to(PreparingDevice));
        assert!(!Programming.can_transition_to(ErasingFlash));
        assert!(!Failed.can_transition_to(Complete));
    }

    #[test]
    fn test_options_validation() {
        assert!(UpdateOptions::default().validate().is_ok());
        let options = UpdateOptions {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(UpdateError::InvalidArgument(_))
        ));
        let options = UpdateOptions {
            flash_write_retry_count: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_percent_scanning() {
        assert_eq!(scan_percent("progress: 45%"), Some(45.0));
        assert_eq!(scan_percent("progress: 45 %"), Some(45.0));
        assert_eq!(scan_percent("at 250% over"), Some(100.0));
        assert_eq!(scan_percent("no numbers here"), None);
        assert_eq!(heuristic_percent("Begin Write Operation..."), Some(33.0));
        assert_eq!(heuristic_percent("begin read operation"), Some(66.0));
        assert_eq!(heuristic_percent("BEGIN VERIFY OPERATION"), Some(90.0));
        assert_eq!(heuristic_percent("done"), None);
    }

    #[test]
    fn test_recovery_guidance_mapping() {
        assert!(recovery_guidance(UpdateState::WaitingForBootloader).contains("unplugging"));
        assert!(recovery_guidance(UpdateState::Programming).contains("power off"));
    }

    #[test]
    fn test_find_file_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("tools").join("winc");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("winc_flash_tool.cmd"), b"@echo off\n").unwrap();
        let found = find_file_recursive(dir.path(), "winc_flash_tool.cmd").unwrap();
        assert!(found.ends_with("tools/winc/winc_flash_tool.cmd"));
        assert!(find_file_recursive(dir.path(), "missing.cmd").is_none());
    }

    #[test]
    fn test_resolve_tool_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("firmware.bin");
        std::fs::write(&file, b"blob").unwrap();
        assert_eq!(
            resolve_tool_path(&file, "winc_flash_tool.cmd").unwrap(),
            file
        );
        assert!(matches!(
            resolve_tool_path(&dir.path().join("absent"), "x"),
            Err(UpdateError::NotFound(_))
        ));
        assert!(matches!(
            resolve_tool_path(dir.path(), "winc_flash_tool.cmd"),
            Err(UpdateError::NotFound(_))
        ));
    }
}
