//! SCPI command strings understood by the device. Only string production
//! lives here; the transport appends the CRLF terminator.

pub fn force_boot() -> &'static str {
    "SYSTem:FORceBoot"
}

pub fn lan_firmware_update() -> &'static str {
    "SYSTem:COMMUnicate:LAN:FWUpdate"
}

pub fn lan_enabled(enabled: bool) -> String {
    format!("SYSTem:COMMunicate:LAN:ENAbled {}", u8::from(enabled))
}

pub fn lan_apply() -> &'static str {
    "SYSTem:COMMunicate:LAN:APPLY"
}

pub fn lan_save() -> &'static str {
    "SYSTem:COMMunicate:LAN:SAVE"
}

pub fn sd_enable(enabled: bool) -> String {
    format!("SYSTem:STORage:SD:ENAble {}", u8::from(enabled))
}

pub fn sd_list() -> &'static str {
    "SYSTem:STORage:SD:LIST?"
}

pub fn sd_logging(file_name: &str) -> String {
    format!("SYSTem:STORage:SD:LOGging \"{file_name}\"")
}

pub fn sd_get(file_name: &str) -> String {
    format!("SYSTem:STORage:SD:GET \"{file_name}\"")
}

pub fn sd_delete(file_name: &str) -> String {
    format!("SYSTem:STORage:SD:DELete \"{file_name}\"")
}

pub fn sd_format() -> &'static str {
    "SYSTem:STORage:SD:FORmat"
}

pub fn stream_format(mode: u8) -> String {
    format!("SYSTem:STReam:FORmat {mode}")
}

pub fn start_stream_data(frequency: u32) -> String {
    format!("SYSTem:StartStreamData {frequency}")
}

pub fn stop_stream_data() -> &'static str {
    "SYSTem:StopStreamData"
}
