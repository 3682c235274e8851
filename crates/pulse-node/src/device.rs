//! Describes this host in the `ClientHello` a producer sends to viewers.

use pulse_protocol::{AppInfo, ClientHello, DeviceInfo};
use uuid::Uuid;

pub fn client_hello(device_id: Uuid, app_info: AppInfo) -> ClientHello {
    ClientHello {
        device_id,
        device_info: device_info(),
        app_info,
    }
}

pub fn device_info() -> DeviceInfo {
    DeviceInfo {
        name: host_name(),
        model: Some(std::env::consts::ARCH.to_string()),
        system_name: std::env::consts::OS.to_string(),
        system_version: system_version(),
        locale: std::env::var("LANG")
            .ok()
            .map(|lang| lang.split('.').next().unwrap_or_default().to_string())
            .filter(|lang| !lang.is_empty()),
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| read_trimmed("/etc/hostname"))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".into())
}

fn system_version() -> String {
    read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_else(|| "unknown".into())
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}
