//! Version information for the sockws library

/// Current version of the sockws library
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Platform information (OS/architecture)
pub fn platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}/{}", os, std::env::consts::ARCH)
}
