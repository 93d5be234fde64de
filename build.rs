use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // SOURCE_DATE_EPOCH wins so packaged builds stay reproducible.
    let build_time = env::var("SOURCE_DATE_EPOCH")
        .map(|sde| format!("epoch:{}", sde.trim()))
        .unwrap_or_else(|_| {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            format!("epoch:{secs}")
        });

    let build_host = env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            let out = Command::new("hostname").output().ok()?;
            if !out.status.success() {
                return None;
            }
            let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=CONTROLFREAK_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=CONTROLFREAK_BUILD_HOST={build_host}");
}
