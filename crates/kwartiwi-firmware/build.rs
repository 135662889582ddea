//! Forwards first-boot provisioning values from `.env` into the build.
//!
//! Each variable is optional. Values already set in the environment win over
//! the file.

const PROVISIONED_VARS: [&str; 5] = [
    "KWARTIWI_WIFI_SSID",
    "KWARTIWI_WIFI_PASSWORD",
    "KWARTIWI_HOSTNAME",
    "KWARTIWI_MDNS_INSTANCE",
    "KWARTIWI_SERVER_HOST",
];

fn main() {
    println!("cargo:rustc-link-arg=-Tlinkall.x");

    if let Ok(path) = dotenvy::dotenv() {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    for var in PROVISIONED_VARS {
        println!("cargo:rerun-if-env-changed={var}");
        if let Ok(value) = std::env::var(var) {
            println!("cargo:rustc-env={var}={value}");
        }
    }
}
