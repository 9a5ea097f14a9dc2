use std::fs;
use std::path::Path;

/// Emit a rustc env var from a `#define NAME "value"` line, falling back to a
/// default when the header or the define is missing.
fn emit_define(contents: Option<&str>, define: &str, env_name: &str, default: &str) {
    let value = contents
        .and_then(|c| {
            c.lines()
                .find(|l| l.contains(&format!("#define {}", define)))
                .and_then(|l| l.split('"').nth(1))
                .map(str::to_owned)
        })
        .unwrap_or_else(|| default.to_owned());
    println!("cargo:rustc-env={}={}", env_name, value);
}

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // WiFi credentials live in wifi_config.h which should NOT be committed
    let wifi_contents = if Path::new("wifi_config.h").exists() {
        Some(fs::read_to_string("wifi_config.h")?)
    } else {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example and add your credentials.");
        None
    };
    emit_define(wifi_contents.as_deref(), "WIFI_SSID", "WIFI_SSID", "");
    emit_define(wifi_contents.as_deref(), "WIFI_PASSWORD", "WIFI_PASSWORD", "");

    // Smart-home server and entity bindings, same pattern
    let smart_contents = if Path::new("smart_config.h").exists() {
        Some(fs::read_to_string("smart_config.h")?)
    } else {
        println!("cargo:warning=smart_config.h not found! Copy smart_config.h.example to control real entities.");
        None
    };
    let smart = smart_contents.as_deref();
    emit_define(smart, "HA_SERVER_HOST", "HA_SERVER_HOST", "192.168.50.193");
    emit_define(smart, "HA_SERVER_PORT", "HA_SERVER_PORT", "8123");
    emit_define(smart, "HA_API_TOKEN", "HA_API_TOKEN", "");
    emit_define(smart, "HA_ENTITY_A", "HA_ENTITY_A", "switch.water_pump_socket");
    emit_define(smart, "HA_ENTITY_B", "HA_ENTITY_B", "switch.wave_maker_socket");
    emit_define(smart, "HA_ENTITY_C", "HA_ENTITY_C", "switch.light_switch_socket");
    emit_define(smart, "HA_ENTITY_D", "HA_ENTITY_D", "scene.feeding_mode");

    // Rebuild when either header changes
    println!("cargo:rerun-if-changed=wifi_config.h");
    println!("cargo:rerun-if-changed=smart_config.h");

    Ok(())
}
