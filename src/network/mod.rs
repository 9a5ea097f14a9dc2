pub mod wifi;

/// Station association precheck. REST requests short-circuit when the radio
/// has no AP, without touching the wire.
pub fn is_associated() -> bool {
    let mut ap_info: esp_idf_sys::wifi_ap_record_t = unsafe { std::mem::zeroed() };
    unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut ap_info) == esp_idf_sys::ESP_OK }
}
