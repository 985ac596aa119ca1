//! Capture an [`EnvironmentSnapshot`] from a live page.

use crate::features::baseline::EnvironmentSnapshot;
use anyhow::{anyhow, Context, Result};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use tracing::debug;

/// Fonts probed with `document.fonts.check`; the page cannot enumerate them.
pub const PROBE_FONTS: &[&str] = &[
    "Arial",
    "Helvetica",
    "Times New Roman",
    "Courier New",
    "Segoe UI",
    "Roboto",
    "Noto Sans",
    "PingFang SC",
    "Microsoft YaHei",
    "DejaVu Sans",
    "Liberation Sans",
];

const PROBE_PERMISSIONS: &[&str] = &["notifications", "geolocation", "camera", "microphone"];

const PROBE_SENSORS: &[&str] = &[
    "Accelerometer",
    "Gyroscope",
    "Magnetometer",
    "AmbientLightSensor",
    "DeviceOrientationEvent",
    "DeviceMotionEvent",
];

fn probe_script() -> Result<String> {
    let fonts = serde_json::to_string(PROBE_FONTS)?;
    let permissions = serde_json::to_string(PROBE_PERMISSIONS)?;
    let sensors = serde_json::to_string(PROBE_SENSORS)?;
    Ok(format!(
        r#"(async () => {{
  const out = {{}};
  const nav = navigator;
  out.user_agent = nav.userAgent;
  out.webdriver = !!nav.webdriver;
  out.platform = nav.platform;
  try {{ out.timezone = Intl.DateTimeFormat().resolvedOptions().timeZone; }} catch (e) {{}}
  out.languages = Array.from(nav.languages || []);
  try {{
    const gl = document.createElement('canvas').getContext('webgl');
    const info = gl && gl.getExtension('WEBGL_debug_renderer_info');
    if (info) {{
      out.webgl_vendor = gl.getParameter(info.UNMASKED_VENDOR_WEBGL);
      out.webgl_renderer = gl.getParameter(info.UNMASKED_RENDERER_WEBGL);
    }}
  }} catch (e) {{}}
  out.device_pixel_ratio = window.devicePixelRatio;
  out.hardware_concurrency = nav.hardwareConcurrency;
  out.cookies_enabled = nav.cookieEnabled;
  try {{ out.local_storage_keys = localStorage.length; }} catch (e) {{}}
  try {{ out.session_storage_keys = sessionStorage.length; }} catch (e) {{}}
  out.fonts = [];
  if (document.fonts && document.fonts.check) {{
    for (const f of {fonts}) {{
      try {{ if (document.fonts.check('12px "' + f + '"')) out.fonts.push(f); }} catch (e) {{}}
    }}
  }}
  out.permissions = {{}};
  if (nav.permissions && nav.permissions.query) {{
    for (const name of {permissions}) {{
      try {{ out.permissions[name] = (await nav.permissions.query({{ name }})).state; }} catch (e) {{}}
    }}
  }}
  out.media_devices = {{}};
  try {{
    const devices = await nav.mediaDevices.enumerateDevices();
    const count = (kind) => devices.filter((d) => d.kind === kind).length;
    out.media_devices = {{
      audio_inputs: count('audioinput'),
      audio_outputs: count('audiooutput'),
      video_inputs: count('videoinput'),
    }};
  }} catch (e) {{}}
  out.sensors = {{}};
  for (const s of {sensors}) out.sensors[s] = (s in window);
  return JSON.stringify(out);
}})()"#
    ))
}

/// Decode the probe's JSON payload; unknown fields are ignored.
pub fn parse_probe_payload(raw: &str) -> Result<EnvironmentSnapshot> {
    serde_json::from_str(raw).context("decode environment probe payload")
}

pub async fn capture_snapshot(page: &Page) -> Result<EnvironmentSnapshot> {
    let params = EvaluateParams::builder()
        .expression(probe_script()?)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(|e| anyhow!("build probe params: {}", e))?;
    let raw = page
        .evaluate_expression(params)
        .await
        .map_err(|e| anyhow!("environment probe failed: {}", e))?
        .into_value::<String>()
        .map_err(|e| anyhow!("environment probe returned non-string: {}", e))?;
    debug!("baseline: probe payload {} bytes", raw.len());
    parse_probe_payload(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_payload_with_partial_fields() {
        let raw = r#"{
            "user_agent": "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/126.0",
            "webdriver": false,
            "platform": "Win32",
            "languages": ["zh-CN", "en"],
            "device_pixel_ratio": 1.25,
            "fonts": ["Arial", "Microsoft YaHei"],
            "permissions": {"notifications": "prompt"},
            "media_devices": {"audio_inputs": 1, "audio_outputs": 2, "video_inputs": 0},
            "sensors": {"Accelerometer": false},
            "extra_field": 42
        }"#;
        let snap = parse_probe_payload(raw).unwrap();
        assert_eq!(snap.webdriver, Some(false));
        assert_eq!(snap.platform.as_deref(), Some("Win32"));
        assert_eq!(snap.languages, vec!["zh-CN", "en"]);
        assert_eq!(snap.media_devices.audio_outputs, Some(2));
        assert_eq!(snap.permissions.get("notifications").map(String::as_str), Some("prompt"));
        assert!(snap.timezone.is_none());
    }

    #[test]
    fn rejects_non_json_payload() {
        assert!(parse_probe_payload("undefined").is_err());
    }

    #[test]
    fn probe_script_embeds_candidate_lists() {
        let script = probe_script().unwrap();
        assert!(script.contains("\"Microsoft YaHei\""));
        assert!(script.contains("\"geolocation\""));
        assert!(script.starts_with("(async () => {"));
    }
}
