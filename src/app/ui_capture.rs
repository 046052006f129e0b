use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

pub fn decode_png_base64(encoded: &str) -> Result<Vec<u8>, String> {
    let compact: String = encoded.chars().filter(|ch| !ch.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| format!("Screenshot data is not valid base64: {err}"))?;
    if bytes.len() < PNG_SIGNATURE.len() {
        return Err("Screenshot data is empty".to_string());
    }
    if !bytes.starts_with(PNG_SIGNATURE) {
        return Err("Screenshot data is not a PNG".to_string());
    }
    Ok(bytes)
}

pub fn write_png_base64(encoded: &str, path: &Path) -> Result<u64, String> {
    let bytes = decode_png_base64(encoded)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create screenshot dir: {err}"))?;
    }
    fs::write(path, &bytes).map_err(|err| format!("Failed to write screenshot: {err}"))?;
    Ok(bytes.len() as u64)
}
