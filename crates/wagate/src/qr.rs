//! QR artifact rendering.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use thiserror::Error;

/// Minimum edge of the rendered bitmap, in pixels.
const QR_MIN_SIZE: u32 = 300;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("qr encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("png encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

/// Render `payload` as a PNG QR code (error correction M, quiet zone on).
pub fn render_png(payload: &str) -> Result<Vec<u8>, QrError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::M)?;
    let bitmap = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .quiet_zone(true)
        .build();

    let mut png = Vec::new();
    bitmap.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

/// Render `payload` and return the PNG as standard base64, without a data-URL prefix.
pub fn render_base64(payload: &str) -> Result<String, QrError> {
    Ok(STANDARD.encode(render_png(payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    #[test]
    fn renders_png_at_least_min_size() {
        let png = render_png("2@abc,def,ghi,jkl").unwrap();
        assert_eq!(&png[..8], &PNG_SIGNATURE);

        let img = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert!(img.width() >= QR_MIN_SIZE);
        assert_eq!(img.width(), img.height());
    }

    #[test]
    fn base64_is_deterministic() {
        let a = render_base64("https://wa.me/5511999999999").unwrap();
        let b = render_base64("https://wa.me/5511999999999").unwrap();
        assert_eq!(a, b);
        assert!(!a.starts_with("data:"));

        let decoded = STANDARD.decode(&a).unwrap();
        assert_eq!(&decoded[..8], &PNG_SIGNATURE);
    }

    #[test]
    fn oversized_payload_is_an_error() {
        let payload = "x".repeat(8_000);
        assert!(matches!(render_base64(&payload), Err(QrError::Encode(_))));
    }
}
