use anyhow::{Context, Result};
use image::GenericImageView;
use std::path::Path;
use tracing::{debug, warn};

/// Logos bigger than this are scaled down before upload.
const MAX_LOGO_SIDE: u32 = 256;

/// Decoded logo, ready to hand to the renderer as RGBA pixels.
#[derive(Debug, Clone)]
pub struct Logo {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

fn decode(path: &Path) -> Result<Logo> {
    let mut img = image::open(path).context("Failed to open image")?;

    let (width, height) = img.dimensions();
    if width > MAX_LOGO_SIDE || height > MAX_LOGO_SIDE {
        debug!(width, height, "resizing logo");
        img = img.resize(MAX_LOGO_SIDE, MAX_LOGO_SIDE, image::imageops::FilterType::Lanczos3);
    }

    let rgba = img.to_rgba8();
    Ok(Logo {
        width: rgba.width(),
        height: rgba.height(),
        rgba: rgba.into_raw(),
    })
}

/// Missing or broken logos are not an error; the welcome panel just goes without.
pub fn load_logo(path: &Path) -> Option<Logo> {
    if !path.exists() {
        debug!(path = %path.display(), "no logo found");
        return None;
    }
    match decode(path) {
        Ok(logo) => Some(logo),
        Err(e) => {
            warn!(path = %path.display(), "could not load logo: {:#}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_logo_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_logo(&dir.path().join("logo.png")).is_none());
    }

    #[test]
    fn test_garbage_logo_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(load_logo(&path).is_none());
    }

    #[test]
    fn test_large_logo_is_scaled_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        image::RgbaImage::from_pixel(512, 128, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let logo = load_logo(&path).unwrap();
        assert_eq!((logo.width, logo.height), (256, 64));
        assert_eq!(logo.rgba.len(), (256 * 64 * 4) as usize);
    }
}
