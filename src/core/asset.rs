use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogoFormat {
    Png,
    Jpeg,
    Ico,
    WebP,
    Gif,
    Bmp,
    Svg,
}

impl LogoFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "ico" => Some(Self::Ico),
            "webp" => Some(Self::WebP),
            "gif" => Some(Self::Gif),
            "bmp" => Some(Self::Bmp),
            "svg" => Some(Self::Svg),
            _ => None,
        }
    }

    /// Sniff the format from the leading bytes of a file.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes) {
            Ok(ImageFormat::Png) => Some(Self::Png),
            Ok(ImageFormat::Jpeg) => Some(Self::Jpeg),
            Ok(ImageFormat::Ico) => Some(Self::Ico),
            Ok(ImageFormat::WebP) => Some(Self::WebP),
            Ok(ImageFormat::Gif) => Some(Self::Gif),
            Ok(ImageFormat::Bmp) => Some(Self::Bmp),
            _ => {
                let head = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]).to_lowercase();
                head.contains("<svg").then_some(Self::Svg)
            }
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Ico => "ico",
            Self::WebP => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Svg => "svg",
        }
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Self::Svg)
    }

    /// Decoder hint for the `image` crate; vector formats have none.
    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            Self::Png => Some(ImageFormat::Png),
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Ico => Some(ImageFormat::Ico),
            Self::WebP => Some(ImageFormat::WebP),
            Self::Gif => Some(ImageFormat::Gif),
            Self::Bmp => Some(ImageFormat::Bmp),
            Self::Svg => None,
        }
    }
}

/// A fetched logo file, identified by the domain it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoAsset {
    pub domain: String,
    pub path: PathBuf,
    pub format: LogoFormat,
    pub size_bytes: u64,
}

impl LogoAsset {
    /// Describe an existing logo file. The domain is the file name without
    /// its final extension (`acme.com.png` -> `acme.com`).
    pub fn from_path(path: &Path) -> std::io::Result<Option<Self>> {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Ok(None);
        };
        let Some(format) = LogoFormat::from_extension(ext) else {
            return Ok(None);
        };
        let size_bytes = fs::metadata(path)?.len();
        Ok(Some(Self {
            domain: domain_from_path(path),
            path: path.to_path_buf(),
            format,
            size_bytes,
        }))
    }
}

/// A logo re-rendered onto the run's fixed transparent canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedImage {
    pub domain: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

pub fn domain_from_path(path: &Path) -> String {
    path.file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(LogoFormat::from_extension("JPEG"), Some(LogoFormat::Jpeg));
        assert_eq!(LogoFormat::from_extension("svg"), Some(LogoFormat::Svg));
        assert_eq!(LogoFormat::from_extension("tiff"), None);
        assert!(LogoFormat::Svg.is_vector());
        assert!(!LogoFormat::Png.is_vector());
    }

    #[test]
    fn test_sniff_png_and_svg() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(LogoFormat::sniff(&png_magic), Some(LogoFormat::Png));

        let svg = br#"<?xml version="1.0"?><svg xmlns="http://www.w3.org/2000/svg"></svg>"#;
        assert_eq!(LogoFormat::sniff(svg), Some(LogoFormat::Svg));

        assert_eq!(LogoFormat::sniff(b"<html>nope</html>"), None);
    }

    #[test]
    fn test_asset_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("acme.com.png");
        fs::write(&path, b"12345").unwrap();

        let asset = LogoAsset::from_path(&path).unwrap().unwrap();
        assert_eq!(asset.domain, "acme.com");
        assert_eq!(asset.format, LogoFormat::Png);
        assert_eq!(asset.size_bytes, 5);

        let other = temp_dir.path().join("notes.txt");
        fs::write(&other, b"x").unwrap();
        assert!(LogoAsset::from_path(&other).unwrap().is_none());
    }
}
