use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Four-character pixel encoding code (e.g., `YUYV`, `MJPG`, `GREY`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUV 4:2:2 packed, Y0 U Y1 V.
    pub const YUYV: Self = Self::new(b"YUYV");
    /// YUV 4:2:2 packed, U Y0 V Y1.
    pub const UYVY: Self = Self::new(b"UYVY");
    pub const MJPG: Self = Self::new(b"MJPG");
    /// 8-bit greyscale, the native output of monochrome sensors.
    pub const GREY: Self = Self::new(b"GREY");
    /// 16-bit little-endian greyscale.
    pub const Y16: Self = Self::new(b"Y16 ");
    pub const RGB3: Self = Self::new(b"RGB3");
    pub const BGR3: Self = Self::new(b"BGR3");
    pub const NV12: Self = Self::new(b"NV12");

    /// Bytes per pixel for packed single-plane encodings; `None` for planar or compressed ones.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match *self {
            Self::GREY => Some(1),
            Self::YUYV | Self::UYVY | Self::Y16 => Some(2),
            Self::RGB3 | Self::BGR3 => Some(3),
            _ => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self == Self::MJPG
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: String = self
            .0
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        f.write_str(text.trim_end())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl FromStr for FourCc {
    type Err = String;

    /// Codes shorter than four characters are space padded, as in `"Y16"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return Err(format!("invalid fourcc {s:?}: expected 1 to 4 ASCII characters"));
        }
        let mut code = [b' '; 4];
        code[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(code))
    }
}

impl TryFrom<String> for FourCc {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FourCc> for String {
    fn from(fourcc: FourCc) -> Self {
        fourcc.to_string()
    }
}

impl From<v4l::FourCC> for FourCc {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCc> for v4l::FourCC {
    fn from(fourcc: FourCc) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Negotiated capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    /// Bytes per line as reported by the driver; may exceed `width * bytes_per_pixel`.
    pub stride: u32,
    /// Size of one image in bytes.
    pub size: u32,
}

impl Format {
    /// Packed format with no row padding.
    pub fn packed(width: u32, height: u32, fourcc: FourCc) -> Self {
        let stride = width * fourcc.bytes_per_pixel().unwrap_or(1);
        Self {
            width,
            height,
            fourcc,
            stride,
            size: stride * height,
        }
    }

    /// Bytes a tightly packed image would occupy, when the encoding allows computing it.
    pub fn packed_size(&self) -> Option<usize> {
        self.fourcc
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp as usize)
    }

    /// Byte range of row `y` within an image buffer, excluding stride padding.
    pub fn row_range(&self, y: u32) -> Option<std::ops::Range<usize>> {
        if y >= self.height || self.fourcc.is_compressed() {
            return None;
        }
        let bpp = self.fourcc.bytes_per_pixel()?;
        let start = y as usize * self.stride as usize;
        Some(start..start + (self.width * bpp) as usize)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} (stride {}, {} bytes)",
            self.width, self.height, self.fourcc, self.stride, self.size
        )
    }
}

impl From<&v4l::Format> for Format {
    fn from(fmt: &v4l::Format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc.into(),
            stride: fmt.stride,
            size: fmt.size,
        }
    }
}

/// What the caller asks for at open time; `None` leaves the driver's current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fourcc: Option<FourCc>,
}

impl FormatRequest {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.fourcc.is_none()
    }

    /// Apply the requested fields on top of the driver's current format.
    pub fn apply(&self, current: &Format) -> Format {
        Format {
            width: self.width.unwrap_or(current.width),
            height: self.height.unwrap_or(current.height),
            fourcc: self.fourcc.unwrap_or(current.fourcc),
            ..*current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_parse_and_display() {
        assert_eq!("YUYV".parse::<FourCc>(), Ok(FourCc::YUYV));
        assert_eq!("Y16".parse::<FourCc>(), Ok(FourCc::Y16));
        assert_eq!(FourCc::Y16.to_string(), "Y16");
        assert_eq!(FourCc::MJPG.to_string(), "MJPG");
        assert!("TOOLONG".parse::<FourCc>().is_err());
        assert!("".parse::<FourCc>().is_err());
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(FourCc::GREY.bytes_per_pixel(), Some(1));
        assert_eq!(FourCc::YUYV.bytes_per_pixel(), Some(2));
        assert_eq!(FourCc::RGB3.bytes_per_pixel(), Some(3));
        assert_eq!(FourCc::MJPG.bytes_per_pixel(), None);
        assert_eq!(FourCc::NV12.bytes_per_pixel(), None);
    }

    #[test]
    fn test_row_range_honours_stride() {
        let format = Format {
            width: 10,
            height: 4,
            fourcc: FourCc::YUYV,
            stride: 32,
            size: 128,
        };
        assert_eq!(format.row_range(0), Some(0..20));
        assert_eq!(format.row_range(3), Some(96..116));
        assert_eq!(format.row_range(4), None);
        assert_eq!(format.packed_size(), Some(80));
    }

    #[test]
    fn test_request_apply() {
        let current = Format::packed(640, 480, FourCc::YUYV);
        let request = FormatRequest {
            width: Some(1280),
            height: None,
            fourcc: Some(FourCc::GREY),
        };
        let desired = request.apply(&current);
        assert_eq!(desired.width, 1280);
        assert_eq!(desired.height, 480);
        assert_eq!(desired.fourcc, FourCc::GREY);
        assert!(FormatRequest::default().is_empty());
    }
}
