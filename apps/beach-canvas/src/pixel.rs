use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2])
    }
}

/// A validated write: coordinates are known to lie inside the canvas that accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Pixel {
    pub x: u16,
    pub y: u16,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Pixel {
    pub const fn new(x: u16, y: u16, color: Rgb) -> Self {
        Self {
            x,
            y,
            r: color.r,
            g: color.g,
            b: color.b,
        }
    }

    pub fn color(&self) -> Rgb {
        Rgb::new(self.r, self.g, self.b)
    }
}

/// Untrusted draw message as sent by clients.
///
/// Coordinates are decoded as wide signed integers so that negative or oversized values
/// surface as out-of-bounds rejections instead of decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRequest {
    pub x: i64,
    pub y: i64,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl DrawRequest {
    pub fn color(&self) -> Rgb {
        Rgb::new(self.r, self.g, self.b)
    }
}

impl From<Pixel> for DrawRequest {
    fn from(pixel: Pixel) -> Self {
        Self {
            x: pixel.x as i64,
            y: pixel.y as i64,
            r: pixel.r,
            g: pixel.g,
            b: pixel.b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn draw_request_accepts_negative_coordinates() {
        let request: DrawRequest =
            serde_json::from_str(r#"{"x":-4,"y":70000,"r":1,"g":2,"b":3}"#).expect("decode");
        assert_eq!(request.x, -4);
        assert_eq!(request.y, 70000);
        assert_eq!(request.color(), Rgb::new(1, 2, 3));
    }

    #[test_timeout::timeout]
    fn draw_request_rejects_color_overflow() {
        let result = serde_json::from_str::<DrawRequest>(r#"{"x":0,"y":0,"r":256,"g":0,"b":0}"#);
        assert!(result.is_err());
    }
}
