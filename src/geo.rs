//! Geographic helpers: bounding boxes and angle notations.

use crate::error::Error;

/// Bounding box in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub left: f64,
    pub south: f64,
    pub right: f64,
    pub north: f64,
}

impl BBox {
    /// Validated bounding box.
    ///
    /// `left > right` is accepted: the box crosses the antimeridian.
    pub fn new(left: f64, south: f64, right: f64, north: f64) -> Result<Self, Error> {
        let values = [left, south, right, north];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidBBox("coordinates must be finite".into()));
        }
        for lat in [south, north] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(Error::InvalidBBox(format!("latitude {} out of range", lat)));
            }
        }
        for lon in [left, right] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(Error::InvalidBBox(format!("longitude {} out of range", lon)));
            }
        }
        if south > north {
            return Err(Error::InvalidBBox(format!(
                "south ({}) is greater than north ({})",
                south, north
            )));
        }
        Ok(Self {
            left,
            south,
            right,
            north,
        })
    }

    pub fn crosses_antimeridian(&self) -> bool {
        self.left > self.right
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        if lat < self.south || lat > self.north {
            return false;
        }
        if self.crosses_antimeridian() {
            lon >= self.left || lon <= self.right
        } else {
            lon >= self.left && lon <= self.right
        }
    }
}

/// Angle in degrees, minutes and seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dms {
    pub negative: bool,
    pub degrees: u32,
    pub minutes: u32,
    pub seconds: f64,
}

impl Dms {
    pub fn from_degrees(value: f64) -> Self {
        let total = value.abs() * 3600.0;
        let minutes = total.div_euclid(60.0);
        let seconds = total.rem_euclid(60.0);
        let degrees = minutes.div_euclid(60.0);
        let minutes = minutes.rem_euclid(60.0);
        Self {
            negative: value < 0.0,
            degrees: degrees as u32,
            minutes: minutes as u32,
            seconds,
        }
    }

    pub fn to_degrees(&self) -> f64 {
        let v = self.degrees as f64 + self.minutes as f64 / 60.0 + self.seconds / 3600.0;
        if self.negative { -v } else { v }
    }
}

/// Decimal degrees to signed `(degrees, minutes, seconds)`.
///
/// The sign is carried by the degrees, so it is lost for angles between
/// -1 and 0; use [`Dms`] when that matters.
pub fn deg2dms(value: f64) -> (i32, u32, f64) {
    let dms = Dms::from_degrees(value);
    let degrees = dms.degrees as i32;
    (
        if dms.negative { -degrees } else { degrees },
        dms.minutes,
        dms.seconds,
    )
}

/// Signed `(degrees, minutes, seconds)` to decimal degrees; the sign of
/// `deg` applies to the whole angle.
pub fn dms2deg(deg: i32, minutes: u32, seconds: f64) -> f64 {
    Dms {
        negative: deg < 0,
        degrees: deg.unsigned_abs(),
        minutes,
        seconds,
    }
    .to_degrees()
}
