//! Viewer camera pose.

use std::fmt;
use std::str::FromStr;

use crate::error::{ParseErrorKind, StreamError};

/// Where a viewer is looking: position and rotation on three axes.
///
/// Sent by the viewer as six comma-separated floats,
/// `x,y,z,rot_x,rot_y,rot_z`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PanZoom {
    pub position: [f32; 3],
    pub rotation: [f32; 3],
}

impl FromStr for PanZoom {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::Parse {
            kind: ParseErrorKind::InvalidPayload,
        };
        let mut values = [0f32; 6];
        let mut fields = s.trim().split(',');
        for value in &mut values {
            let field = fields.next().ok_or_else(invalid)?;
            *value = field.trim().parse::<f32>().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
        }
        if fields.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            position: [values[0], values[1], values[2]],
            rotation: [values[3], values[4], values[5]],
        })
    }
}

impl fmt::Display for PanZoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.position;
        let [rx, ry, rz] = self.rotation;
        write!(f, "{x},{y},{z},{rx},{ry},{rz}")
    }
}
