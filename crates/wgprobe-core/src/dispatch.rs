//! Dispatch geometry.

use serde::Serialize;

use crate::error::{ProbeError, Result};
use crate::pixel::PIXEL_SIZE;

/// Logical size of the index space, in invocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchExtents {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl DispatchExtents {
    /// `None` when the product does not fit in `usize`.
    pub fn checked_invocation_count(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.depth as usize)
    }

    /// Saturates at `usize::MAX`; extents inside a [`DispatchGeometry`] never do.
    pub fn invocation_count(&self) -> usize {
        self.checked_invocation_count().unwrap_or(usize::MAX)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Validated extents plus work-group size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchGeometry {
    pub extents: DispatchExtents,
    pub workgroup: WorkgroupSize,
}

impl DispatchGeometry {
    pub fn new(extents: DispatchExtents, workgroup: WorkgroupSize) -> Result<Self> {
        let axes = [
            ("width", extents.width),
            ("height", extents.height),
            ("depth", extents.depth),
            ("workgroup x", workgroup.x),
            ("workgroup y", workgroup.y),
            ("workgroup z", workgroup.z),
        ];
        if let Some((axis, _)) = axes.iter().find(|(_, v)| *v == 0) {
            return Err(ProbeError::InvalidDimensions(format!("{axis} must be non-zero")));
        }
        // The output buffer holds one record per invocation.
        if extents
            .checked_invocation_count()
            .and_then(|n| n.checked_mul(PIXEL_SIZE))
            .is_none()
        {
            return Err(ProbeError::InvalidDimensions(format!(
                "{}x{}x{} invocations overflow the output buffer size",
                extents.width, extents.height, extents.depth
            )));
        }
        Ok(Self { extents, workgroup })
    }

    /// Work-groups per axis, rounding partial groups up.
    pub fn num_groups(&self) -> [u32; 3] {
        [
            self.extents.width.div_ceil(self.workgroup.x),
            self.extents.height.div_ceil(self.workgroup.y),
            self.extents.depth.div_ceil(self.workgroup.z),
        ]
    }

    pub fn invocation_count(&self) -> usize {
        self.extents.invocation_count()
    }
}
