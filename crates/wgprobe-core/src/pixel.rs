//! Per-invocation record written by the compute shader, and its CSV dump.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::dispatch::DispatchExtents;
use crate::error::{ProbeError, Result};

/// Fixed file name of the per-invocation dump.
pub const DATA_CSV_PATH: &str = "data.csv";

const DATA_CSV_HEADER: &str = "z:int,GIID.z:int,y:int,GIID.y:int,x:int,GIID.x:int,\
WGID.z:int,NumWG.z:int,WGID.y:int,NumWG.y:int,WGID.x:int,NumWG.x:int,\
LIID.z:int,WGS.z:int,LIID.y:int,WGS.y:int,LIID.x:int,WGS.x:int,\
LIIndex:int,SGID:int,NumSG:int,SGIID:int,SGS:int,\
rFloat:string,rChar:int,gFloat:string,gChar:int,bFloat:string,bChar:int,aFloat:string,aChar:int";

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UVec4 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
}

impl UVec4 {
    pub const fn new(x: u32, y: u32, z: u32, w: u32) -> Self {
        Self { x, y, z, w }
    }
}

/// Matches the shader's std430 `Pixel` struct.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Pixel {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
    pub num_work_groups: UVec4,
    pub work_group_size: UVec4,
    pub work_group_id: UVec4,
    pub local_invocation_id: UVec4,
    pub global_invocation_id: UVec4,
    pub local_invocation_index: UVec4,
    /// x: subgroup id, y: invocation id in subgroup, z: subgroup size,
    /// w: number of subgroups.
    pub subgroup: UVec4,
}

pub const PIXEL_SIZE: usize = size_of::<Pixel>();

const _: () = assert!(PIXEL_SIZE == 128);

/// Size in bytes of the output buffer for `extents`.
pub fn output_buffer_size(extents: &DispatchExtents) -> Result<usize> {
    extents
        .checked_invocation_count()
        .and_then(|n| n.checked_mul(PIXEL_SIZE))
        .ok_or_else(|| {
            ProbeError::InvalidDimensions(format!(
                "output buffer for {}x{}x{} invocations overflows",
                extents.width, extents.height, extents.depth
            ))
        })
}

/// Host read-back of the kernel's output buffer.
///
/// Only valid after the dispatch has completed.
pub trait OutputReadback {
    fn read_output(&mut self) -> Result<Vec<Pixel>>;
}

/// Decode `count` records from raw buffer bytes. No alignment is assumed.
pub fn decode_pixels(bytes: &[u8], count: usize) -> Result<Vec<Pixel>> {
    let Some(expected) = count.checked_mul(PIXEL_SIZE) else {
        return Err(ProbeError::ResultOutOfBounds {
            offset: 0,
            size: usize::MAX,
            len: bytes.len(),
        });
    };
    if bytes.len() < expected {
        return Err(ProbeError::ResultOutOfBounds {
            offset: 0,
            size: expected,
            len: bytes.len(),
        });
    }
    Ok(bytes[..expected]
        .chunks_exact(PIXEL_SIZE)
        .map(bytemuck::pod_read_unaligned::<Pixel>)
        .collect())
}

fn channel_char(value: f32) -> u8 {
    (255.0 * value) as u8
}

/// Write one CSV row per invocation in linear order.
pub fn write_data_csv<W: Write>(out: &mut W, pixels: &[Pixel], extents: &DispatchExtents) -> Result<()> {
    let plane = extents.width as usize * extents.height as usize;
    let width = extents.width as usize;
    writeln!(out, "{DATA_CSV_HEADER}")?;
    for (i, p) in pixels.iter().enumerate().take(extents.invocation_count()) {
        let z = i / plane;
        let y = (i % plane) / width;
        let x = (i % plane) % width;
        write!(
            out,
            "{z},{},{y},{},{x},{},",
            p.global_invocation_id.z, p.global_invocation_id.y, p.global_invocation_id.x
        )?;
        write!(
            out,
            "{},{},{},{},{},{},",
            p.work_group_id.z,
            p.num_work_groups.z,
            p.work_group_id.y,
            p.num_work_groups.y,
            p.work_group_id.x,
            p.num_work_groups.x
        )?;
        write!(
            out,
            "{},{},{},{},{},{},{},",
            p.local_invocation_id.z,
            p.work_group_size.z,
            p.local_invocation_id.y,
            p.work_group_size.y,
            p.local_invocation_id.x,
            p.work_group_size.x,
            p.local_invocation_index.x
        )?;
        write!(
            out,
            "{},{},{},{},",
            p.subgroup.x, p.subgroup.w, p.subgroup.y, p.subgroup.z
        )?;
        writeln!(
            out,
            "{:.6},{},{:.6},{},{:.6},{},{:.6},{}",
            p.r,
            channel_char(p.r),
            p.g,
            channel_char(p.g),
            p.b,
            channel_char(p.b),
            p.a,
            channel_char(p.a)
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Write the dump to `path`, replacing any previous file.
pub fn save_data_csv(path: &Path, pixels: &[Pixel], extents: &DispatchExtents) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_data_csv(&mut out, pixels, extents)
}
