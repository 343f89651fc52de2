//! Wire format of the messages exchanged between a partition task and its parent.
//!
//! Every frame starts with the schema version and a message tag (one byte each). Integers are
//! little endian. Region tables travel as four typed sections (short, int, float, double)
//! whose element counts are declared up front:
//!
//! - short: per-region initial-merge flag
//! - int: per-region pixel count, boundary pixel count, neighbour count and neighbour labels
//! - float: per-region max edge value
//! - double: per-region band sums (then sums of squares and `x·ln(x)` sums when accumulated)
//!   and last merge threshold
//!
//! Declared counts are capacities estimated from the region count. A section that outgrows its
//! capacity is logged and sent whole with its real count; a section that underfills it is
//! padded with zeros.

use crate::common::Config;
use crate::error::Error;
use crate::extent::Extent;
use crate::region::RegionTable;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;
use std::collections::BTreeSet;

pub const SCHEMA_VERSION: u8 = 1;

const GROW: u8 = 0x01;
const APPLY_LABEL_OFFSET: u8 = 0x02;
const RELABEL: u8 = 0x03;
const FETCH_PIXELS: u8 = 0x04;
const LABEL_OBJECTS: u8 = 0x05;
const APPLY_OBJECT_LABEL_OFFSET: u8 = 0x06;
const RELABEL_OBJECTS: u8 = 0x07;
const SHUTDOWN: u8 = 0x08;

const REGIONS: u8 = 0x11;
const PIXELS: u8 = 0x12;
const OBJECTS: u8 = 0x13;
const ACK: u8 = 0x14;
const FAILED: u8 = 0x15;

/// What a receiver needs to know to rebuild region tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub nbands: usize,
    pub sumsq: bool,
    pub sumxlogx: bool,
    pub initial_merge_npix: u32,
    pub neighbor_estimate: usize,
}

impl Layout {
    pub fn new(config: &Config, nbands: usize) -> Self {
        Self {
            nbands,
            sumsq: config.sumsq,
            sumxlogx: config.sumxlogx,
            initial_merge_npix: config.initial_merge_npix,
            neighbor_estimate: config.neighbor_estimate,
        }
    }

    pub fn empty_table(&self) -> RegionTable {
        RegionTable::new(self.nbands, self.sumsq, self.sumxlogx, self.initial_merge_npix)
    }

    fn doubles_per_region(&self) -> usize {
        self.nbands * (1 + self.sumsq as usize + self.sumxlogx as usize) + 1
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Converge the subtree to at most `target` regions and report its region table.
    Grow { target: u32 },
    /// Add `offset` to every non-zero region label of the subtree's pixels.
    ApplyLabelOffset { offset: i32 },
    /// Replace region labels of the subtree's pixels, `(old, new)` pairs.
    Relabel { pairs: Vec<(u32, u32)> },
    /// Send the pixels of `extent`, with features and edges when `features` is set.
    FetchPixels { extent: Extent, features: bool },
    /// Label the region-objects of the subtree and report the object table.
    LabelObjects,
    ApplyObjectLabelOffset { offset: i32 },
    RelabelObjects { pairs: Vec<(u32, u32)> },
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Grow { .. } => "Grow",
            Request::ApplyLabelOffset { .. } => "ApplyLabelOffset",
            Request::Relabel { .. } => "Relabel",
            Request::FetchPixels { .. } => "FetchPixels",
            Request::LabelObjects => "LabelObjects",
            Request::ApplyObjectLabelOffset { .. } => "ApplyObjectLabelOffset",
            Request::RelabelObjects { .. } => "RelabelObjects",
            Request::Shutdown => "Shutdown",
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(SCHEMA_VERSION);
        match self {
            Request::Grow { target } => {
                out.put_u8(GROW);
                out.put_u32_le(*target);
            }
            Request::ApplyLabelOffset { offset } => {
                out.put_u8(APPLY_LABEL_OFFSET);
                out.put_i32_le(*offset);
            }
            Request::Relabel { pairs } => {
                out.put_u8(RELABEL);
                put_pairs(&mut out, pairs);
            }
            Request::FetchPixels { extent, features } => {
                out.put_u8(FETCH_PIXELS);
                put_extent(&mut out, extent);
                out.put_u8(*features as u8);
            }
            Request::LabelObjects => out.put_u8(LABEL_OBJECTS),
            Request::ApplyObjectLabelOffset { offset } => {
                out.put_u8(APPLY_OBJECT_LABEL_OFFSET);
                out.put_i32_le(*offset);
            }
            Request::RelabelObjects { pairs } => {
                out.put_u8(RELABEL_OBJECTS);
                put_pairs(&mut out, pairs);
            }
            Request::Shutdown => out.put_u8(SHUTDOWN),
        }
        out.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let tag = get_header(&mut buf)?;
        let request = match tag {
            GROW => Request::Grow {
                target: get_u32(&mut buf)?,
            },
            APPLY_LABEL_OFFSET => Request::ApplyLabelOffset {
                offset: get_u32(&mut buf)? as i32,
            },
            RELABEL => Request::Relabel {
                pairs: get_pairs(&mut buf)?,
            },
            FETCH_PIXELS => {
                let extent = get_extent(&mut buf)?;
                need(&buf, 1)?;
                Request::FetchPixels {
                    extent,
                    features: buf.get_u8() != 0,
                }
            }
            LABEL_OBJECTS => Request::LabelObjects,
            APPLY_OBJECT_LABEL_OFFSET => Request::ApplyObjectLabelOffset {
                offset: get_u32(&mut buf)? as i32,
            },
            RELABEL_OBJECTS => Request::RelabelObjects {
                pairs: get_pairs(&mut buf)?,
            },
            SHUTDOWN => Request::Shutdown,
            other => return Err(Error::UnknownMessage(other)),
        };
        Ok(request)
    }
}

/// Converged region table of a subtree, labels `1..=nregions`.
#[derive(Clone, Debug)]
pub struct RegionReport {
    /// Initial region count summed over the subtree's leaves.
    pub global_nregions: u32,
    pub table: RegionTable,
}

/// Region-object table of a subtree with the class label of every object.
#[derive(Clone, Debug)]
pub struct ObjectReport {
    pub table: RegionTable,
    pub classes: Vec<u32>,
}

/// Pixels of a box. Labels, features and edges are packed for valid pixels only, in pixel
/// order.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelData {
    pub extent: Extent,
    pub valid: Vec<bool>,
    pub labels: Vec<u32>,
    pub objects: Vec<u32>,
    /// `nbands` values per valid pixel, empty when features were not requested.
    pub features: Vec<f32>,
    /// Empty when features were not requested.
    pub edges: Vec<f32>,
}

impl PixelData {
    pub fn nvalid(&self) -> usize {
        self.labels.len()
    }

    pub fn has_features(&self) -> bool {
        !self.edges.is_empty()
    }
}

#[derive(Clone, Debug)]
pub enum Response {
    Regions(RegionReport),
    Pixels(PixelData),
    Objects(ObjectReport),
    Ack,
    /// The task hit an error it cannot recover from.
    Failed(String),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Regions(_) => "Regions",
            Response::Pixels(_) => "Pixels",
            Response::Objects(_) => "Objects",
            Response::Ack => "Ack",
            Response::Failed(_) => "Failed",
        }
    }

    fn unexpected(&self, expected: &'static str) -> Error {
        Error::UnexpectedMessage {
            expected,
            found: self.name(),
        }
    }

    pub fn into_regions(self) -> Result<RegionReport, Error> {
        match self {
            Response::Regions(report) => Ok(report),
            other => Err(other.unexpected("Regions")),
        }
    }

    pub fn into_pixels(self) -> Result<PixelData, Error> {
        match self {
            Response::Pixels(data) => Ok(data),
            other => Err(other.unexpected("Pixels")),
        }
    }

    pub fn into_objects(self) -> Result<ObjectReport, Error> {
        match self {
            Response::Objects(report) => Ok(report),
            other => Err(other.unexpected("Objects")),
        }
    }

    pub fn into_ack(self) -> Result<(), Error> {
        match self {
            Response::Ack => Ok(()),
            other => Err(other.unexpected("Ack")),
        }
    }

    pub fn encode(&self, layout: &Layout) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(SCHEMA_VERSION);
        match self {
            Response::Regions(report) => {
                out.put_u8(REGIONS);
                out.put_u32_le(report.table.len());
                out.put_u32_le(report.global_nregions);
                put_table(&mut out, &report.table, layout);
            }
            Response::Pixels(data) => {
                out.put_u8(PIXELS);
                put_pixels(&mut out, data);
            }
            Response::Objects(report) => {
                out.put_u8(OBJECTS);
                out.put_u32_le(report.table.len());
                put_table(&mut out, &report.table, layout);
                report.classes.iter().for_each(|&c| out.put_u32_le(c));
            }
            Response::Ack => out.put_u8(ACK),
            Response::Failed(message) => {
                out.put_u8(FAILED);
                out.put_u32_le(message.len() as u32);
                out.put_slice(message.as_bytes());
            }
        }
        out.freeze()
    }

    pub fn decode(mut buf: Bytes, layout: &Layout) -> Result<Self, Error> {
        let tag = get_header(&mut buf)?;
        let response = match tag {
            REGIONS => {
                let nregions = get_u32(&mut buf)?;
                let global_nregions = get_u32(&mut buf)?;
                Response::Regions(RegionReport {
                    global_nregions,
                    table: get_table(&mut buf, layout, nregions)?,
                })
            }
            PIXELS => Response::Pixels(get_pixels(&mut buf, layout)?),
            OBJECTS => {
                let nobjects = get_u32(&mut buf)?;
                let table = get_table(&mut buf, layout, nobjects)?;
                let classes = get_u32s(&mut buf, nobjects as usize)?;
                Response::Objects(ObjectReport { table, classes })
            }
            ACK => Response::Ack,
            FAILED => {
                let len = get_u32(&mut buf)? as usize;
                need(&buf, len)?;
                let message = String::from_utf8_lossy(&buf.split_to(len)).into_owned();
                Response::Failed(message)
            }
            other => return Err(Error::UnknownMessage(other)),
        };
        Ok(response)
    }
}

fn need(buf: &Bytes, bytes: usize) -> Result<(), Error> {
    if buf.remaining() < bytes {
        return Err(Error::Truncated {
            needed: bytes,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_header(buf: &mut Bytes) -> Result<u8, Error> {
    need(buf, 2)?;
    let version = buf.get_u8();
    if version != SCHEMA_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, Error> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u32s(buf: &mut Bytes, count: usize) -> Result<Vec<u32>, Error> {
    need(buf, count * 4)?;
    Ok((0..count).map(|_| buf.get_u32_le()).collect())
}

fn put_pairs(out: &mut BytesMut, pairs: &[(u32, u32)]) {
    out.put_u32_le(pairs.len() as u32);
    for &(old, new) in pairs {
        out.put_u32_le(old);
        out.put_u32_le(new);
    }
}

fn get_pairs(buf: &mut Bytes) -> Result<Vec<(u32, u32)>, Error> {
    let count = get_u32(buf)? as usize;
    need(buf, count * 8)?;
    Ok((0..count)
        .map(|_| (buf.get_u32_le(), buf.get_u32_le()))
        .collect())
}

fn put_extent(out: &mut BytesMut, extent: &Extent) {
    for v in [
        extent.col0,
        extent.row0,
        extent.slice0,
        extent.ncols,
        extent.nrows,
        extent.nslices,
    ] {
        out.put_u32_le(v as u32);
    }
}

fn get_extent(buf: &mut Bytes) -> Result<Extent, Error> {
    let v = get_u32s(buf, 6)?;
    Ok(Extent {
        col0: v[0] as usize,
        row0: v[1] as usize,
        slice0: v[2] as usize,
        ncols: v[3] as usize,
        nrows: v[4] as usize,
        nslices: v[5] as usize,
    })
}

/// Element count to send for a section: the declared capacity, or the filled size if that is
/// larger.
pub(crate) fn settle_capacity(section: &str, declared: usize, filled: usize) -> usize {
    if filled > declared {
        warn!("{section} buffer holds {filled} elements, declared capacity was {declared}");
        filled
    } else {
        declared
    }
}

fn put_table(out: &mut BytesMut, table: &RegionTable, layout: &Layout) {
    let nregions = table.len() as usize;
    if nregions == 0 {
        return;
    }
    debug_assert_eq!(table.nactive(), table.len(), "only compacted tables are sent");
    out.put_f64_le(table.max_threshold());

    let mut shorts = Vec::with_capacity(nregions);
    let mut ints = Vec::with_capacity(nregions * (3 + layout.neighbor_estimate));
    let mut floats = Vec::with_capacity(nregions);
    let mut doubles = Vec::with_capacity(nregions * layout.doubles_per_region());
    for region in table.regions() {
        shorts.push(region.init_merge as u16);
        ints.push(region.npix);
        ints.push(region.boundary_npix);
        ints.push(region.neighbors.len() as u32);
        ints.extend(region.neighbors.iter().copied());
        floats.push(region.max_edge);
        doubles.extend_from_slice(&region.sum);
        doubles.extend_from_slice(&region.sumsq);
        doubles.extend_from_slice(&region.sumxlogx);
        doubles.push(region.merge_threshold);
    }

    let sizes = [
        settle_capacity("short", nregions, shorts.len()),
        settle_capacity("int", nregions * (3 + layout.neighbor_estimate), ints.len()),
        settle_capacity("float", nregions, floats.len()),
        settle_capacity("double", nregions * layout.doubles_per_region(), doubles.len()),
    ];
    sizes.iter().for_each(|&s| out.put_u32_le(s as u32));

    shorts.resize(sizes[0], 0);
    ints.resize(sizes[1], 0);
    floats.resize(sizes[2], 0.0);
    doubles.resize(sizes[3], 0.0);
    shorts.iter().for_each(|&v| out.put_u16_le(v));
    ints.iter().for_each(|&v| out.put_u32_le(v));
    floats.iter().for_each(|&v| out.put_f32_le(v));
    doubles.iter().for_each(|&v| out.put_f64_le(v));
}

/// Sequential reader over one decoded section.
struct Cursor<T> {
    values: Vec<T>,
    pos: usize,
}

impl<T: Copy> Cursor<T> {
    fn take(&mut self, count: usize) -> Result<&[T], Error> {
        if self.pos + count > self.values.len() {
            return Err(Error::Truncated {
                needed: count,
                remaining: self.values.len() - self.pos,
            });
        }
        let out = &self.values[self.pos..self.pos + count];
        self.pos += count;
        Ok(out)
    }

    fn next(&mut self) -> Result<T, Error> {
        Ok(self.take(1)?[0])
    }
}

fn get_table(buf: &mut Bytes, layout: &Layout, nregions: u32) -> Result<RegionTable, Error> {
    let mut table = layout.empty_table();
    if nregions == 0 {
        return Ok(table);
    }
    need(buf, 8)?;
    let max_threshold = buf.get_f64_le();
    let sizes: Vec<usize> = get_u32s(buf, 4)?.into_iter().map(|s| s as usize).collect();
    need(buf, sizes[0] * 2 + sizes[1] * 4 + sizes[2] * 4 + sizes[3] * 8)?;
    let mut shorts = Cursor {
        values: (0..sizes[0]).map(|_| buf.get_u16_le()).collect(),
        pos: 0,
    };
    let mut ints = Cursor {
        values: (0..sizes[1]).map(|_| buf.get_u32_le()).collect(),
        pos: 0,
    };
    let mut floats = Cursor {
        values: (0..sizes[2]).map(|_| buf.get_f32_le()).collect(),
        pos: 0,
    };
    let mut doubles = Cursor {
        values: (0..sizes[3]).map(|_| buf.get_f64_le()).collect(),
        pos: 0,
    };

    let nbands = layout.nbands;
    for _ in 0..nregions {
        let mut region = table.blank_region();
        region.init_merge = shorts.next()? != 0;
        region.npix = ints.next()?;
        region.boundary_npix = ints.next()?;
        let nneighbors = ints.next()? as usize;
        region.neighbors = ints.take(nneighbors)?.iter().copied().collect::<BTreeSet<_>>();
        region.max_edge = floats.next()?;
        region.sum = doubles.take(nbands)?.to_vec();
        if layout.sumsq {
            region.sumsq = doubles.take(nbands)?.to_vec();
        }
        if layout.sumxlogx {
            region.sumxlogx = doubles.take(nbands)?.to_vec();
        }
        region.merge_threshold = doubles.next()?;
        table.push_decoded(region);
    }
    table.set_max_threshold(max_threshold);
    Ok(table)
}

fn put_pixels(out: &mut BytesMut, data: &PixelData) {
    put_extent(out, &data.extent);
    let pixel_count = data.valid.len();
    let nints = data.labels.len() + data.objects.len();
    let nfloats = data.features.len() + data.edges.len();
    out.put_u32_le(pixel_count as u32);
    out.put_u32_le(pixel_count as u32);
    out.put_u32_le(nints as u32);
    out.put_u32_le(nfloats as u32);
    data.valid.iter().for_each(|&v| out.put_u8(v as u8));
    data.labels.iter().for_each(|&v| out.put_u32_le(v));
    data.objects.iter().for_each(|&v| out.put_u32_le(v));
    data.features.iter().for_each(|&v| out.put_f32_le(v));
    data.edges.iter().for_each(|&v| out.put_f32_le(v));
}

fn get_pixels(buf: &mut Bytes, layout: &Layout) -> Result<PixelData, Error> {
    let extent = get_extent(buf)?;
    let pixel_count = get_u32(buf)? as usize;
    let nbytes = get_u32(buf)? as usize;
    let nints = get_u32(buf)? as usize;
    let nfloats = get_u32(buf)? as usize;
    if pixel_count != extent.npix() || nbytes != pixel_count {
        return Err(Error::DimensionMismatch {
            expected: extent.npix(),
            actual: nbytes,
        });
    }
    need(buf, nbytes)?;
    let valid: Vec<bool> = (0..nbytes).map(|_| buf.get_u8() != 0).collect();
    let nvalid = valid.iter().filter(|&&v| v).count();
    if nints != 2 * nvalid {
        return Err(Error::DimensionMismatch {
            expected: 2 * nvalid,
            actual: nints,
        });
    }
    if nfloats != 0 && nfloats != (layout.nbands + 1) * nvalid {
        return Err(Error::DimensionMismatch {
            expected: (layout.nbands + 1) * nvalid,
            actual: nfloats,
        });
    }
    let labels = get_u32s(buf, nvalid)?;
    let objects = get_u32s(buf, nvalid)?;
    let (features, edges) = if nfloats > 0 {
        need(buf, nfloats * 4)?;
        let features = (0..layout.nbands * nvalid).map(|_| buf.get_f32_le()).collect();
        let edges = (0..nvalid).map(|_| buf.get_f32_le()).collect();
        (features, edges)
    } else {
        (Vec::new(), Vec::new())
    };
    Ok(PixelData {
        extent,
        valid,
        labels,
        objects,
        features,
        edges,
    })
}
