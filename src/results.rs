//! Per-level result records and their binary layout.
//!
//! One record per label of the level-0 label space, in label order. Every record starts with
//! `label` and `merge_region_label` (int32, 0 while active). Only active records carry the
//! remaining fields, each gated by an [`OutputFlags`] switch. Integers are int32 and reals
//! float64, little endian.

use crate::error::Error;
use bytes::{Buf, BufMut};

/// Selects the optional fields of the result records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFlags {
    /// Per-band sums.
    pub sums: bool,
    /// Per-band sums of squares, after the sums. Needs `sums`.
    pub sumsq: bool,
    /// Per-band `x·ln(x)` sums, after the sums of squares. Needs `sums`.
    pub sumxlogx: bool,
    /// Band-averaged standard deviation.
    pub std_dev: bool,
    /// Dissimilarity of the last merge into the region.
    pub threshold: bool,
    /// Number of region pixels with a neighbour in another region.
    pub boundary: bool,
    /// Number of region-objects the region consists of.
    pub object_count: bool,
    /// Labels of those region-objects. Written after the count, which is then always present.
    pub object_list: bool,
}

impl Default for OutputFlags {
    fn default() -> Self {
        Self {
            sums: true,
            sumsq: false,
            sumxlogx: false,
            std_dev: false,
            threshold: true,
            boundary: true,
            object_count: true,
            object_list: false,
        }
    }
}

impl OutputFlags {
    fn writes_object_count(&self) -> bool {
        self.object_count || self.object_list
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionRecord {
    pub label: u32,
    /// 0 while active, otherwise the active label the region was merged into.
    pub merge_region_label: u32,
    pub npix: u32,
    pub sum: Vec<f64>,
    pub sumsq: Vec<f64>,
    pub sumxlogx: Vec<f64>,
    pub std_dev: f64,
    pub threshold: f64,
    pub boundary_npix: u32,
    pub neighbors: Vec<u32>,
    pub objects: Vec<u32>,
}

impl RegionRecord {
    pub fn is_active(&self) -> bool {
        self.merge_region_label == 0
    }

    /// The active label this record belongs to.
    pub fn active_label(&self) -> u32 {
        if self.is_active() {
            self.label
        } else {
            self.merge_region_label
        }
    }
}

/// A region-object: one connected component of a region.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectRecord {
    pub label: u32,
    pub merge_region_label: u32,
    pub npix: u32,
    pub sum: Vec<f64>,
    pub sumsq: Vec<f64>,
    pub sumxlogx: Vec<f64>,
    pub std_dev: f64,
}

impl ObjectRecord {
    pub fn is_active(&self) -> bool {
        self.merge_region_label == 0
    }

    pub fn active_label(&self) -> u32 {
        if self.is_active() {
            self.label
        } else {
            self.merge_region_label
        }
    }
}

fn need<B: Buf>(buf: &B, bytes: usize) -> Result<(), Error> {
    if buf.remaining() < bytes {
        return Err(Error::Truncated {
            needed: bytes,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, Error> {
    need(buf, 4)?;
    Ok(buf.get_i32_le() as u32)
}

fn get_f64s<B: Buf>(buf: &mut B, count: usize) -> Result<Vec<f64>, Error> {
    need(buf, count * 8)?;
    Ok((0..count).map(|_| buf.get_f64_le()).collect())
}

fn get_u32s<B: Buf>(buf: &mut B, count: usize) -> Result<Vec<u32>, Error> {
    need(buf, count * 4)?;
    Ok((0..count).map(|_| buf.get_i32_le() as u32).collect())
}

fn put_sums<B: BufMut>(
    out: &mut B,
    flags: &OutputFlags,
    sum: &[f64],
    sumsq: &[f64],
    sumxlogx: &[f64],
) {
    if !flags.sums {
        return;
    }
    sum.iter().for_each(|&v| out.put_f64_le(v));
    if flags.sumsq {
        sumsq.iter().for_each(|&v| out.put_f64_le(v));
    }
    if flags.sumxlogx {
        sumxlogx.iter().for_each(|&v| out.put_f64_le(v));
    }
}

type Sums = (Vec<f64>, Vec<f64>, Vec<f64>);

fn get_sums<B: Buf>(buf: &mut B, flags: &OutputFlags, nbands: usize) -> Result<Sums, Error> {
    if !flags.sums {
        return Ok((vec![], vec![], vec![]));
    }
    let sum = get_f64s(buf, nbands)?;
    let sumsq = if flags.sumsq {
        get_f64s(buf, nbands)?
    } else {
        vec![]
    };
    let sumxlogx = if flags.sumxlogx {
        get_f64s(buf, nbands)?
    } else {
        vec![]
    };
    Ok((sum, sumsq, sumxlogx))
}

pub fn write_region_records<B: BufMut>(
    out: &mut B,
    records: &[RegionRecord],
    flags: &OutputFlags,
) {
    for record in records {
        out.put_i32_le(record.label as i32);
        out.put_i32_le(record.merge_region_label as i32);
        if !record.is_active() {
            continue;
        }
        out.put_i32_le(record.npix as i32);
        put_sums(out, flags, &record.sum, &record.sumsq, &record.sumxlogx);
        if flags.std_dev {
            out.put_f64_le(record.std_dev);
        }
        if flags.threshold {
            out.put_f64_le(record.threshold);
        }
        if flags.boundary {
            out.put_i32_le(record.boundary_npix as i32);
        }
        out.put_i32_le(record.neighbors.len() as i32);
        record
            .neighbors
            .iter()
            .for_each(|&n| out.put_i32_le(n as i32));
        if flags.writes_object_count() {
            out.put_i32_le(record.objects.len() as i32);
        }
        if flags.object_list {
            record.objects.iter().for_each(|&o| out.put_i32_le(o as i32));
        }
    }
}

/// Reads `count` records written by [`write_region_records`] with the same flags.
pub fn read_region_records<B: Buf>(
    buf: &mut B,
    count: usize,
    nbands: usize,
    flags: &OutputFlags,
) -> Result<Vec<RegionRecord>, Error> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let label = get_u32(buf)?;
        let merge_region_label = get_u32(buf)?;
        if merge_region_label != 0 {
            records.push(RegionRecord {
                label,
                merge_region_label,
                ..RegionRecord::default()
            });
            continue;
        }
        let npix = get_u32(buf)?;
        let (sum, sumsq, sumxlogx) = get_sums(buf, flags, nbands)?;
        let std_dev = if flags.std_dev {
            get_f64s(buf, 1)?[0]
        } else {
            0.0
        };
        let threshold = if flags.threshold {
            get_f64s(buf, 1)?[0]
        } else {
            0.0
        };
        let boundary_npix = if flags.boundary { get_u32(buf)? } else { 0 };
        let nneighbors = get_u32(buf)? as usize;
        let neighbors = get_u32s(buf, nneighbors)?;
        let nobjects = if flags.writes_object_count() {
            get_u32(buf)? as usize
        } else {
            0
        };
        let objects = if flags.object_list {
            get_u32s(buf, nobjects)?
        } else {
            // only the count was written
            vec![0; nobjects]
        };
        records.push(RegionRecord {
            label,
            merge_region_label,
            npix,
            sum,
            sumsq,
            sumxlogx,
            std_dev,
            threshold,
            boundary_npix,
            neighbors,
            objects,
        });
    }
    Ok(records)
}

pub fn write_object_records<B: BufMut>(
    out: &mut B,
    records: &[ObjectRecord],
    flags: &OutputFlags,
) {
    for record in records {
        out.put_i32_le(record.label as i32);
        out.put_i32_le(record.merge_region_label as i32);
        if !record.is_active() {
            continue;
        }
        out.put_i32_le(record.npix as i32);
        put_sums(out, flags, &record.sum, &record.sumsq, &record.sumxlogx);
        if flags.std_dev {
            out.put_f64_le(record.std_dev);
        }
    }
}

pub fn read_object_records<B: Buf>(
    buf: &mut B,
    count: usize,
    nbands: usize,
    flags: &OutputFlags,
) -> Result<Vec<ObjectRecord>, Error> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let label = get_u32(buf)?;
        let merge_region_label = get_u32(buf)?;
        if merge_region_label != 0 {
            records.push(ObjectRecord {
                label,
                merge_region_label,
                ..ObjectRecord::default()
            });
            continue;
        }
        let npix = get_u32(buf)?;
        let (sum, sumsq, sumxlogx) = get_sums(buf, flags, nbands)?;
        let std_dev = if flags.std_dev {
            get_f64s(buf, 1)?[0]
        } else {
            0.0
        };
        records.push(ObjectRecord {
            label,
            merge_region_label,
            npix,
            sum,
            sumsq,
            sumxlogx,
            std_dev,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn records() -> Vec<RegionRecord> {
        vec![
            RegionRecord {
                label: 1,
                npix: 12,
                sum: vec![12.0, 24.5],
                sumsq: vec![12.0, 60.0],
                threshold: 0.25,
                boundary_npix: 5,
                neighbors: vec![3],
                objects: vec![1, 4],
                ..RegionRecord::default()
            },
            RegionRecord {
                label: 2,
                merge_region_label: 1,
                ..RegionRecord::default()
            },
            RegionRecord {
                label: 3,
                npix: 4,
                sum: vec![40.0, 0.0],
                sumsq: vec![400.0, 0.0],
                neighbors: vec![1],
                objects: vec![2],
                ..RegionRecord::default()
            },
        ]
    }

    #[test]
    fn region_layout_is_exact() {
        let flags = OutputFlags {
            sums: true,
            sumsq: false,
            sumxlogx: false,
            std_dev: false,
            threshold: false,
            boundary: false,
            object_count: false,
            object_list: false,
        };
        let mut out = BytesMut::new();
        write_region_records(&mut out, &records()[..2], &flags);
        // label, merge, npix, 2 sums, neighbor count, 1 neighbor; then label, merge
        assert_eq!(out.len(), 4 * 3 + 8 * 2 + 4 * 2 + 4 * 2);
        let mut buf = out.freeze();
        assert_eq!(buf.get_i32_le(), 1);
        assert_eq!(buf.get_i32_le(), 0);
        assert_eq!(buf.get_i32_le(), 12);
        assert_eq!(buf.get_f64_le(), 12.0);
    }

    #[test]
    fn region_records_read_back() {
        let flags = OutputFlags {
            sumsq: true,
            object_list: true,
            ..OutputFlags::default()
        };
        let mut out = BytesMut::new();
        write_region_records(&mut out, &records(), &flags);
        let mut buf = out.freeze();
        let read = read_region_records(&mut buf, 3, 2, &flags).unwrap();
        assert_eq!(read, records());
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let flags = OutputFlags::default();
        let mut out = BytesMut::new();
        write_region_records(&mut out, &records(), &flags);
        let mut buf = out.freeze().slice(..20);
        assert!(matches!(
            read_region_records(&mut buf, 3, 2, &flags),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn object_records_read_back() {
        let flags = OutputFlags {
            std_dev: true,
            ..OutputFlags::default()
        };
        let objects = vec![
            ObjectRecord {
                label: 1,
                npix: 3,
                sum: vec![6.0],
                std_dev: 0.5,
                ..ObjectRecord::default()
            },
            ObjectRecord {
                label: 2,
                merge_region_label: 1,
                ..ObjectRecord::default()
            },
        ];
        let mut out = BytesMut::new();
        write_object_records(&mut out, &objects, &flags);
        let read = read_object_records(&mut out.freeze(), 2, 1, &flags).unwrap();
        assert_eq!(read, objects);
        assert_eq!(read[1].active_label(), 1);
    }
}
