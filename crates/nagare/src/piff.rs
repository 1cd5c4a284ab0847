//! PIFF in-band timing boxes of live Smooth Streaming fragments.
//!
//! Both boxes are `uuid` boxes inside `moof/traf`:
//! - `tfxd` carries the absolute time and duration of the fragment itself
//! - `tfrf` announces the following fragments before they appear in the manifest
//!
//! Version 0 uses 32-bit time fields, version 1 64-bit ones.
use bytes::Buf;

use crate::{NagareError, NagareResult};

const TFXD_UUID: [u8; 16] = [
    0x6d, 0x1d, 0x9b, 0x05, 0x42, 0xd5, 0x44, 0xe6, 0x80, 0xe2, 0x14, 0x1d, 0xaf, 0xf7, 0x57, 0xb2,
];
const TFRF_UUID: [u8; 16] = [
    0xd4, 0x80, 0x7e, 0xf2, 0xca, 0x39, 0x46, 0x95, 0x8e, 0x54, 0x26, 0xcb, 0x9e, 0x46, 0xa7, 0x9f,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingEntry {
    pub time: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentTiming {
    /// From `tfxd`
    pub current: Option<TimingEntry>,
    /// From `tfrf`
    pub next: Vec<TimingEntry>,
}

struct BoxHeader {
    kind: [u8; 4],
    /// Payload size, header excluded
    size: usize,
}

fn read_header(data: &mut &[u8]) -> NagareResult<BoxHeader> {
    if data.remaining() < 8 {
        return Err(NagareError::InvalidBox("truncated box header".to_string()));
    }
    let size = data.get_u32() as u64;
    let mut kind = [0; 4];
    data.copy_to_slice(&mut kind);

    let (size, header) = match size {
        0 => (data.remaining() as u64 + 8, 8),
        1 => {
            if data.remaining() < 8 {
                return Err(NagareError::InvalidBox("truncated large size".to_string()));
            }
            (data.get_u64(), 16)
        }
        size => (size, 8),
    };
    let size = size
        .checked_sub(header)
        .filter(|size| *size <= data.remaining() as u64)
        .ok_or_else(|| {
            NagareError::InvalidBox(format!(
                "box {} has an invalid size",
                String::from_utf8_lossy(&kind)
            ))
        })?;

    Ok(BoxHeader {
        kind,
        size: size as usize,
    })
}

fn read_entry(data: &mut &[u8], version: u8) -> NagareResult<TimingEntry> {
    let width = if version == 1 { 16 } else { 8 };
    if data.remaining() < width {
        return Err(NagareError::InvalidBox("truncated timing entry".to_string()));
    }
    Ok(if version == 1 {
        TimingEntry {
            time: data.get_u64(),
            duration: data.get_u64(),
        }
    } else {
        TimingEntry {
            time: data.get_u32() as u64,
            duration: data.get_u32() as u64,
        }
    })
}

fn read_full_box(data: &mut &[u8]) -> NagareResult<u8> {
    if data.remaining() < 4 {
        return Err(NagareError::InvalidBox("truncated full box".to_string()));
    }
    let version = data.get_u8();
    data.advance(3);
    Ok(version)
}

fn parse_uuid(mut data: &[u8], timing: &mut FragmentTiming) -> NagareResult<()> {
    if data.remaining() < 16 {
        return Err(NagareError::InvalidBox("truncated uuid".to_string()));
    }
    let mut uuid = [0; 16];
    data.copy_to_slice(&mut uuid);

    if uuid == TFXD_UUID {
        let version = read_full_box(&mut data)?;
        timing.current = Some(read_entry(&mut data, version)?);
    } else if uuid == TFRF_UUID {
        let version = read_full_box(&mut data)?;
        if !data.has_remaining() {
            return Err(NagareError::InvalidBox("truncated tfrf".to_string()));
        }
        let count = data.get_u8();
        for _ in 0..count {
            timing.next.push(read_entry(&mut data, version)?);
        }
    }
    Ok(())
}

fn walk(mut data: &[u8], timing: &mut FragmentTiming) -> NagareResult<()> {
    while data.has_remaining() {
        let header = read_header(&mut data)?;
        let (payload, rest) = data.split_at(header.size);
        match &header.kind {
            b"moof" | b"traf" => walk(payload, timing)?,
            b"uuid" => parse_uuid(payload, timing)?,
            _ => {}
        }
        data = rest;
    }
    Ok(())
}

/// Extract the PIFF timing of a fragment, empty when the fragment carries none.
pub fn parse_timing(data: &[u8]) -> NagareResult<FragmentTiming> {
    let mut timing = FragmentTiming::default();
    walk(data, &mut timing)?;
    Ok(timing)
}
