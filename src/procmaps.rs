//! Finding a binary's image inside a running process.
//!
//! The process is found by name (via a `PidResolver`), then its
//! `/proc/<pid>/maps` listing is scanned for mappings whose path contains the
//! binary name.

use crate::{Error, Result};
use std::io::BufRead;

/// Turns a program name into the id of the one process running it.
pub trait PidResolver {
    fn resolve_pid(&self, name: &str) -> Result<u32>;
}

/// Resolves names with the `pidof` utility.
#[derive(Copy, Clone, Debug, Default)]
pub struct Pidof;

impl PidResolver for Pidof {
    fn resolve_pid(&self, name: &str) -> Result<u32> {
        let out = std::process::Command::new("pidof").arg(name).output()?;
        // pidof exits nonzero and prints nothing when there's no match, which
        // comes out as an empty list below.
        let pids = parse_pid_list(&String::from_utf8_lossy(&out.stdout))?;
        single_pid(name, pids)
    }
}

fn parse_pid_list(text: &str) -> Result<Vec<u32>> {
    text.split_whitespace()
        .map(|p| {
            p.parse::<u32>().map_err(|_| {
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("pidof printed {:?}", p),
                ))
            })
        })
        .collect()
}

fn single_pid(name: &str, pids: Vec<u32>) -> Result<u32> {
    match pids[..] {
        [] => Err(Error::ProcessNotFound(name.to_string())),
        [pid] => Ok(pid),
        _ => Err(Error::AmbiguousProcess {
            name: name.to_string(),
            pids,
        }),
    }
}

/// Where a binary's image sits in a live process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessImageLocation {
    pub process_id: u32,
    /// Lowest address at which any part of the binary is mapped.
    pub load_base: u64,
    pub writable_region_start: u64,
    pub writable_region_end: u64,
}

impl ProcessImageLocation {
    /// Size of the writable region in bytes.
    pub fn writable_len(&self) -> u64 {
        self.writable_region_end - self.writable_region_start
    }

    /// Translates a static address from the binary into an address in this
    /// process.
    pub fn live_address(
        &self,
        static_addr: u64,
        translation: AddressTranslation,
    ) -> u64 {
        match translation {
            AddressTranslation::Relative => {
                static_addr.wrapping_add(self.load_base)
            }
            AddressTranslation::Absolute => static_addr,
        }
    }
}

/// How static addresses relate to live ones.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressTranslation {
    /// Position-independent binary (`ET_DYN`): addresses in the file are
    /// offsets from wherever the loader put the image.
    Relative,
    /// Fixed-address executable (`ET_EXEC`): addresses in the file are the
    /// addresses at run time.
    Absolute,
}

impl AddressTranslation {
    pub fn for_object(object: &object::File) -> Self {
        use object::Object;
        match object.kind() {
            object::ObjectKind::Executable => Self::Absolute,
            object::ObjectKind::Dynamic => Self::Relative,
            other => {
                tracing::warn!(
                    kind = ?other,
                    "not an executable or shared object, assuming relocated addresses"
                );
                Self::Relative
            }
        }
    }
}

/// Result of scanning a memory map listing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MapScan {
    /// Lowest start address among matching lines; `u64::MAX` if none matched.
    pub load_base: u64,
    /// Start and end of the last matching `rw-p` line; zero if none.
    pub writable_region_start: u64,
    pub writable_region_end: u64,
    /// Number of lines whose path matched.
    pub matched: usize,
    /// Number of matching `rw-p` lines.
    pub writable_mappings: usize,
}

impl Default for MapScan {
    fn default() -> Self {
        Self {
            load_base: u64::MAX,
            writable_region_start: 0,
            writable_region_end: 0,
            matched: 0,
            writable_mappings: 0,
        }
    }
}

impl MapScan {
    /// Turns a scan into a location, failing if the binary was never seen or
    /// has no writable mapping.
    pub fn into_location(
        self,
        process_id: u32,
        binary_name: &str,
    ) -> Result<ProcessImageLocation> {
        if self.matched == 0 || self.writable_mappings == 0 {
            return Err(Error::ImageNotFound {
                pid: process_id,
                binary: binary_name.to_string(),
            });
        }
        Ok(ProcessImageLocation {
            process_id,
            load_base: self.load_base,
            writable_region_start: self.writable_region_start,
            writable_region_end: self.writable_region_end,
        })
    }
}

/// Scans a `/proc/<pid>/maps`-format listing for mappings whose path contains
/// `binary_name`.
///
/// Every line's address range must parse, matching or not. Lines without a
/// path (anonymous mappings) never match.
pub fn scan_maps(reader: impl BufRead, binary_name: &str) -> Result<MapScan> {
    let mut scan = MapScan::default();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (fields, path) = split_map_line(&line);
        let (start, end) = fields
            .first()
            .and_then(|r| parse_range(r))
            .ok_or_else(|| Error::MapParse { line: line.clone() })?;

        if path.is_empty() || !path.contains(binary_name) {
            continue;
        }
        scan.matched += 1;
        scan.load_base = scan.load_base.min(start);

        if fields.get(1) == Some(&"rw-p") {
            scan.writable_mappings += 1;
            scan.writable_region_start = start;
            scan.writable_region_end = end;
        }
    }

    if scan.writable_mappings > 1 {
        tracing::warn!(
            binary = binary_name,
            count = scan.writable_mappings,
            "binary has several writable mappings, using the last"
        );
    }
    Ok(scan)
}

/// Splits a map line into its five fixed fields and the path, which may
/// contain spaces.
fn split_map_line(line: &str) -> (Vec<&str>, &str) {
    let mut fields = Vec::with_capacity(5);
    let mut rest = line;
    for _ in 0..5 {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = &rest[end..];
    }
    (fields, rest.trim())
}

fn parse_range(field: &str) -> Option<(u64, u64)> {
    let (start, end) = field.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    (start <= end).then_some((start, end))
}

/// Finds `binary_name` in the memory map of process `pid`.
pub fn locate_pid(pid: u32, binary_name: &str) -> Result<ProcessImageLocation> {
    let path = format!("/proc/{}/maps", pid);
    let file = std::fs::File::open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ProcessNotFound(pid.to_string())
        } else {
            e.into()
        }
    })?;
    let scan = scan_maps(std::io::BufReader::new(file), binary_name)?;
    let location = scan.into_location(pid, binary_name)?;
    tracing::info!(
        pid,
        binary = binary_name,
        load_base = format_args!("{:#x}", location.load_base),
        writable = format_args!(
            "{:#x}..{:#x}",
            location.writable_region_start, location.writable_region_end
        ),
        "located process image"
    );
    Ok(location)
}

/// Finds the single running process for `binary_name` and locates the binary
/// in it.
pub fn locate(
    binary_name: &str,
    resolver: &dyn PidResolver,
) -> Result<ProcessImageLocation> {
    let pid = resolver.resolve_pid(binary_name)?;
    locate_pid(pid, binary_name)
}
