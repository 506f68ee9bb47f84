//! Electronic Data Sheet database (C2).
//!
//! `.eds` files describe a device's object dictionary in INI form. This
//! module walks a directory of them, parses each with the `ini` crate,
//! interprets the CANopen-specific sections/keys on top of that token
//! stream, and answers lookups by device identity or by object key.
//!
//! One record per device description; the collection is append-only and
//! immutable once `load_all` returns, so readers never need to lock it
//! (the EDS database is immutable after `load_all`).

use crate::error::CanOpenError;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Access rights decoded from an EDS `accesstype` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    R,
    W,
    RW,
    Const,
    Unknown,
}

fn decode_access(s: &str) -> Access {
    match s.to_ascii_lowercase().as_str() {
        "ro" => Access::R,
        "wo" => Access::W,
        "rw" | "rwr" | "rww" => Access::RW,
        "const" => Access::Const,
        _ => Access::Unknown,
    }
}

/// One object dictionary entry, as described by a single `HHHH` or
/// `HHHHsubHH` section of an `.eds` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub data_type: u32,
    pub access: Access,
    pub name: Option<String>,
    pub default_value: Option<String>,
    pub low_limit: Option<String>,
    pub high_limit: Option<String>,
    pub unit: Option<String>,
    pub scaling: Option<String>,
}

/// Pack `(index, sub)` the same way the original object tree's `key` field
/// does, so lookups stay a single ordered-map access.
fn pack_key(index: u16, sub: u8) -> u32 {
    ((index as u32) << 8) | sub as u32
}

/// One parsed `.eds` file: device identity plus its object dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdsRecord {
    pub vendor: u32,
    pub product: u32,
    pub revision: u32,
    pub name: String,
    obj_tree: BTreeMap<u32, ObjectDescriptor>,
}

impl EdsRecord {
    pub fn obj_find(&self, index: u16, sub: u8) -> Option<&ObjectDescriptor> {
        self.obj_tree.get(&pack_key(index, sub))
    }

    pub fn objects(&self) -> impl Iterator<Item = (u16, u8, &ObjectDescriptor)> {
        self.obj_tree
            .iter()
            .map(|(key, obj)| ((*key >> 8) as u16, (*key & 0xff) as u8, obj))
    }
}

/// Accumulated result of a directory load: the successfully parsed records
/// plus one diagnostic per file that failed to parse. A bad file never
/// fails the whole load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub failures: Vec<CanOpenError>,
}

#[derive(Debug, Default)]
pub struct EdsDatabase {
    records: Vec<EdsRecord>,
}

impl EdsDatabase {
    /// Walk `root`, parsing every file whose final extension is `.eds`.
    /// Caps the number of files visited at half the process' open-file
    /// limit (falling back to 3, mirroring the original `getrlimit`
    /// fallback) so a runaway directory tree can't exhaust descriptors.
    pub fn load_all(root: &Path) -> (Self, LoadReport) {
        let mut db = EdsDatabase {
            records: Vec::new(),
        };
        let mut report = LoadReport::default();
        let budget = max_files_budget();
        let mut visited = 0usize;

        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(err) => {
                    report.failures.push(CanOpenError::EdsParseError {
                        path: dir.clone(),
                        line: 0,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !has_eds_extension(&path) {
                    continue;
                }
                if visited >= budget {
                    warn!("eds loader: file budget ({budget}) reached, skipping {path:?}");
                    continue;
                }
                visited += 1;
                match load_file(&path) {
                    Ok(record) => {
                        debug!(
                            "eds loader: loaded {:?} ({}/{}/{})",
                            path, record.vendor, record.product, record.revision
                        );
                        db.records.push(record);
                    }
                    Err(err) => {
                        warn!("eds loader: {path:?}: {err}");
                        report.failures.push(err);
                    }
                }
            }
        }

        (db, report)
    }

    /// Zero or negative fields (represented here as `0`) act as wildcards.
    /// Ties on revision distance favour the first matching record, matching
    /// the linear-scan original.
    pub fn find(&self, vendor: u32, product: u32, revision: u32) -> Option<&EdsRecord> {
        let mut best: Option<&EdsRecord> = None;
        let mut best_diff = u32::MAX;

        for record in &self.records {
            if vendor > 0 && vendor != record.vendor {
                continue;
            }
            if product > 0 && product != record.product {
                continue;
            }
            if revision > 0 && revision != record.revision {
                let diff = revision.abs_diff(record.revision);
                if diff < best_diff {
                    best_diff = diff;
                    best = Some(record);
                }
                continue;
            }
            return Some(record);
        }

        best
    }

    /// Longest-prefix match by name; ties favour the *last* record whose
    /// name is a prefix, matching the original's `current_len < best_length
    /// -> continue` comparison (a strict `<` lets an equal-length later
    /// match win).
    pub fn find_by_name(&self, name: &str) -> Option<&EdsRecord> {
        let mut best: Option<&EdsRecord> = None;
        let mut best_len = 0usize;

        for record in &self.records {
            let len = record.name.len();
            if len < best_len {
                continue;
            }
            if !name.starts_with(record.name.as_str()) {
                continue;
            }
            best_len = len;
            best = Some(record);
        }

        best
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn has_eds_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("eds"))
        .unwrap_or(false)
}

fn max_files_budget() -> usize {
    #[cfg(unix)]
    {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: rlim is a plain out-parameter we own for the duration of the call.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
        if rc == 0 {
            return ((rlim.rlim_cur as usize) / 2).max(3);
        }
    }
    3
}

fn load_file(path: &Path) -> Result<EdsRecord, CanOpenError> {
    let ini = ini::Ini::load_from_file(path).map_err(|err| CanOpenError::EdsParseError {
        path: path.to_path_buf(),
        line: 0,
        reason: err.to_string(),
    })?;

    let device_info = ini.section(Some("DeviceInfo")).ok_or_else(|| {
        CanOpenError::EdsParseError {
            path: path.to_path_buf(),
            line: 0,
            reason: "missing [DeviceInfo] section".into(),
        }
    })?;

    let vendor = required_hex(device_info, "VendorNumber", path)?;
    let product = required_hex(device_info, "ProductNumber", path)?;
    let revision = required_hex(device_info, "RevisionNumber", path)?;
    let name = device_info
        .get("ProductName")
        .ok_or_else(|| CanOpenError::EdsParseError {
            path: path.to_path_buf(),
            line: 0,
            reason: "missing DeviceInfo.ProductName".into(),
        })?
        .to_string();

    let mut obj_tree = BTreeMap::new();
    for (section_name, props) in ini.iter() {
        let Some(section_name) = section_name else {
            continue;
        };
        let Some((index, sub)) = parse_object_section(section_name) else {
            continue;
        };
        let Some(data_type) = props.get("DataType") else {
            continue;
        };
        let data_type = parse_int::parse::<u32>(data_type).unwrap_or(0);
        let access = decode_access(props.get("AccessType").unwrap_or("ro"));

        obj_tree.insert(
            pack_key(index, sub),
            ObjectDescriptor {
                data_type,
                access,
                name: props.get("ParameterName").map(str::to_string),
                default_value: props.get("DefaultValue").map(str::to_string),
                low_limit: props.get("LowLimit").map(str::to_string),
                high_limit: props.get("HighLimit").map(str::to_string),
                unit: props.get("x-unit").map(str::to_string),
                scaling: props.get("x-scaling").map(str::to_string),
            },
        );
    }

    Ok(EdsRecord {
        vendor,
        product,
        revision,
        name,
        obj_tree,
    })
}

fn required_hex(section: &ini::Properties, key: &str, path: &Path) -> Result<u32, CanOpenError> {
    let raw = section.get(key).ok_or_else(|| CanOpenError::EdsParseError {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("missing DeviceInfo.{key}"),
    })?;
    parse_int::parse::<u32>(raw).map_err(|_| CanOpenError::EdsParseError {
        path: path.to_path_buf(),
        line: 0,
        reason: format!("DeviceInfo.{key} is not an integer: {raw}"),
    })
}

/// Section names of the form `HHHH` or `HHHHsubHH` name an object; anything
/// else (`DeviceInfo`, `FileInfo`, vendor-specific sections, ...) is ignored.
fn parse_object_section(section: &str) -> Option<(u16, u8)> {
    if let Some(sub_pos) = section.to_ascii_lowercase().find("sub") {
        let index = u16::from_str_radix(&section[..sub_pos], 16).ok()?;
        let sub_str = &section[sub_pos + 3..];
        let sub = if sub_str.is_empty() {
            0
        } else {
            u8::from_str_radix(sub_str, 16).ok()?
        };
        Some((index, sub))
    } else {
        let index = u16::from_str_radix(section, 16).ok()?;
        Some((index, 0))
    }
}

pub fn eds_default_root() -> PathBuf {
    PathBuf::from("/var/marel/canmaster/eds.d")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(vendor: u32, product: u32, revision: u32, name: &str) -> EdsRecord {
        EdsRecord {
            vendor,
            product,
            revision,
            name: name.to_string(),
            obj_tree: BTreeMap::new(),
        }
    }

    #[test]
    fn find_exact_match_wins_immediately() {
        let db = EdsDatabase {
            records: vec![
                record(1, 2, 1, "a"),
                record(1, 2, 3, "b"),
                record(1, 2, 7, "c"),
            ],
        };
        assert_eq!(db.find(1, 2, 3).unwrap().name, "b");
    }

    #[test]
    fn find_best_revision_selection() {
        let db = EdsDatabase {
            records: vec![
                record(1, 2, 1, "a"),
                record(1, 2, 3, "b"),
                record(1, 2, 7, "c"),
            ],
        };
        assert_eq!(db.find(1, 2, 5).unwrap().name, "b");
        assert_eq!(db.find(1, 2, 6).unwrap().name, "c");
    }

    #[test]
    fn find_wildcards_on_zero() {
        let db = EdsDatabase {
            records: vec![record(9, 9, 1, "a")],
        };
        assert!(db.find(0, 0, 0).is_some());
        assert!(db.find(9, 0, 0).is_some());
        assert!(db.find(5, 0, 0).is_none());
    }

    #[test]
    fn find_by_name_longest_prefix() {
        let db = EdsDatabase {
            records: vec![record(0, 0, 0, "acme"), record(0, 0, 0, "acme-pump")],
        };
        assert_eq!(db.find_by_name("acme-pump-5").unwrap().name, "acme-pump");
        assert_eq!(db.find_by_name("acme-other").unwrap().name, "acme");
    }

    #[test]
    fn section_name_parsing() {
        assert_eq!(parse_object_section("1018"), Some((0x1018, 0)));
        assert_eq!(parse_object_section("1018sub01"), Some((0x1018, 0x01)));
        assert_eq!(parse_object_section("6000sub"), Some((0x6000, 0)));
        assert_eq!(parse_object_section("DeviceInfo"), None);
        assert_eq!(parse_object_section("not-hex"), None);
    }

    #[test]
    fn access_decoding() {
        assert_eq!(decode_access("ro"), Access::R);
        assert_eq!(decode_access("RW"), Access::RW);
        assert_eq!(decode_access("rwr"), Access::RW);
        assert_eq!(decode_access("const"), Access::Const);
        assert_eq!(decode_access("bogus"), Access::Unknown);
    }

    fn write_eds(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    const SAMPLE_EDS: &str = "\
[DeviceInfo]
VendorNumber=0x1
ProductNumber=0x2
RevisionNumber=0x1
ProductName=acme-pump

[1018sub01]
ParameterName=Vendor ID
DataType=0x07
AccessType=ro
";

    #[test]
    fn load_all_walks_nested_directories() {
        let root = tempfile::tempdir().unwrap();
        write_eds(root.path(), "top.eds", SAMPLE_EDS);
        let nested = root.path().join("nested");
        fs::create_dir(&nested).unwrap();
        write_eds(&nested, "deep.eds", SAMPLE_EDS);
        fs::write(root.path().join("ignored.txt"), "not an eds file").unwrap();

        let (db, report) = EdsDatabase::load_all(root.path());
        assert!(report.failures.is_empty());
        assert_eq!(db.len(), 2);
        let record = db.find(1, 2, 1).unwrap();
        assert_eq!(record.name, "acme-pump");
        assert_eq!(record.obj_find(0x1018, 0x01).unwrap().data_type, 7);
    }

    #[test]
    fn load_all_reports_malformed_files_without_failing_the_load() {
        let root = tempfile::tempdir().unwrap();
        write_eds(root.path(), "good.eds", SAMPLE_EDS);
        write_eds(root.path(), "bad.eds", "[DeviceInfo]\nVendorNumber=0x1\n");

        let (db, report) = EdsDatabase::load_all(root.path());
        assert_eq!(db.len(), 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn load_all_honors_the_file_budget() {
        let root = tempfile::tempdir().unwrap();
        for i in 0..8 {
            write_eds(root.path(), &format!("dev{i}.eds"), SAMPLE_EDS);
        }

        let budget = max_files_budget();
        let (db, _report) = EdsDatabase::load_all(root.path());
        assert_eq!(db.len(), 8.min(budget));
    }

    #[test]
    fn obj_find_packs_key_correctly() {
        let mut obj_tree = BTreeMap::new();
        obj_tree.insert(
            pack_key(0x1018, 0x01),
            ObjectDescriptor {
                data_type: 7,
                access: Access::R,
                name: Some("vendor id".into()),
                default_value: None,
                low_limit: None,
                high_limit: None,
                unit: None,
                scaling: None,
            },
        );
        let r = EdsRecord {
            vendor: 1,
            product: 1,
            revision: 1,
            name: "dev".into(),
            obj_tree,
        };
        assert!(r.obj_find(0x1018, 0x01).is_some());
        assert!(r.obj_find(0x1018, 0x02).is_none());
    }
}
