use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use desman_accel::DeviceTensor;
use desman_core::{DType, Error, ExecKind, HostTensor, Result, Shape};

use crate::platform::{AccelOps, Value};

// Weight loader
//
// Binary weight format (.dsw), one tensor per file:
//
//   magic:   [u8; 4]  = b"DSMW"
//   version: u32 LE   = 1
//   dtype:   u8       (0=F32, 1=U32)
//   ndim:    u32 LE
//   dims:    [u32 LE; ndim]
//   data_len: u64 LE  (in bytes)
//   data:    [u8; data_len]  (raw little-endian typed data)
//
// The manifest is a plain text file listing one weight file name per line,
// resolved relative to the manifest's directory. The weight name is the
// file name without extension.

const MAGIC: &[u8; 4] = b"DSMW";
const VERSION: u32 = 1;

// DType <-> u8 encoding

fn dtype_to_u8(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::U32 => 1,
    }
}

fn u8_to_dtype(v: u8) -> Result<DType> {
    match v {
        0 => Ok(DType::F32),
        1 => Ok(DType::U32),
        _ => Err(Error::msg(format!("unknown dtype tag: {v}"))),
    }
}

// LE read/write helpers

fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write one tensor in the weight file format.
pub fn save_tensor(path: impl AsRef<Path>, tensor: &HostTensor) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    write_u32(&mut w, VERSION)?;
    write_u8(&mut w, dtype_to_u8(tensor.dtype()))?;
    let dims = tensor.shape().dims();
    write_u32(&mut w, dims.len() as u32)?;
    for &d in dims {
        write_u32(&mut w, d as u32)?;
    }
    let data = tensor.to_le_bytes();
    write_u64(&mut w, data.len() as u64)?;
    w.write_all(&data)?;
    w.flush()?;
    Ok(())
}

/// Read one tensor in the weight file format.
pub fn load_tensor(path: impl AsRef<Path>) -> Result<HostTensor> {
    let path = path.as_ref();
    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "{}: expected magic {MAGIC:?}, got {magic:?}",
            path.display()
        )));
    }
    let version = read_u32(&mut r)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "{}: unsupported weight file version {version}",
            path.display()
        )));
    }
    let dtype = u8_to_dtype(read_u8(&mut r)?)?;
    let ndim = read_u32(&mut r)? as usize;
    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        dims.push(read_u32(&mut r)? as usize);
    }
    let data_len = read_u64(&mut r)? as usize;
    let data = read_bytes(&mut r, data_len)?;
    if data_len % 4 != 0 {
        return Err(Error::msg(format!(
            "{}: payload length {data_len} is not a multiple of 4",
            path.display()
        )));
    }
    let shape = Shape::new(dims);
    match dtype {
        DType::F32 => {
            let vals = data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            HostTensor::from_f32(vals, shape)
        }
        DType::U32 => {
            let vals = data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            HostTensor::from_u32(vals, shape)
        }
    }
}

// Bank classifier

/// Which operator family a weight feeds, resolved from its name. The bank
/// assignment follows the per-operator bank plan so that weight and operand
/// already share a bank on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightClass {
    Conv,
    Matmul,
    Elementwise,
}

/// Static name-based classification: `conv` anywhere in the name selects
/// the convolution bank, `matmul`/`dense` the matmul bank, everything else
/// the elementwise bank.
pub fn classify(name: &str) -> WeightClass {
    let lower = name.to_ascii_lowercase();
    if lower.contains("conv") {
        WeightClass::Conv
    } else if lower.contains("matmul") || lower.contains("dense") {
        WeightClass::Matmul
    } else {
        WeightClass::Elementwise
    }
}

// Weight store

/// One loaded weight: the host tensor always, plus the accelerator-resident
/// copy and its resolved bank when residency was requested.
pub struct WeightEntry {
    host: HostTensor,
    device: Option<DeviceTensor>,
    bank: Option<usize>,
}

impl WeightEntry {
    pub fn host(&self) -> &HostTensor {
        &self.host
    }

    pub fn device(&self) -> Option<&DeviceTensor> {
        self.device.as_ref()
    }

    pub fn bank(&self) -> Option<usize> {
        self.bank
    }
}

/// Immutable table of named weights loaded from a manifest.
pub struct WeightStore {
    entries: HashMap<String, WeightEntry>,
}

impl WeightStore {
    /// Load every weight listed in `manifest` (paths relative to the
    /// manifest's directory). When `accel` is given, each weight is also
    /// uploaded into the bank its name classifies to.
    pub fn load(manifest: impl AsRef<Path>, accel: Option<&AccelOps>) -> Result<Self> {
        let manifest = manifest.as_ref();
        let dir = manifest.parent().unwrap_or_else(|| Path::new("."));
        let listing = fs::read_to_string(manifest)?;
        let mut entries = HashMap::new();
        for (lineno, line) in listing.lines().enumerate() {
            let file = line.trim();
            if file.is_empty() {
                log::warn!(
                    "{}:{}: empty manifest entry, skipping",
                    manifest.display(),
                    lineno + 1
                );
                continue;
            }
            let path = dir.join(file);
            let host = load_tensor(&path)?;
            if host.elem_count() == 0 {
                log::warn!("{}: zero-length tensor, skipping", path.display());
                continue;
            }
            let name = Path::new(file)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(file)
                .to_string();
            let (device, bank) = match accel {
                Some(ops) => {
                    let plan = &ops.device().config().banks;
                    let bank = match classify(&name) {
                        WeightClass::Conv => plan.conv,
                        WeightClass::Matmul => plan.matmul,
                        WeightClass::Elementwise => plan.elementwise,
                    };
                    let tensor = DeviceTensor::from_host(ops.device(), &host, bank)?
                        .with_tag(name.clone());
                    (Some(tensor), Some(bank))
                }
                None => (None, None),
            };
            entries.insert(name, WeightEntry { host, device, bank });
        }
        Ok(WeightStore { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, name: &str) -> Option<&WeightEntry> {
        self.entries.get(name)
    }

    /// The weight as a value of the requested execution kind.
    pub fn get(&self, kind: ExecKind, name: &str) -> Result<Value> {
        let entry = self.entries.get(name).ok_or_else(|| Error::UnknownWeight {
            name: name.to_string(),
        })?;
        match kind {
            ExecKind::Local => Ok(Value::Host(entry.host.clone())),
            ExecKind::Accel => match &entry.device {
                Some(t) => Ok(Value::Device(t.clone())),
                None => Err(Error::msg(format!(
                    "weight '{name}' was loaded without accelerator residency"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("desman-weights-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_tensor_file_round_trip() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("w.dsw");
        let t = HostTensor::from_f32(vec![1.5, -2.0, 0.25, 8.0], (2, 2)).unwrap();
        save_tensor(&path, &t).unwrap();
        let back = load_tensor(&path).unwrap();
        assert!(desman_core::compare_tensors(&t, &back));
    }

    #[test]
    fn test_tensor_file_rejects_bad_magic() {
        let dir = temp_dir("magic");
        let path = dir.join("bad.dsw");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"NOPE").unwrap();
        assert!(load_tensor(&path).is_err());
    }

    #[test]
    fn test_classifier() {
        assert_eq!(classify("conv1_weight"), WeightClass::Conv);
        assert_eq!(classify("block2_dense"), WeightClass::Matmul);
        assert_eq!(classify("output_matmul_w"), WeightClass::Matmul);
        assert_eq!(classify("embedding_table"), WeightClass::Elementwise);
    }

    #[test]
    fn test_manifest_load_and_get() {
        let dir = temp_dir("manifest");
        let w = HostTensor::from_f32(vec![1.0, 2.0], 2).unwrap();
        save_tensor(dir.join("bias.dsw"), &w).unwrap();
        let manifest = dir.join("weights.txt");
        fs::write(&manifest, "bias.dsw\n\n").unwrap();
        let store = WeightStore::load(&manifest, None).unwrap();
        assert_eq!(store.len(), 1);
        let v = store.get(ExecKind::Local, "bias").unwrap();
        assert_eq!(v.to_host().unwrap().as_f32().unwrap(), &[1.0, 2.0]);
        assert!(matches!(
            store.get(ExecKind::Local, "missing"),
            Err(Error::UnknownWeight { .. })
        ));
        assert!(store.get(ExecKind::Accel, "bias").is_err());
    }
}
