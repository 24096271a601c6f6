use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, Result};

const GGUF_MAGIC: u32 = 0x4655_4747;
const GGML_MAGIC: u32 = 0x6767_6d6c;
const GGMF_MAGIC: u32 = 0x6767_6d66;
const GGJT_MAGIC: u32 = 0x6767_6a74;
const GGLA_MAGIC: u32 = 0x6767_6c61;

/// What the model builder needs to know about a weights file: just enough of
/// the header to fill in the config blob.
#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
    pub model_format: String,
    pub model_family: String,
    pub model_type: String,
    pub file_type: String,
}

/// Reads the container header and metadata of a weights file. Tensor data is
/// never touched.
pub fn probe<P: AsRef<Path>>(path: P) -> Result<ModelInfo> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);

    let magic = read_u32(&mut reader)?;
    match magic {
        GGUF_MAGIC => probe_gguf(&mut reader),
        GGML_MAGIC | GGMF_MAGIC | GGJT_MAGIC | GGLA_MAGIC => Ok(ModelInfo {
            model_format: "ggml".to_string(),
            model_family: "llama".to_string(),
            model_type: "unknown".to_string(),
            file_type: "unknown".to_string(),
        }),
        _ => bail!("unknown model format, magic {:08x}", magic),
    }
}

fn probe_gguf<R: Read>(reader: &mut R) -> Result<ModelInfo> {
    let version = read_u32(reader)?;
    if !(1..=3).contains(&version) {
        bail!("unsupported gguf version {}", version);
    }

    let _tensor_count = read_u64(reader)?;
    let kv_count = read_u64(reader)?;

    let mut info = ModelInfo {
        model_format: "gguf".to_string(),
        model_family: "llama".to_string(),
        model_type: "unknown".to_string(),
        file_type: "unknown".to_string(),
    };

    let mut block_count: Option<u64> = None;

    for _ in 0..kv_count {
        let key = read_string(reader)?;
        let value = read_value(reader)?;

        match key.as_str() {
            "general.architecture" => {
                if let Value::String(s) = &value {
                    info.model_family = s.clone();
                }
            }
            "general.file_type" => {
                if let Some(n) = value.as_u64() {
                    info.file_type = file_type_name(n as u32).to_string();
                }
            }
            _ if key.ends_with(".block_count") => {
                block_count = value.as_u64();
            }
            _ => {}
        }
    }

    if let Some(blocks) = block_count {
        info.model_type = model_type_from_blocks(blocks).to_string();
    }

    Ok(info)
}

// parameter-count bucket by transformer depth
fn model_type_from_blocks(blocks: u64) -> &'static str {
    match blocks {
        26 => "3B",
        32 => "7B",
        40 => "13B",
        48 => "34B",
        60 => "30B",
        80 => "65B",
        _ => "unknown",
    }
}

fn file_type_name(v: u32) -> &'static str {
    match v {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        _ => "unknown",
    }
}

#[derive(Debug)]
enum Value {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array,
}

impl Value {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            Value::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }
}

fn read_value<R: Read>(reader: &mut R) -> Result<Value> {
    let kind = read_u32(reader)?;
    read_value_of_kind(reader, kind)
}

fn read_value_of_kind<R: Read>(reader: &mut R, kind: u32) -> Result<Value> {
    Ok(match kind {
        0 => Value::Uint(read_u8(reader)? as u64),
        1 => Value::Int(read_u8(reader)? as i8 as i64),
        2 => Value::Uint(read_u16(reader)? as u64),
        3 => Value::Int(read_u16(reader)? as i16 as i64),
        4 => Value::Uint(read_u32(reader)? as u64),
        5 => Value::Int(read_u32(reader)? as i32 as i64),
        6 => Value::Float(read_f32(reader)? as f64),
        7 => Value::Bool(read_u8(reader)? != 0),
        8 => Value::String(read_string(reader)?),
        9 => {
            // arrays are skipped element by element; the probe needs none of them
            let elem_kind = read_u32(reader)?;
            let len = read_u64(reader)?;
            for _ in 0..len {
                read_value_of_kind(reader, elem_kind)?;
            }
            Value::Array
        }
        10 => Value::Uint(read_u64(reader)?),
        11 => Value::Int(read_u64(reader)? as i64),
        12 => Value::Float(read_f64(reader)?),
        other => bail!("unknown gguf metadata value type {}", other),
    })
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u64(r)? as usize;
    if len > 1 << 20 {
        bail!("gguf metadata string too long: {} bytes", len);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn put_string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u64).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    fn gguf_fixture(kvs: &[(&str, u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes()); // version
        out.extend_from_slice(&0u64.to_le_bytes()); // tensors
        out.extend_from_slice(&(kvs.len() as u64).to_le_bytes());
        for (key, kind, payload) in kvs {
            put_string(&mut out, key);
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn probe_reads_family_type_and_file_type() {
        let mut arch = Vec::new();
        put_string(&mut arch, "llama");

        let fixture = gguf_fixture(&[
            ("general.architecture", 8, arch),
            ("general.file_type", 4, 2u32.to_le_bytes().to_vec()),
            ("llama.block_count", 4, 80u32.to_le_bytes().to_vec()),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.gguf");
        std::fs::File::create(&path).unwrap().write_all(&fixture).unwrap();

        let info = probe(&path).unwrap();
        assert_eq!(info.model_format, "gguf");
        assert_eq!(info.model_family, "llama");
        assert_eq!(info.model_type, "65B");
        assert_eq!(info.file_type, "Q4_0");
    }

    #[test]
    fn probe_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        std::fs::File::create(&path).unwrap().write_all(b"not a model").unwrap();
        assert!(probe(&path).is_err());
    }
}
