// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Hierarchical dataset container — the per-run output file format.
//!
//! A container is a flat sequence of typed, named dataset records; the
//! slash-separated record paths (`/data/<channel>/pulse_id`) form the
//! hierarchy. Written sequentially, read back by a single sequential scan.
//!
//! ## File Layout
//!
//! ```text
//! [FileHeader   : 16 bytes]
//!   magic       : [u8;8]  = b"SFDC0001"
//!   created_at  : i64     (unix seconds, LE)
//!
//! [DatasetRecord: per dataset]
//!   magic       : [u8;4]  = b"DSET"
//!   path_len    : u16     (LE), path bytes (UTF-8)
//!   dtype       : u8      (code, see DType)
//!   ndim        : u8, dims: u64 × ndim (LE)
//!   payload_len : u64     (LE)
//!   payload     : raw little-endian element bytes; strings are stored as
//!                 u32-length-prefixed UTF-8, one per element
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use tracing::debug;

use crate::error::{DaqError, Result};

pub const FILE_MAGIC: &[u8; 8] = b"SFDC0001";
pub const DATASET_MAGIC: &[u8; 4] = b"DSET";

// ─────────────────────────────── dtypes ──────────────────────────────────────

/// Element types storable in a dataset, mirroring the bsread declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
    Str,
}

impl DType {
    pub fn code(self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::U16 => 1,
            DType::U32 => 2,
            DType::U64 => 3,
            DType::I8 => 4,
            DType::I16 => 5,
            DType::I32 => 6,
            DType::I64 => 7,
            DType::F32 => 8,
            DType::F64 => 9,
            DType::Bool => 10,
            DType::Str => 11,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => DType::U8,
            1 => DType::U16,
            2 => DType::U32,
            3 => DType::U64,
            4 => DType::I8,
            5 => DType::I16,
            6 => DType::I32,
            7 => DType::I64,
            8 => DType::F32,
            9 => DType::F64,
            10 => DType::Bool,
            11 => DType::Str,
            _ => return Err(DaqError::Container(format!("unknown dtype code {code}"))),
        })
    }

    /// Fixed per-element size; strings are variable length.
    pub fn size(self) -> Option<usize> {
        match self {
            DType::U8 | DType::I8 | DType::Bool => Some(1),
            DType::U16 | DType::I16 => Some(2),
            DType::U32 | DType::I32 | DType::F32 => Some(4),
            DType::U64 | DType::I64 | DType::F64 => Some(8),
            DType::Str => None,
        }
    }

    /// Resolve a bsread channel config `type` to the target dtype.
    /// Unknown or absent types deserialize as float64.
    pub fn from_bsread(type_name: Option<&str>) -> Self {
        match type_name {
            Some("uint8") => DType::U8,
            Some("uint16") => DType::U16,
            Some("uint32") => DType::U32,
            Some("uint64") => DType::U64,
            Some("int8") => DType::I8,
            Some("int16") => DType::I16,
            Some("int32") => DType::I32,
            Some("int64") => DType::I64,
            Some("float32") => DType::F32,
            Some("bool") => DType::Bool,
            Some("string") => DType::Str,
            _ => DType::F64,
        }
    }
}

// ─────────────────────────────── datasets ────────────────────────────────────

/// One dataset as read back from a container.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub payload: Vec<u8>,
}

impl Dataset {
    /// Length of the leading axis.
    pub fn rows(&self) -> u64 {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn as_i64(&self) -> Result<Vec<i64>> {
        if self.dtype != DType::I64 {
            return Err(DaqError::Container(format!(
                "dataset holds {:?}, expected I64",
                self.dtype
            )));
        }
        let mut cursor = &self.payload[..];
        let mut values = Vec::with_capacity(self.element_count() as usize);
        while !cursor.is_empty() {
            values.push(cursor.read_i64::<LittleEndian>()?);
        }
        Ok(values)
    }

    pub fn as_u8(&self) -> Result<Vec<u8>> {
        match self.dtype {
            DType::U8 | DType::Bool => Ok(self.payload.clone()),
            other => Err(DaqError::Container(format!(
                "dataset holds {other:?}, expected U8/Bool"
            ))),
        }
    }

    pub fn as_f64(&self) -> Result<Vec<f64>> {
        let mut cursor = &self.payload[..];
        let mut values = Vec::new();
        match self.dtype {
            DType::F64 => {
                while !cursor.is_empty() {
                    values.push(cursor.read_f64::<LittleEndian>()?);
                }
            }
            DType::F32 => {
                while !cursor.is_empty() {
                    values.push(cursor.read_f32::<LittleEndian>()? as f64);
                }
            }
            other => {
                return Err(DaqError::Container(format!(
                    "dataset holds {other:?}, expected F32/F64"
                )))
            }
        }
        Ok(values)
    }

    pub fn as_strings(&self) -> Result<Vec<String>> {
        if self.dtype != DType::Str {
            return Err(DaqError::Container(format!(
                "dataset holds {:?}, expected Str",
                self.dtype
            )));
        }
        let mut cursor = &self.payload[..];
        let mut values = Vec::with_capacity(self.element_count() as usize);
        while !cursor.is_empty() {
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            if cursor.len() < len {
                return Err(DaqError::Container("truncated string element".into()));
            }
            let (bytes, rest) = cursor.split_at(len);
            values.push(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| DaqError::Container("string element is not UTF-8".into()))?,
            );
            cursor = rest;
        }
        Ok(values)
    }

    /// Check the payload size against shape × element size (fixed dtypes only).
    fn verify(&self, path: &str) -> Result<()> {
        if let Some(size) = self.dtype.size() {
            let expected = self.element_count() as usize * size;
            if expected != self.payload.len() {
                return Err(DaqError::Container(format!(
                    "dataset '{path}' payload is {} bytes, shape implies {expected}",
                    self.payload.len()
                )));
            }
        }
        Ok(())
    }
}

/// Encode strings as u32-length-prefixed UTF-8, one element after another.
pub fn encode_strings<S: AsRef<str>>(values: &[S]) -> Vec<u8> {
    let mut payload = Vec::new();
    for value in values {
        let bytes = value.as_ref().as_bytes();
        payload.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(bytes);
    }
    payload
}

// ─────────────────────────────── writer ──────────────────────────────────────

/// Sequential container writer.
pub struct ContainerWriter {
    file: BufWriter<File>,
    path: PathBuf,
    n_datasets: usize,
}

impl ContainerWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(path)
            .map_err(|e| DaqError::Container(format!("create {path:?}: {e}")))?;
        let mut file = BufWriter::new(file);

        file.write_all(FILE_MAGIC)?;
        file.write_i64::<LittleEndian>(Utc::now().timestamp())?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            n_datasets: 0,
        })
    }

    /// Append one dataset record.
    pub fn write_dataset(
        &mut self,
        dataset_path: &str,
        dtype: DType,
        shape: &[u64],
        payload: &[u8],
    ) -> Result<()> {
        if let Some(size) = dtype.size() {
            let expected = shape.iter().product::<u64>() as usize * size;
            if expected != payload.len() {
                return Err(DaqError::Container(format!(
                    "dataset '{dataset_path}' payload is {} bytes, shape {shape:?} implies {expected}",
                    payload.len()
                )));
            }
        }

        self.file.write_all(DATASET_MAGIC)?;
        self.file.write_u16::<LittleEndian>(dataset_path.len() as u16)?;
        self.file.write_all(dataset_path.as_bytes())?;
        self.file.write_u8(dtype.code())?;
        self.file.write_u8(shape.len() as u8)?;
        for dim in shape {
            self.file.write_u64::<LittleEndian>(*dim)?;
        }
        self.file.write_u64::<LittleEndian>(payload.len() as u64)?;
        self.file.write_all(payload)?;

        self.n_datasets += 1;
        Ok(())
    }

    pub fn write_i64s(&mut self, dataset_path: &str, values: &[i64]) -> Result<()> {
        let mut payload = Vec::with_capacity(values.len() * 8);
        for v in values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        self.write_dataset(dataset_path, DType::I64, &[values.len() as u64], &payload)
    }

    pub fn write_bools(&mut self, dataset_path: &str, values: &[u8]) -> Result<()> {
        self.write_dataset(dataset_path, DType::Bool, &[values.len() as u64], values)
    }

    pub fn write_strings<S: AsRef<str>>(&mut self, dataset_path: &str, values: &[S]) -> Result<()> {
        let payload = encode_strings(values);
        self.write_dataset(dataset_path, DType::Str, &[values.len() as u64], &payload)
    }

    /// Scalar UTF-8 string dataset (the `/general` parameters).
    pub fn write_string_scalar(&mut self, dataset_path: &str, value: &str) -> Result<()> {
        let payload = encode_strings(&[value]);
        self.write_dataset(dataset_path, DType::Str, &[1], &payload)
    }

    pub fn finish(mut self) -> Result<()> {
        self.file.flush()?;
        debug!(path = ?self.path, datasets = self.n_datasets, "Container file closed");
        Ok(())
    }
}

// ─────────────────────────────── reader ──────────────────────────────────────

/// A container read fully into memory, datasets indexed by path.
#[derive(Debug)]
pub struct ContainerFile {
    pub created_at: i64,
    datasets: BTreeMap<String, Dataset>,
}

impl ContainerFile {
    /// Open and sequentially scan a container file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| DaqError::Container(format!("open {path:?}: {e}")))?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|e| DaqError::Container(format!("read header {path:?}: {e}")))?;
        if &magic != FILE_MAGIC {
            return Err(DaqError::Container(format!("{path:?} is not a container file")));
        }
        let created_at = file.read_i64::<LittleEndian>()?;

        let mut datasets = BTreeMap::new();
        loop {
            let mut record_magic = [0u8; 4];
            match file.read_exact(&mut record_magic) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if &record_magic != DATASET_MAGIC {
                return Err(DaqError::Container(format!(
                    "corrupt dataset record in {path:?}"
                )));
            }

            let path_len = file.read_u16::<LittleEndian>()? as usize;
            let mut path_bytes = vec![0u8; path_len];
            file.read_exact(&mut path_bytes)?;
            let dataset_path = String::from_utf8(path_bytes)
                .map_err(|_| DaqError::Container("dataset path is not UTF-8".into()))?;

            let dtype = DType::from_code(file.read_u8()?)?;
            let ndim = file.read_u8()? as usize;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                shape.push(file.read_u64::<LittleEndian>()?);
            }

            let payload_len = file.read_u64::<LittleEndian>()? as usize;
            let mut payload = vec![0u8; payload_len];
            file.read_exact(&mut payload)?;

            let dataset = Dataset { dtype, shape, payload };
            dataset.verify(&dataset_path)?;
            datasets.insert(dataset_path, dataset);
        }

        Ok(Self { created_at, datasets })
    }

    pub fn dataset(&self, path: &str) -> Option<&Dataset> {
        self.datasets.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.datasets.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// Direct children names of a group prefix, e.g. channel names under `/data`.
    pub fn group_children(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut children: Vec<String> = self
            .datasets
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        children.sort();
        children.dedup();
        children
    }
}
