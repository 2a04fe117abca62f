//! The decoded representation handed to handlers: file metadata, variables,
//! values and label keys.

use std::fmt;

use chrono::NaiveDateTime;
use ordered_float::OrderedFloat;

/// Format family of a decoded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Spss,
    Sas,
    Stata,
}

/// Concrete file layout picked by the sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// SPSS system file.
    Sav,
    /// SPSS system file with zlib-compressed data.
    Zsav,
    /// SPSS portable file.
    Por,
    Sas7bdat,
    /// SAS transport (XPORT) version 5.
    Xport,
    Dta,
}

impl FileKind {
    pub fn family(self) -> FileFormat {
        match self {
            FileKind::Sav | FileKind::Zsav | FileKind::Por => FileFormat::Spss,
            FileKind::Sas7bdat | FileKind::Xport => FileFormat::Sas,
            FileKind::Dta => FileFormat::Stata,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Sav => "sav",
            FileKind::Zsav => "zsav",
            FileKind::Por => "por",
            FileKind::Sas7bdat => "sas7bdat",
            FileKind::Xport => "xpt",
            FileKind::Dta => "dta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Least significant byte first.
    LSF,
    /// Most significant byte first.
    MSF,
}

impl ByteOrder {
    pub fn nom(self) -> nom::number::Endianness {
        match self {
            ByteOrder::LSF => nom::number::Endianness::Little,
            ByteOrder::MSF => nom::number::Endianness::Big,
        }
    }
}

/// Row data compression scheme declared by the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    /// SPSS bias/bytecode compression.
    Bytecode,
    /// SPSS ZSAV: zlib blocks around bytecode compression.
    Zlib,
    /// SAS `SASYZCRL` run-length compression.
    Rle,
    /// SAS `SASYZCR2` Ross data compression.
    Rdc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub row_count: u64,
    pub var_count: usize,
    /// Label of the encoding text was decoded with.
    pub encoding: String,
    pub format: FileFormat,
    pub kind: FileKind,
    /// Format release or version number, as the file states it.
    pub version: u32,
    pub byteorder: ByteOrder,
    pub compressed: bool,
    pub compression: Compression,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub file_label: Option<String>,
    pub table_name: Option<String>,
}

/// How a column is physically stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Int8,
    Int16,
    Int32,
    Float,
    Double,
    /// Fixed-width text of the given byte width.
    Text(u32),
    /// Variable-length text stored out of line (Stata strL).
    LongText,
}

impl StorageType {
    pub fn value_type(self) -> ValueType {
        match self {
            StorageType::Text(_) | StorageType::LongText => ValueType::Text,
            _ => ValueType::Numeric,
        }
    }

    /// Bytes one cell of this type occupies in a fixed-width row, if fixed.
    pub fn width(self) -> Option<usize> {
        match self {
            StorageType::Int8 => Some(1),
            StorageType::Int16 => Some(2),
            StorageType::Int32 | StorageType::Float => Some(4),
            StorageType::Double => Some(8),
            StorageType::Text(n) => Some(n as usize),
            StorageType::LongText => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Numeric,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    Nominal,
    Ordinal,
    Scale,
    Unknown,
}

impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Measure::Nominal => "nominal",
            Measure::Ordinal => "ordinal",
            Measure::Scale => "scale",
            Measure::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alignment {
    Left,
    Center,
    Right,
    Unknown,
}

/// Identifies one value-label dictionary within a single decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSetId(pub u32);

impl fmt::Display for LabelSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "labels{}", self.0)
    }
}

/// User-declared missing values of a variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissingValues {
    pub values: Vec<Value>,
    /// Inclusive numeric range.
    pub range: Option<(f64, f64)>,
}

impl MissingValues {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.range.is_none()
    }

    /// True for system missing and for any user-declared missing value.
    pub fn contains(&self, value: &Value) -> bool {
        if value.is_missing() {
            return true;
        }
        if let (Some((low, high)), Some(x)) = (self.range, value.as_f64()) {
            if low <= x && x <= high {
                return true;
            }
        }
        self.values.iter().any(|m| m.label_key() == value.label_key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub index: usize,
    pub name: String,
    pub label: Option<String>,
    pub storage: StorageType,
    pub value_type: ValueType,
    pub measure: Measure,
    pub alignment: Alignment,
    pub print_format: Option<String>,
    pub display_width: Option<u32>,
    pub missing: MissingValues,
    pub label_set: Option<LabelSetId>,
}

impl Variable {
    pub fn new(index: usize, name: String, storage: StorageType) -> Variable {
        Variable {
            index,
            name,
            label: None,
            storage,
            value_type: storage.value_type(),
            measure: Measure::Unknown,
            alignment: Alignment::Unknown,
            print_format: None,
            display_width: None,
            missing: MissingValues::default(),
            label_set: None,
        }
    }
}

/// One cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Float(f32),
    Double(f64),
    Text(String),
    SystemMissing,
    /// Extended missing value: `a`-`z` for Stata, `A`-`Z` or `_` for SAS.
    TaggedMissing(char),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::SystemMissing | Value::TaggedMissing(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int8(v) => Some(v as f64),
            Value::Int16(v) => Some(v as f64),
            Value::Int32(v) => Some(v as f64),
            Value::Float(v) => Some(v as f64),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Key under which this value is looked up in a label dictionary.
    /// System missing has none, so it never resolves to a label.
    pub fn label_key(&self) -> Option<LabelKey> {
        match self {
            Value::Text(s) => Some(LabelKey::Text(s.clone())),
            Value::TaggedMissing(c) => Some(LabelKey::Tagged(*c)),
            Value::SystemMissing => None,
            v => v.as_f64().map(|x| LabelKey::Number(OrderedFloat(x))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::SystemMissing => f.write_str("."),
            Value::TaggedMissing(c) => write!(f, ".{c}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LabelKey {
    Number(OrderedFloat<f64>),
    Text(String),
    Tagged(char),
}
