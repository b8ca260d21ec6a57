//! GVariant-compatible values.
//!
//! Every persisted structure in an installation (deploy data, summaries,
//! commits, trees, detached metadata) uses the GVariant serialization format.
//! Values are decoded once into an owned [`Variant`] tree; nothing borrows
//! from the input buffer after decoding returns.

use std::fmt;

use indexmap::IndexMap;

/// Ordered `a{sv}` dictionary. Insertion order is the serialization order.
pub type VarDict = IndexMap<String, Variant>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum VariantError {
    #[error("invalid variant type string '{0}'")]
    InvalidType(String),
    #[error("malformed {ty} value: {reason}")]
    Malformed { ty: String, reason: &'static str },
    #[error("expected variant of type {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VariantType {
    Bool,
    Byte,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Handle,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<VariantType>),
    Maybe(Box<VariantType>),
    Tuple(Vec<VariantType>),
    DictEntry(Box<VariantType>, Box<VariantType>),
}

impl VariantType {
    /// Parse a complete type string such as `(ssasta{sv})`.
    pub fn parse(signature: &str) -> Result<Self, VariantError> {
        let bytes = signature.as_bytes();
        let (ty, used) = Self::parse_one(bytes, 0)
            .ok_or_else(|| VariantError::InvalidType(signature.to_string()))?;
        if used != bytes.len() {
            return Err(VariantError::InvalidType(signature.to_string()));
        }
        Ok(ty)
    }

    fn parse_one(bytes: &[u8], pos: usize) -> Option<(Self, usize)> {
        let c = *bytes.get(pos)?;
        let basic = match c {
            b'b' => Some(Self::Bool),
            b'y' => Some(Self::Byte),
            b'n' => Some(Self::Int16),
            b'q' => Some(Self::Uint16),
            b'i' => Some(Self::Int32),
            b'u' => Some(Self::Uint32),
            b'x' => Some(Self::Int64),
            b't' => Some(Self::Uint64),
            b'h' => Some(Self::Handle),
            b'd' => Some(Self::Double),
            b's' => Some(Self::String),
            b'o' => Some(Self::ObjectPath),
            b'g' => Some(Self::Signature),
            b'v' => Some(Self::Variant),
            _ => None,
        };
        if let Some(ty) = basic {
            return Some((ty, pos + 1));
        }
        match c {
            b'a' => {
                let (elem, next) = Self::parse_one(bytes, pos + 1)?;
                Some((Self::Array(Box::new(elem)), next))
            }
            b'm' => {
                let (elem, next) = Self::parse_one(bytes, pos + 1)?;
                Some((Self::Maybe(Box::new(elem)), next))
            }
            b'(' => {
                let mut members = Vec::new();
                let mut next = pos + 1;
                loop {
                    if *bytes.get(next)? == b')' {
                        return Some((Self::Tuple(members), next + 1));
                    }
                    let (member, after) = Self::parse_one(bytes, next)?;
                    members.push(member);
                    next = after;
                }
            }
            b'{' => {
                let (key, next) = Self::parse_one(bytes, pos + 1)?;
                if !key.is_basic() {
                    return None;
                }
                let (value, next) = Self::parse_one(bytes, next)?;
                if *bytes.get(next)? != b'}' {
                    return None;
                }
                Some((Self::DictEntry(Box::new(key), Box::new(value)), next + 1))
            }
            _ => None,
        }
    }

    fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Maybe(_) | Self::Tuple(_) | Self::DictEntry(..)
        )
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        match self {
            Self::Bool | Self::Byte | Self::String | Self::ObjectPath | Self::Signature => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Handle => 4,
            Self::Int64 | Self::Uint64 | Self::Double | Self::Variant => 8,
            Self::Array(elem) | Self::Maybe(elem) => elem.alignment(),
            Self::Tuple(members) => members.iter().map(Self::alignment).max().unwrap_or(1),
            Self::DictEntry(key, value) => key.alignment().max(value.alignment()),
        }
    }

    /// Size of a fixed-size type, `None` for variable-size types.
    #[must_use]
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::Byte => Some(1),
            Self::Int16 | Self::Uint16 => Some(2),
            Self::Int32 | Self::Uint32 | Self::Handle => Some(4),
            Self::Int64 | Self::Uint64 | Self::Double => Some(8),
            Self::String
            | Self::ObjectPath
            | Self::Signature
            | Self::Variant
            | Self::Array(_)
            | Self::Maybe(_) => None,
            Self::Tuple(members) => fixed_struct_size(members.iter(), self.alignment()),
            Self::DictEntry(key, value) => {
                fixed_struct_size([key.as_ref(), value.as_ref()].into_iter(), self.alignment())
            }
        }
    }
}

fn fixed_struct_size<'a>(
    members: impl Iterator<Item = &'a VariantType>,
    alignment: usize,
) -> Option<usize> {
    let mut offset = 0usize;
    let mut any = false;
    for member in members {
        any = true;
        offset = align_up(offset, member.alignment()) + member.fixed_size()?;
    }
    if !any {
        return Some(1);
    }
    Some(align_up(offset, alignment))
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("b"),
            Self::Byte => f.write_str("y"),
            Self::Int16 => f.write_str("n"),
            Self::Uint16 => f.write_str("q"),
            Self::Int32 => f.write_str("i"),
            Self::Uint32 => f.write_str("u"),
            Self::Int64 => f.write_str("x"),
            Self::Uint64 => f.write_str("t"),
            Self::Handle => f.write_str("h"),
            Self::Double => f.write_str("d"),
            Self::String => f.write_str("s"),
            Self::ObjectPath => f.write_str("o"),
            Self::Signature => f.write_str("g"),
            Self::Variant => f.write_str("v"),
            Self::Array(elem) => write!(f, "a{elem}"),
            Self::Maybe(elem) => write!(f, "m{elem}"),
            Self::Tuple(members) => {
                f.write_str("(")?;
                for member in members {
                    write!(f, "{member}")?;
                }
                f.write_str(")")
            }
            Self::DictEntry(key, value) => write!(f, "{{{key}{value}}}"),
        }
    }
}

/// A decoded value.
#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Handle(i32),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Variant>),
    Array(VariantType, Vec<Variant>),
    Maybe(VariantType, Option<Box<Variant>>),
    Tuple(Vec<Variant>),
    DictEntry(Box<Variant>, Box<Variant>),
}

impl Variant {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn strv<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(
            VariantType::String,
            values.into_iter().map(|v| Self::String(v.into())).collect(),
        )
    }

    #[must_use]
    pub fn bytes(value: &[u8]) -> Self {
        Self::Array(
            VariantType::Byte,
            value.iter().copied().map(Self::Byte).collect(),
        )
    }

    /// Wrap `value` as a `v`.
    #[must_use]
    pub fn boxed(value: Variant) -> Self {
        Self::Variant(Box::new(value))
    }

    #[must_use]
    pub fn tuple(members: Vec<Variant>) -> Self {
        Self::Tuple(members)
    }

    /// Build an `a{sv}` from an ordered dictionary.
    #[must_use]
    pub fn vardict(dict: &VarDict) -> Self {
        let entry_ty = VariantType::DictEntry(
            Box::new(VariantType::String),
            Box::new(VariantType::Variant),
        );
        Self::Array(
            entry_ty,
            dict.iter()
                .map(|(key, value)| {
                    Self::DictEntry(
                        Box::new(Self::String(key.clone())),
                        Box::new(Self::boxed(value.clone())),
                    )
                })
                .collect(),
        )
    }

    /// Build an `a{s<T>}` dictionary with string keys and values of `value_ty`.
    #[must_use]
    pub fn string_dict(value_ty: VariantType, entries: Vec<(String, Variant)>) -> Self {
        let entry_ty = VariantType::DictEntry(Box::new(VariantType::String), Box::new(value_ty));
        Self::Array(
            entry_ty,
            entries
                .into_iter()
                .map(|(k, v)| Self::DictEntry(Box::new(Self::String(k)), Box::new(v)))
                .collect(),
        )
    }

    #[must_use]
    pub fn type_of(&self) -> VariantType {
        match self {
            Self::Bool(_) => VariantType::Bool,
            Self::Byte(_) => VariantType::Byte,
            Self::Int16(_) => VariantType::Int16,
            Self::Uint16(_) => VariantType::Uint16,
            Self::Int32(_) => VariantType::Int32,
            Self::Uint32(_) => VariantType::Uint32,
            Self::Int64(_) => VariantType::Int64,
            Self::Uint64(_) => VariantType::Uint64,
            Self::Handle(_) => VariantType::Handle,
            Self::Double(_) => VariantType::Double,
            Self::String(_) => VariantType::String,
            Self::ObjectPath(_) => VariantType::ObjectPath,
            Self::Signature(_) => VariantType::Signature,
            Self::Variant(_) => VariantType::Variant,
            Self::Array(elem, _) => VariantType::Array(Box::new(elem.clone())),
            Self::Maybe(elem, _) => VariantType::Maybe(Box::new(elem.clone())),
            Self::Tuple(members) => VariantType::Tuple(members.iter().map(Self::type_of).collect()),
            Self::DictEntry(key, value) => {
                VariantType::DictEntry(Box::new(key.type_of()), Box::new(value.type_of()))
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) | Self::Signature(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    /// Contents of an `ay`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Array(VariantType::Byte, items) => items
                .iter()
                .map(|item| match item {
                    Self::Byte(b) => Some(*b),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Contents of an `as`.
    #[must_use]
    pub fn as_strv(&self) -> Option<Vec<String>> {
        match self {
            Self::Array(VariantType::String, items) => items
                .iter()
                .map(|item| item.as_str().map(ToOwned::to_owned))
                .collect(),
            _ => None,
        }
    }

    /// Elements of any array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Variant]> {
        match self {
            Self::Array(_, items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn child(&self, index: usize) -> Option<&Variant> {
        match self {
            Self::Tuple(members) => members.get(index),
            Self::Array(_, items) => items.get(index),
            Self::DictEntry(key, value) => match index {
                0 => Some(key),
                1 => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Strip one level of `v` boxing, if present.
    #[must_use]
    pub fn unboxed(&self) -> &Variant {
        match self {
            Self::Variant(inner) => inner,
            other => other,
        }
    }

    /// Look up `key` in an `a{s*}` dictionary, unboxing `v` values.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&Variant> {
        let Self::Array(_, entries) = self else {
            return None;
        };
        entries.iter().find_map(|entry| match entry {
            Self::DictEntry(k, v) if k.as_str() == Some(key) => Some(v.unboxed()),
            _ => None,
        })
    }

    /// Convert an `a{sv}` into an ordered dictionary.
    pub fn to_vardict(&self) -> Result<VarDict, VariantError> {
        let expected = VariantType::parse("a{sv}")?;
        if self.type_of() != expected {
            return Err(VariantError::TypeMismatch {
                expected: expected.to_string(),
                found: self.type_of().to_string(),
            });
        }
        let mut dict = VarDict::new();
        if let Self::Array(_, entries) = self {
            for entry in entries {
                if let Self::DictEntry(key, value) = entry {
                    if let Some(key) = key.as_str() {
                        dict.insert(key.to_string(), value.unboxed().clone());
                    }
                }
            }
        }
        Ok(dict)
    }

    /// Serialize into the GVariant wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    /// Decode `data` as a value of type `ty`.
    pub fn from_bytes(ty: &VariantType, data: &[u8]) -> Result<Self, VariantError> {
        read_value(ty, data)
    }

    /// Decode `data` as a value of the type described by `signature`.
    pub fn parse(signature: &str, data: &[u8]) -> Result<Self, VariantError> {
        let ty = VariantType::parse(signature)?;
        read_value(&ty, data)
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bool(v) => out.push(u8::from(*v)),
            Self::Byte(v) => out.push(*v),
            Self::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int32(v) | Self::Handle(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Self::String(s) | Self::ObjectPath(s) | Self::Signature(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Self::Variant(inner) => {
                inner.write(out);
                out.push(0);
                out.extend_from_slice(inner.type_of().to_string().as_bytes());
            }
            Self::Maybe(elem, value) => {
                if let Some(value) = value {
                    value.write(out);
                    if elem.fixed_size().is_none() {
                        out.push(0);
                    }
                }
            }
            Self::Array(elem, items) => write_array(out, elem, items),
            Self::Tuple(members) => {
                let ty = self.type_of();
                write_struct(out, members.iter(), &ty);
            }
            Self::DictEntry(key, value) => {
                let ty = self.type_of();
                write_struct(out, [key.as_ref(), value.as_ref()].into_iter(), &ty);
            }
        }
    }
}

fn align_up(offset: usize, alignment: usize) -> usize {
    offset.div_ceil(alignment) * alignment
}

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    while out.len() % alignment != 0 {
        out.push(0);
    }
}

fn offset_size_for_total(total: usize) -> usize {
    if total == 0 {
        0
    } else if total <= 0xff {
        1
    } else if total <= 0xffff {
        2
    } else if total <= 0xffff_ffff {
        4
    } else {
        8
    }
}

fn offset_size_for_body(body: usize, offsets: usize) -> usize {
    if offsets == 0 {
        return offset_size_for_total(body);
    }
    for size in [1usize, 2, 4] {
        let limit = (1usize << (size * 8)) - 1;
        if body + size * offsets <= limit {
            return size;
        }
    }
    8
}

fn write_offset(out: &mut Vec<u8>, value: usize, size: usize) {
    let bytes = (value as u64).to_le_bytes();
    out.extend_from_slice(&bytes[..size]);
}

fn write_array(out: &mut Vec<u8>, elem: &VariantType, items: &[Variant]) {
    let start = out.len();
    let alignment = elem.alignment();
    if elem.fixed_size().is_some() {
        for item in items {
            pad_to(out, alignment);
            item.write(out);
        }
        return;
    }
    let mut ends = Vec::with_capacity(items.len());
    for item in items {
        pad_to(out, alignment);
        item.write(out);
        ends.push(out.len() - start);
    }
    let size = offset_size_for_body(out.len() - start, ends.len());
    for end in ends {
        write_offset(out, end, size);
    }
}

fn write_struct<'a>(
    out: &mut Vec<u8>,
    members: impl ExactSizeIterator<Item = &'a Variant>,
    ty: &VariantType,
) {
    let start = out.len();
    let count = members.len();
    let mut frames = Vec::new();
    for (index, member) in members.enumerate() {
        let member_ty = member.type_of();
        pad_to(out, member_ty.alignment());
        member.write(out);
        if member_ty.fixed_size().is_none() && index + 1 < count {
            frames.push(out.len() - start);
        }
    }
    if ty.fixed_size().is_some() {
        if count == 0 {
            out.push(0);
        } else {
            pad_to(out, ty.alignment());
        }
        return;
    }
    let size = offset_size_for_body(out.len() - start, frames.len());
    for end in frames.into_iter().rev() {
        write_offset(out, end, size);
    }
}

fn malformed(ty: &VariantType, reason: &'static str) -> VariantError {
    VariantError::Malformed {
        ty: ty.to_string(),
        reason,
    }
}

fn read_offset(data: &[u8], size: usize) -> usize {
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&data[..size]);
    u64::from_le_bytes(buf) as usize
}

fn fixed<const N: usize>(ty: &VariantType, data: &[u8]) -> Result<[u8; N], VariantError> {
    data.try_into().map_err(|_| malformed(ty, "wrong size"))
}

fn read_value(ty: &VariantType, data: &[u8]) -> Result<Variant, VariantError> {
    Ok(match ty {
        VariantType::Bool => Variant::Bool(fixed::<1>(ty, data)?[0] != 0),
        VariantType::Byte => Variant::Byte(fixed::<1>(ty, data)?[0]),
        VariantType::Int16 => Variant::Int16(i16::from_le_bytes(fixed(ty, data)?)),
        VariantType::Uint16 => Variant::Uint16(u16::from_le_bytes(fixed(ty, data)?)),
        VariantType::Int32 => Variant::Int32(i32::from_le_bytes(fixed(ty, data)?)),
        VariantType::Handle => Variant::Handle(i32::from_le_bytes(fixed(ty, data)?)),
        VariantType::Uint32 => Variant::Uint32(u32::from_le_bytes(fixed(ty, data)?)),
        VariantType::Int64 => Variant::Int64(i64::from_le_bytes(fixed(ty, data)?)),
        VariantType::Uint64 => Variant::Uint64(u64::from_le_bytes(fixed(ty, data)?)),
        VariantType::Double => Variant::Double(f64::from_bits(u64::from_le_bytes(fixed(ty, data)?))),
        VariantType::String | VariantType::ObjectPath | VariantType::Signature => {
            let (last, body) = data
                .split_last()
                .ok_or_else(|| malformed(ty, "empty string"))?;
            if *last != 0 || body.contains(&0) {
                return Err(malformed(ty, "string is not nul-terminated"));
            }
            let text = std::str::from_utf8(body)
                .map_err(|_| malformed(ty, "string is not utf-8"))?
                .to_string();
            match ty {
                VariantType::String => Variant::String(text),
                VariantType::ObjectPath => Variant::ObjectPath(text),
                _ => Variant::Signature(text),
            }
        }
        VariantType::Variant => {
            let sep = data
                .iter()
                .rposition(|b| *b == 0)
                .ok_or_else(|| malformed(ty, "missing type separator"))?;
            let signature = std::str::from_utf8(&data[sep + 1..])
                .map_err(|_| malformed(ty, "type string is not utf-8"))?;
            let child_ty = VariantType::parse(signature)?;
            Variant::Variant(Box::new(read_value(&child_ty, &data[..sep])?))
        }
        VariantType::Maybe(elem) => {
            if data.is_empty() {
                Variant::Maybe((**elem).clone(), None)
            } else if elem.fixed_size().is_some() {
                Variant::Maybe((**elem).clone(), Some(Box::new(read_value(elem, data)?)))
            } else {
                let (last, body) = data
                    .split_last()
                    .ok_or_else(|| malformed(ty, "empty maybe"))?;
                if *last != 0 {
                    return Err(malformed(ty, "maybe is missing its trailer"));
                }
                Variant::Maybe((**elem).clone(), Some(Box::new(read_value(elem, body)?)))
            }
        }
        VariantType::Array(elem) => Variant::Array((**elem).clone(), read_array(ty, elem, data)?),
        VariantType::Tuple(members) => Variant::Tuple(read_struct(ty, members, data)?),
        VariantType::DictEntry(key, value) => {
            let members = [(**key).clone(), (**value).clone()];
            let mut values = read_struct(ty, &members, data)?.into_iter();
            match (values.next(), values.next()) {
                (Some(k), Some(v)) => Variant::DictEntry(Box::new(k), Box::new(v)),
                _ => return Err(malformed(ty, "dictionary entry is incomplete")),
            }
        }
    })
}

fn read_array(
    ty: &VariantType,
    elem: &VariantType,
    data: &[u8],
) -> Result<Vec<Variant>, VariantError> {
    if let Some(size) = elem.fixed_size() {
        if data.len() % size != 0 {
            return Err(malformed(ty, "array length is not a multiple of element size"));
        }
        return data.chunks(size).map(|chunk| read_value(elem, chunk)).collect();
    }
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let size = offset_size_for_total(data.len());
    let last_end = read_offset(&data[data.len() - size..], size);
    if last_end > data.len() {
        return Err(malformed(ty, "framing offset out of range"));
    }
    let frames = &data[last_end..];
    if frames.len() % size != 0 {
        return Err(malformed(ty, "framing offsets are misaligned"));
    }
    let alignment = elem.alignment();
    let mut items = Vec::with_capacity(frames.len() / size);
    let mut pos = 0usize;
    for frame in frames.chunks(size) {
        let end = read_offset(frame, size);
        let start = align_up(pos, alignment);
        if start > end || end > last_end {
            return Err(malformed(ty, "element bounds out of range"));
        }
        items.push(read_value(elem, &data[start..end])?);
        pos = end;
    }
    Ok(items)
}

fn read_struct(
    ty: &VariantType,
    members: &[VariantType],
    data: &[u8],
) -> Result<Vec<Variant>, VariantError> {
    if members.is_empty() {
        return Ok(Vec::new());
    }
    let size = offset_size_for_total(data.len());
    let framed = members[..members.len() - 1]
        .iter()
        .filter(|m| m.fixed_size().is_none())
        .count();
    let frame_end = data
        .len()
        .checked_sub(framed * size)
        .ok_or_else(|| malformed(ty, "framing offsets exceed container"))?;
    let mut values = Vec::with_capacity(members.len());
    let mut pos = 0usize;
    let mut consumed = 0usize;
    for (index, member) in members.iter().enumerate() {
        let start = align_up(pos, member.alignment());
        let end = if let Some(fixed) = member.fixed_size() {
            start + fixed
        } else if index + 1 == members.len() {
            frame_end
        } else {
            consumed += 1;
            let at = data.len() - consumed * size;
            read_offset(&data[at..at + size], size)
        };
        if start > end || end > frame_end {
            return Err(malformed(ty, "member bounds out of range"));
        }
        values.push(read_value(member, &data[start..end])?);
        pos = end;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_signatures() -> anyhow::Result<()> {
        for sig in ["(ssasta{sv})", "a(s(taya{sv}))", "(a{s(ayaaya{sv})}a{sv})", "mas", "()"] {
            assert_eq!(VariantType::parse(sig)?.to_string(), sig);
        }
        assert!(VariantType::parse("a{vs}").is_err());
        assert!(VariantType::parse("(s").is_err());
        assert!(VariantType::parse("ss").is_err());
        Ok(())
    }

    #[test]
    fn fixed_sizes_follow_alignment() -> anyhow::Result<()> {
        assert_eq!(VariantType::parse("(yt)")?.fixed_size(), Some(16));
        assert_eq!(VariantType::parse("(ty)")?.fixed_size(), Some(16));
        assert_eq!(VariantType::parse("(ut)")?.fixed_size(), Some(16));
        assert_eq!(VariantType::parse("()")?.fixed_size(), Some(1));
        assert_eq!(VariantType::parse("(sy)")?.fixed_size(), None);
        Ok(())
    }

    #[test]
    fn strings_and_string_arrays_match_reference_encoding() {
        assert_eq!(Variant::string("ab").to_bytes(), b"ab\0");
        // ["a", "bc"] => "a\0bc\0" followed by 1-byte end offsets 2 and 5.
        assert_eq!(
            Variant::strv(["a", "bc"]).to_bytes(),
            vec![b'a', 0, b'b', b'c', 0, 2, 5]
        );
    }

    #[test]
    fn boxed_values_carry_their_type() {
        let encoded = Variant::boxed(Variant::Int32(7)).to_bytes();
        assert_eq!(encoded, vec![7, 0, 0, 0, 0, b'i']);
    }

    #[test]
    fn struct_with_trailing_variable_member_has_one_frame() -> anyhow::Result<()> {
        let value = Variant::tuple(vec![
            Variant::string("x"),
            Variant::Uint64(1),
            Variant::string("yz"),
        ]);
        let bytes = value.to_bytes();
        // "x\0" pad to 8, u64, "yz\0", then a single frame offset (2).
        assert_eq!(bytes.len(), 8 + 8 + 3 + 1);
        assert_eq!(*bytes.last().unwrap_or(&0), 2);
        let decoded = Variant::parse("(sts)", &bytes)?;
        assert_eq!(decoded, value);
        Ok(())
    }

    #[test]
    fn nested_dictionaries_decode() -> anyhow::Result<()> {
        let mut dict = VarDict::new();
        dict.insert("deploy-version".into(), Variant::Int32(4));
        dict.insert("previous-ids".into(), Variant::strv(["org.old.App"]));
        dict.insert(
            "rating".into(),
            Variant::tuple(vec![
                Variant::string("oars-1.1"),
                Variant::string_dict(
                    VariantType::String,
                    vec![("violence-cartoon".into(), Variant::string("mild"))],
                ),
            ]),
        );
        let encoded = Variant::vardict(&dict).to_bytes();
        let decoded = Variant::parse("a{sv}", &encoded)?.to_vardict()?;
        assert_eq!(decoded, dict);
        assert_eq!(
            decoded
                .get("rating")
                .and_then(|r| r.child(1))
                .and_then(|m| m.lookup("violence-cartoon"))
                .and_then(Variant::as_str),
            Some("mild")
        );
        Ok(())
    }

    #[test]
    fn large_arrays_switch_to_wider_offsets() -> anyhow::Result<()> {
        let names: Vec<String> = (0..200).map(|i| format!("name-{i:04}")).collect();
        let value = Variant::strv(names.clone());
        let decoded = Variant::parse("as", &value.to_bytes())?;
        assert_eq!(decoded.as_strv(), Some(names));
        Ok(())
    }

    #[test]
    fn maybe_values_roundtrip_through_both_forms() -> anyhow::Result<()> {
        let nothing = Variant::Maybe(VariantType::String, None);
        assert!(nothing.to_bytes().is_empty());
        let just = Variant::Maybe(VariantType::String, Some(Box::new(Variant::string("a"))));
        assert_eq!(just.to_bytes(), vec![b'a', 0, 0]);
        assert_eq!(Variant::parse("ms", &just.to_bytes())?, just);
        Ok(())
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = Variant::strv(["abc", "def"]).to_bytes();
        assert!(Variant::parse("as", &bytes[..bytes.len() - 1]).is_err());
        assert!(Variant::parse("t", &[1, 2, 3]).is_err());
        assert!(Variant::parse("s", b"abc").is_err());
    }
}
