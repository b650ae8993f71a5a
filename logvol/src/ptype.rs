use std::fmt::{Display, Formatter};
use std::str::FromStr;

use logvol_error::{LogVolError, LogVolResult, logvol_bail, logvol_err};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use num_traits::NumCast;

/// The element type of a dataset, or of a caller's memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    I64 = 7,
    F32 = 8,
    F64 = 9,
}

/// A Rust primitive with a [`PType`], stored little-endian.
pub trait NativePType: Copy + NumCast + Send + Sync + 'static {
    const PTYPE: PType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut [u8]);
}

macro_rules! native_ptype {
    ($T:ty, $ptype:ident) => {
        impl NativePType for $T {
            const PTYPE: PType = PType::$ptype;

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; size_of::<$T>()];
                buf.copy_from_slice(bytes);
                <$T>::from_le_bytes(buf)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

native_ptype!(u8, U8);
native_ptype!(u16, U16);
native_ptype!(u32, U32);
native_ptype!(u64, U64);
native_ptype!(i8, I8);
native_ptype!(i16, I16);
native_ptype!(i32, I32);
native_ptype!(i64, I64);
native_ptype!(f32, F32);
native_ptype!(f64, F64);

/// Bind `$T` to the native type of a [`PType`] and evaluate the body.
#[macro_export]
macro_rules! match_each_ptype {
    ($self:expr, | $_:tt $T:ident | $($body:tt)*) => ({
        macro_rules! __with__ {( $_ $T:ident ) => ( $($body)* )}
        use $crate::PType;
        match $self {
            PType::U8 => __with__! { u8 },
            PType::U16 => __with__! { u16 },
            PType::U32 => __with__! { u32 },
            PType::U64 => __with__! { u64 },
            PType::I8 => __with__! { i8 },
            PType::I16 => __with__! { i16 },
            PType::I32 => __with__! { i32 },
            PType::I64 => __with__! { i64 },
            PType::F32 => __with__! { f32 },
            PType::F64 => __with__! { f64 },
        }
    })
}

impl PType {
    /// Size of one element in bytes.
    pub const fn byte_width(&self) -> usize {
        match self {
            PType::U8 | PType::I8 => 1,
            PType::U16 | PType::I16 => 2,
            PType::U32 | PType::I32 | PType::F32 => 4,
            PType::U64 | PType::I64 | PType::F64 => 8,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, PType::F32 | PType::F64)
    }

    pub(crate) fn from_attr(value: i64) -> LogVolResult<Self> {
        u8::try_from(value)
            .ok()
            .and_then(|v| PType::try_from(v).ok())
            .ok_or_else(|| logvol_err!(IndexCorrupt: "unknown element type code {}", value))
    }
}

impl Display for PType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PType::U8 => write!(f, "u8"),
            PType::U16 => write!(f, "u16"),
            PType::U32 => write!(f, "u32"),
            PType::U64 => write!(f, "u64"),
            PType::I8 => write!(f, "i8"),
            PType::I16 => write!(f, "i16"),
            PType::I32 => write!(f, "i32"),
            PType::I64 => write!(f, "i64"),
            PType::F32 => write!(f, "f32"),
            PType::F64 => write!(f, "f64"),
        }
    }
}

impl FromStr for PType {
    type Err = LogVolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "u8" => PType::U8,
            "u16" => PType::U16,
            "u32" => PType::U32,
            "u64" => PType::U64,
            "i8" => PType::I8,
            "i16" => PType::I16,
            "i32" => PType::I32,
            "i64" => PType::I64,
            "f32" => PType::F32,
            "f64" => PType::F64,
            _ => logvol_bail!("unknown element type {}", s),
        })
    }
}

/// Convert the packed elements in `src` from `from` to `to`, writing them to `dst`.
///
/// Fails if a value cannot be represented in the target type.
pub fn convert(from: PType, src: &[u8], to: PType, dst: &mut [u8]) -> LogVolResult<()> {
    let n = src.len() / from.byte_width();
    if src.len() % from.byte_width() != 0 || dst.len() != n * to.byte_width() {
        logvol_bail!(
            "cannot convert {} bytes of {} into {} bytes of {}",
            src.len(),
            from,
            dst.len(),
            to
        );
    }
    if from == to {
        dst.copy_from_slice(src);
        return Ok(());
    }
    match_each_ptype!(from, |$S| convert_from::<$S>(src, to, dst))
}

fn convert_from<S: NativePType>(src: &[u8], to: PType, dst: &mut [u8]) -> LogVolResult<()> {
    match_each_ptype!(to, |$D| convert_typed::<S, $D>(src, dst))
}

fn convert_typed<S: NativePType, D: NativePType>(src: &[u8], dst: &mut [u8]) -> LogVolResult<()> {
    let src_width = S::PTYPE.byte_width();
    let dst_width = D::PTYPE.byte_width();
    for (s, d) in src.chunks_exact(src_width).zip(dst.chunks_exact_mut(dst_width)) {
        let value = S::read_le(s);
        let cast = <D as NumCast>::from(value).ok_or_else(|| {
            logvol_err!(
                "value of type {} is not representable as {}",
                S::PTYPE,
                D::PTYPE
            )
        })?;
        cast.write_le(d);
    }
    Ok(())
}

/// Pack a slice of native values into little-endian bytes.
pub fn to_le_bytes<T: NativePType>(values: &[T]) -> Vec<u8> {
    let width = T::PTYPE.byte_width();
    let mut out = vec![0u8; values.len() * width];
    for (v, chunk) in values.iter().zip(out.chunks_exact_mut(width)) {
        v.write_le(chunk);
    }
    out
}

/// Unpack little-endian bytes into native values.
pub fn from_le_bytes<T: NativePType>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::PTYPE.byte_width())
        .map(T::read_le)
        .collect()
}
