//! Field bridge for host structs pushed into the VM
//!
//! A struct becomes visible to scripts by implementing [`FieldAccess`],
//! usually through the [`expose_fields!`](crate::expose_fields) macro. Reads
//! and writes go through the closed set of [`FieldValue`] variants:
//!
//! | field type                          | kind     | VM value |
//! |-------------------------------------|----------|----------|
//! | `bool`                              | `Bool`   | boolean  |
//! | `i8` .. `i64`, `isize`              | `Int`    | number   |
//! | `u8` .. `u64`, `usize`              | `Uint`   | number   |
//! | `f32`, `f64`                        | `Float`  | number   |
//! | `String`                            | `String` | string   |
//! | `Vec<u8>`                           | `Bytes`  | string   |
//!
//! `Option<T>` and `Box<T>` add one level of indirection over a supported
//! type. Anything else can still be declared as a field by wrapping it in
//! [`Opaque`]; scripts touching it get an "unsupported type" error.
//!
//! A write never mutates the struct unless the assigned VM value matches the
//! field kind and fits the field's width.

use crate::error::BridgeError;
use crate::trace;
use mlua_sys as ffi;
use std::os::raw::c_int;

/// Kind of an exposed field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `bool`
    Bool,
    /// Signed integer of any width
    Int,
    /// Unsigned integer of any width
    Uint,
    /// Floating point of any width
    Float,
    /// UTF-8 string
    String,
    /// Byte sequence
    Bytes,
    /// Declared but not representable in the VM
    Unsupported,
}

/// Value read from or written to a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Empty optional field (read only)
    Nil,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    Uint(u64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Byte sequence
    Bytes(Vec<u8>),
}

/// Field type with a VM representation
pub trait FieldType {
    /// Kind reported for fields of this type
    const KIND: FieldKind;

    /// Declared type name, used in "unsupported type" errors
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Current value, or `None` if the type is unsupported
    fn get(&self) -> Option<FieldValue>;

    /// Store `value`; returns `false` (leaving `self` untouched) on mismatch
    fn set(&mut self, value: FieldValue) -> bool;
}

/// Host struct whose fields scripts may read and write by name
pub trait FieldAccess: Send {
    /// Name of the struct type
    fn type_name(&self) -> &'static str;

    /// Kind of the named field, `None` if there is no such field
    fn field_kind(&self, name: &str) -> Option<FieldKind>;

    /// Declared type of the named field
    fn field_type_name(&self, name: &str) -> Option<&'static str>;

    /// Read a field
    fn get_field(&self, name: &str) -> Result<FieldValue, BridgeError>;

    /// Write a field
    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), BridgeError>;
}

/// Field type the VM cannot represent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Opaque<T>(pub T);

impl<T> FieldType for Opaque<T> {
    const KIND: FieldKind = FieldKind::Unsupported;

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn get(&self) -> Option<FieldValue> {
        None
    }

    fn set(&mut self, _value: FieldValue) -> bool {
        false
    }
}

impl FieldType for bool {
    const KIND: FieldKind = FieldKind::Bool;

    fn get(&self) -> Option<FieldValue> {
        Some(FieldValue::Bool(*self))
    }

    fn set(&mut self, value: FieldValue) -> bool {
        match value {
            FieldValue::Bool(b) => {
                *self = b;
                true
            }
            _ => false,
        }
    }
}

macro_rules! signed_field {
    ($($ty:ty),*) => {$(
        impl FieldType for $ty {
            const KIND: FieldKind = FieldKind::Int;

            fn get(&self) -> Option<FieldValue> {
                Some(FieldValue::Int(*self as i64))
            }

            fn set(&mut self, value: FieldValue) -> bool {
                let converted = match value {
                    FieldValue::Int(v) => <$ty>::try_from(v).ok(),
                    _ => None,
                };
                match converted {
                    Some(v) => {
                        *self = v;
                        true
                    }
                    None => false,
                }
            }
        }
    )*};
}

macro_rules! unsigned_field {
    ($($ty:ty),*) => {$(
        impl FieldType for $ty {
            const KIND: FieldKind = FieldKind::Uint;

            fn get(&self) -> Option<FieldValue> {
                Some(FieldValue::Uint(*self as u64))
            }

            fn set(&mut self, value: FieldValue) -> bool {
                let converted = match value {
                    FieldValue::Uint(v) => <$ty>::try_from(v).ok(),
                    _ => None,
                };
                match converted {
                    Some(v) => {
                        *self = v;
                        true
                    }
                    None => false,
                }
            }
        }
    )*};
}

signed_field!(i8, i16, i32, i64, isize);
unsigned_field!(u8, u16, u32, u64, usize);

impl FieldType for f64 {
    const KIND: FieldKind = FieldKind::Float;

    fn get(&self) -> Option<FieldValue> {
        Some(FieldValue::Float(*self))
    }

    fn set(&mut self, value: FieldValue) -> bool {
        match value {
            FieldValue::Float(v) => {
                *self = v;
                true
            }
            _ => false,
        }
    }
}

impl FieldType for f32 {
    const KIND: FieldKind = FieldKind::Float;

    fn get(&self) -> Option<FieldValue> {
        Some(FieldValue::Float(*self as f64))
    }

    fn set(&mut self, value: FieldValue) -> bool {
        match value {
            FieldValue::Float(v) => {
                *self = v as f32;
                true
            }
            _ => false,
        }
    }
}

impl FieldType for String {
    const KIND: FieldKind = FieldKind::String;

    fn get(&self) -> Option<FieldValue> {
        Some(FieldValue::String(self.clone()))
    }

    fn set(&mut self, value: FieldValue) -> bool {
        match value {
            FieldValue::String(s) => {
                *self = s;
                true
            }
            _ => false,
        }
    }
}

impl FieldType for Vec<u8> {
    const KIND: FieldKind = FieldKind::Bytes;

    fn get(&self) -> Option<FieldValue> {
        Some(FieldValue::Bytes(self.clone()))
    }

    fn set(&mut self, value: FieldValue) -> bool {
        match value {
            FieldValue::Bytes(b) => {
                *self = b;
                true
            }
            _ => false,
        }
    }
}

impl<T: FieldType + Default> FieldType for Option<T> {
    const KIND: FieldKind = T::KIND;

    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    fn get(&self) -> Option<FieldValue> {
        match self {
            Some(inner) => inner.get(),
            None if T::KIND == FieldKind::Unsupported => None,
            None => Some(FieldValue::Nil),
        }
    }

    fn set(&mut self, value: FieldValue) -> bool {
        match self {
            Some(inner) => inner.set(value),
            None => {
                let mut inner = T::default();
                if !inner.set(value) {
                    return false;
                }
                *self = Some(inner);
                true
            }
        }
    }
}

impl<T: FieldType> FieldType for Box<T> {
    const KIND: FieldKind = T::KIND;

    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    fn get(&self) -> Option<FieldValue> {
        (**self).get()
    }

    fn set(&mut self, value: FieldValue) -> bool {
        (**self).set(value)
    }
}

/// Implement [`FieldAccess`] for a struct by listing the fields to expose
///
/// ```
/// use luabridge::expose_fields;
///
/// #[derive(Default)]
/// struct Player {
///     name: String,
///     level: u8,
///     alive: bool,
/// }
///
/// expose_fields!(Player { name, level, alive });
/// ```
#[macro_export]
macro_rules! expose_fields {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::FieldAccess for $ty {
            fn type_name(&self) -> &'static str {
                ::std::any::type_name::<$ty>()
            }

            fn field_kind(&self, name: &str) -> ::std::option::Option<$crate::FieldKind> {
                match name {
                    $(stringify!($field) => ::std::option::Option::Some(
                        $crate::fields::kind_of(&self.$field)
                    ),)*
                    _ => ::std::option::Option::None,
                }
            }

            fn field_type_name(&self, name: &str) -> ::std::option::Option<&'static str> {
                match name {
                    $(stringify!($field) => ::std::option::Option::Some(
                        $crate::fields::type_name_of(&self.$field)
                    ),)*
                    _ => ::std::option::Option::None,
                }
            }

            fn get_field(
                &self,
                name: &str,
            ) -> ::std::result::Result<$crate::FieldValue, $crate::BridgeError> {
                match name {
                    $(stringify!($field) => $crate::fields::read_field(name, &self.$field),)*
                    _ => ::std::result::Result::Err($crate::BridgeError::UnknownField(name.to_string())),
                }
            }

            fn set_field(
                &mut self,
                name: &str,
                value: $crate::FieldValue,
            ) -> ::std::result::Result<(), $crate::BridgeError> {
                match name {
                    $(stringify!($field) => $crate::fields::write_field(name, &mut self.$field, value),)*
                    _ => ::std::result::Result::Err($crate::BridgeError::UnknownField(name.to_string())),
                }
            }
        }
    };
}

#[doc(hidden)]
pub fn kind_of<T: FieldType>(_field: &T) -> FieldKind {
    T::KIND
}

#[doc(hidden)]
pub fn type_name_of<T: FieldType>(_field: &T) -> &'static str {
    T::type_name()
}

#[doc(hidden)]
pub fn read_field<T: FieldType>(name: &str, field: &T) -> Result<FieldValue, BridgeError> {
    field.get().ok_or_else(|| BridgeError::UnsupportedFieldType {
        field: name.to_string(),
        type_name: T::type_name().to_string(),
    })
}

#[doc(hidden)]
pub fn write_field<T: FieldType>(
    name: &str,
    field: &mut T,
    value: FieldValue,
) -> Result<(), BridgeError> {
    if T::KIND == FieldKind::Unsupported {
        return Err(BridgeError::UnsupportedFieldType {
            field: name.to_string(),
            type_name: T::type_name().to_string(),
        });
    }
    if field.set(value) {
        Ok(())
    } else {
        Err(BridgeError::WrongAssignment(name.to_string()))
    }
}

// ============================================================================
// VM conversion
// ============================================================================

/// Push a field value onto the VM stack
pub(crate) unsafe fn push_value(l: *mut ffi::lua_State, value: &FieldValue) {
    match value {
        FieldValue::Nil => ffi::lua_pushnil(l),
        FieldValue::Bool(b) => ffi::lua_pushboolean(l, *b as c_int),
        FieldValue::Int(v) => ffi::lua_pushinteger(l, *v),
        FieldValue::Uint(v) => ffi::lua_pushinteger(l, *v as ffi::lua_Integer),
        FieldValue::Float(v) => ffi::lua_pushnumber(l, *v),
        FieldValue::String(s) => {
            ffi::lua_pushlstring(l, s.as_ptr() as *const _, s.len());
        }
        FieldValue::Bytes(b) => {
            ffi::lua_pushlstring(l, b.as_ptr() as *const _, b.len());
        }
    }
}

/// Integer value of a number slot, accepting integral floats
unsafe fn integer_at(l: *mut ffi::lua_State, idx: c_int) -> Option<i64> {
    let mut isnum: c_int = 0;
    let value = ffi::lua_tointegerx(l, idx, &mut isnum);
    (isnum != 0).then_some(value)
}

/// Convert the VM value at `idx` for a field of `kind`
///
/// Returns `None` when the VM type tag does not match the kind or the number
/// has no exact integer representation.
pub(crate) unsafe fn read_value(
    l: *mut ffi::lua_State,
    idx: c_int,
    kind: FieldKind,
) -> Option<FieldValue> {
    let tag = ffi::lua_type(l, idx);
    match kind {
        FieldKind::Bool if tag == ffi::LUA_TBOOLEAN => {
            Some(FieldValue::Bool(ffi::lua_toboolean(l, idx) != 0))
        }
        FieldKind::Int if tag == ffi::LUA_TNUMBER => integer_at(l, idx).map(FieldValue::Int),
        FieldKind::Uint if tag == ffi::LUA_TNUMBER => {
            integer_at(l, idx).map(|v| FieldValue::Uint(v as u64))
        }
        FieldKind::Float if tag == ffi::LUA_TNUMBER => {
            Some(FieldValue::Float(ffi::lua_tonumberx(l, idx, std::ptr::null_mut())))
        }
        FieldKind::String if tag == ffi::LUA_TSTRING => trace::string_at(l, idx)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(FieldValue::String),
        FieldKind::Bytes if tag == ffi::LUA_TSTRING => {
            trace::string_at(l, idx).map(FieldValue::Bytes)
        }
        _ => None,
    }
}
